use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::doc;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::models::{
    contract::{Contract, ContractStatus, Milestone},
    ensure_positive_amount,
    hire_request::{HireNowRequest, HireRequestStatus},
    new_id,
    notification::NotificationKind,
    project::{Budget, BudgetType, Project, ProjectStatus},
    user::Role,
};
use crate::notifications::{notify_quietly, NewNotification};
use crate::users::find_user;

const DIRECT_HIRE_CATEGORY: &str = "direct-hire";

#[derive(Debug, Deserialize)]
pub struct CreateHireRequest {
    pub freelancer_id: String,
    pub title: String,
    pub description: String,
    pub budget: i64,
}

impl CreateHireRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.title.trim().is_empty() {
            return Err(AppError::bad_request("Title is required"));
        }
        if self.description.trim().is_empty() {
            return Err(AppError::bad_request("Description is required"));
        }
        ensure_positive_amount("Budget", self.budget)
    }
}

/// Project and single-milestone contract created when a direct offer is accepted.
pub fn hire_into_contract(request: &HireNowRequest, now: DateTime<Utc>) -> (Project, Contract) {
    let project = Project {
        id: new_id(),
        client_id: request.client_id.clone(),
        title: request.title.clone(),
        description: request.description.clone(),
        category: DIRECT_HIRE_CATEGORY.to_string(),
        skills: Vec::new(),
        budget: Budget {
            budget_type: BudgetType::Fixed,
            min: request.budget,
            max: request.budget,
        },
        deadline: None,
        status: ProjectStatus::InProgress,
        proposal_count: 0,
        created_at: now,
        updated_at: now,
    };
    let contract = Contract {
        id: new_id(),
        project_id: project.id.clone(),
        proposal_id: None,
        client_id: request.client_id.clone(),
        freelancer_id: request.freelancer_id.clone(),
        title: request.title.clone(),
        total_amount: request.budget,
        status: ContractStatus::Active,
        milestones: vec![Milestone::new(
            request.title.clone(),
            Some(request.description.clone()),
            request.budget,
            None,
        )],
        created_at: now,
        updated_at: now,
    };
    (project, contract)
}

async fn find_request(data: &AppState, id: &str) -> AppResult<HireNowRequest> {
    data.mongodb
        .hire_requests()
        .find_one(doc! { "_id": id })
        .await?
        .ok_or_else(|| AppError::not_found("Hire request"))
}

/// Moves a pending request to `next`; fails if it was answered in the meantime.
async fn close_pending(
    data: &AppState,
    id: &str,
    next: HireRequestStatus,
    contract_id: Option<&str>,
) -> AppResult<()> {
    let mut set = doc! {
        "status": next.as_str(),
        "updated_at": bson::DateTime::from_chrono(Utc::now()),
    };
    if let Some(contract_id) = contract_id {
        set.insert("contract_id", contract_id);
    }
    let res = data
        .mongodb
        .hire_requests()
        .update_one(doc! { "_id": id, "status": HireRequestStatus::Pending.as_str() }, doc! { "$set": set })
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::conflict("This request has already been answered"));
    }
    Ok(())
}

/// POST /api/v1/hire-requests
pub async fn create_hire_request(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<CreateHireRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Client])?;
    info.validate()?;
    let freelancer = find_user(&data, &info.freelancer_id).await?;
    if freelancer.role != Role::Freelancer {
        return Err(AppError::bad_request("Offers can only be sent to freelancers"));
    }
    if !freelancer.can_sign_in() {
        return Err(AppError::bad_request("This freelancer is not available"));
    }

    let info = info.into_inner();
    let now = Utc::now();
    let request = HireNowRequest {
        id: new_id(),
        client_id: auth.id.clone(),
        freelancer_id: freelancer.id.clone(),
        title: info.title.trim().to_string(),
        description: info.description.trim().to_string(),
        budget: info.budget,
        status: HireRequestStatus::Pending,
        contract_id: None,
        created_at: now,
        updated_at: now,
    };
    data.mongodb.hire_requests().insert_one(&request).await?;
    info!("Hire request {} sent by {} to {}", request.id, auth.id, freelancer.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &freelancer.id,
            kind: NotificationKind::Proposal,
            title: "New hire request",
            message: format!("You were offered \"{}\"", request.title),
            link: Some(format!("/hire-requests/{}", request.id)),
        },
    )
    .await;
    Ok(HttpResponse::Created().json(request))
}

/// GET /api/v1/hire-requests
/// Requests the caller sent or received.
pub async fn my_hire_requests(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let requests: Vec<HireNowRequest> = data
        .mongodb
        .hire_requests()
        .find(doc! { "$or": [ { "client_id": &auth.id }, { "freelancer_id": &auth.id } ] })
        .sort(doc! { "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(requests))
}

/// POST /api/v1/hire-requests/{id}/accept
pub async fn accept_hire_request(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let request = find_request(&data, &id).await?;
    if request.freelancer_id != auth.id {
        return Err(AppError::forbidden("Only the invited freelancer can accept"));
    }
    if request.status != HireRequestStatus::Pending {
        return Err(AppError::bad_request("This request has already been answered"));
    }

    let (project, contract) = hire_into_contract(&request, Utc::now());
    close_pending(&data, &request.id, HireRequestStatus::Accepted, Some(&contract.id)).await?;
    data.mongodb.projects().insert_one(&project).await?;
    data.mongodb.contracts().insert_one(&contract).await?;
    info!("Hire request {} accepted; contract {} created", request.id, contract.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &request.client_id,
            kind: NotificationKind::Contract,
            title: "Hire request accepted",
            message: format!("Your offer \"{}\" was accepted", request.title),
            link: Some(format!("/contracts/{}", contract.id)),
        },
    )
    .await;
    Ok(HttpResponse::Created().json(json!({ "project": project, "contract": contract })))
}

/// POST /api/v1/hire-requests/{id}/decline
pub async fn decline_hire_request(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let request = find_request(&data, &id).await?;
    if request.freelancer_id != auth.id {
        return Err(AppError::forbidden("Only the invited freelancer can decline"));
    }
    close_pending(&data, &request.id, HireRequestStatus::Declined, None).await?;
    info!("Hire request {} declined", request.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &request.client_id,
            kind: NotificationKind::Proposal,
            title: "Hire request declined",
            message: format!("Your offer \"{}\" was declined", request.title),
            link: Some(format!("/hire-requests/{}", request.id)),
        },
    )
    .await;
    Ok(HttpResponse::Ok().json(find_request(&data, &request.id).await?))
}

/// POST /api/v1/hire-requests/{id}/cancel
pub async fn cancel_hire_request(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let request = find_request(&data, &id).await?;
    if request.client_id != auth.id {
        return Err(AppError::forbidden("Only the client can cancel this request"));
    }
    close_pending(&data, &request.id, HireRequestStatus::Cancelled, None).await?;
    info!("Hire request {} cancelled", request.id);
    Ok(HttpResponse::Ok().json(find_request(&data, &request.id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contract::MilestoneStatus;

    fn request(budget: i64) -> HireNowRequest {
        let now = Utc::now();
        HireNowRequest {
            id: "h1".into(),
            client_id: "client".into(),
            freelancer_id: "freelancer".into(),
            title: "Landing page".into(),
            description: "One page marketing site".into(),
            budget,
            status: HireRequestStatus::Pending,
            contract_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn accepted_offer_becomes_running_contract() {
        let (project, contract) = hire_into_contract(&request(75_000), Utc::now());
        assert_eq!(project.status, ProjectStatus::InProgress);
        assert_eq!(project.budget.min, 75_000);
        assert_eq!(contract.project_id, project.id);
        assert_eq!(contract.status, ContractStatus::Active);
        assert_eq!(contract.total_amount, 75_000);
        assert_eq!(contract.milestones.len(), 1);
        assert_eq!(contract.milestones[0].status, MilestoneStatus::Pending);
        assert!(contract.proposal_id.is_none());
    }

    #[test]
    fn budget_must_be_positive() {
        let req = CreateHireRequest {
            freelancer_id: "f".into(),
            title: "Logo".into(),
            description: "Vector logo".into(),
            budget: 0,
        };
        assert!(req.validate().is_err());
        assert!(CreateHireRequest { budget: 1, ..req }.validate().is_ok());
    }
}
