use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::doc;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::db::MongoDB;
use crate::error::{AppError, AppResult};
use crate::models::{
    contract::{Contract, ContractStatus, Milestone, MilestoneStatus, Settlement},
    ensure_positive_amount,
    notification::NotificationKind,
    project::ProjectStatus,
    transaction::TransactionStatus,
};
use crate::notifications::{notify_quietly, NewNotification};

#[derive(Debug, Deserialize)]
pub struct MilestoneInput {
    pub title: String,
    pub description: Option<String>,
    pub amount: i64,
    pub due_date: Option<DateTime<Utc>>,
}

impl MilestoneInput {
    pub fn into_milestone(self) -> Milestone {
        Milestone::new(self.title.trim().to_string(), self.description, self.amount, self.due_date)
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SubmitMilestoneRequest {
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectMilestoneRequest {
    pub reason: String,
}

pub async fn find_contract(data: &AppState, contract_id: &str) -> AppResult<Contract> {
    data.mongodb
        .contracts()
        .find_one(doc! { "_id": contract_id })
        .await?
        .ok_or_else(|| AppError::not_found("Contract"))
}

/// Loads a contract the caller is party to (admins see all).
pub async fn find_contract_for(data: &AppState, auth: &AuthUser, contract_id: &str) -> AppResult<Contract> {
    let contract = find_contract(data, contract_id).await?;
    if !contract.is_party(&auth.id) && !auth.is_admin() {
        return Err(AppError::forbidden("You are not a party to this contract"));
    }
    Ok(contract)
}

/// Writes the contract back unless someone else changed it since it was read.
async fn save_contract(data: &AppState, contract: &mut Contract) -> AppResult<()> {
    let read_at = bson::DateTime::from_chrono(contract.updated_at);
    contract.updated_at = Utc::now();
    let res = data
        .mongodb
        .contracts()
        .replace_one(doc! { "_id": &contract.id, "updated_at": read_at }, &*contract)
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::conflict("Contract was modified concurrently, please retry"));
    }
    Ok(())
}

pub(crate) async fn complete_project(mongodb: &MongoDB, project_id: &str, now: DateTime<Utc>) -> AppResult<()> {
    mongodb
        .projects()
        .update_one(
            doc! { "_id": project_id },
            doc! { "$set": {
                "status": ProjectStatus::Completed.as_str(),
                "updated_at": bson::DateTime::from_chrono(now),
            } },
        )
        .await?;
    Ok(())
}

fn ensure_active(contract: &Contract) -> AppResult<()> {
    if contract.status != ContractStatus::Active {
        return Err(AppError::bad_request(format!(
            "Contract is {}",
            contract.status.as_str()
        )));
    }
    Ok(())
}

/// GET /api/v1/contracts
pub async fn my_contracts(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let contracts: Vec<Contract> = data
        .mongodb
        .contracts()
        .find(doc! { "$or": [ { "client_id": &auth.id }, { "freelancer_id": &auth.id } ] })
        .sort(doc! { "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(contracts))
}

/// GET /api/v1/contracts/{id}
pub async fn get_contract(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(find_contract_for(&data, &auth, &id).await?))
}

/// POST /api/v1/contracts/{id}/milestones
pub async fn add_milestone(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<MilestoneInput>,
) -> AppResult<HttpResponse> {
    let mut contract = find_contract(&data, &id).await?;
    if contract.client_id != auth.id {
        return Err(AppError::forbidden("Only the client can add milestones"));
    }
    ensure_active(&contract)?;
    ensure_positive_amount("Milestone amount", info.amount)?;
    if info.title.trim().is_empty() {
        return Err(AppError::bad_request("Milestone title is required"));
    }

    contract.push_milestone(info.into_inner().into_milestone())?;
    save_contract(&data, &mut contract).await?;
    info!("Milestone added to contract {}", contract.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &contract.freelancer_id,
            kind: NotificationKind::Contract,
            title: "Milestone added",
            message: format!("A new milestone was added to \"{}\"", contract.title),
            link: Some(format!("/contracts/{}", contract.id)),
        },
    )
    .await;
    Ok(HttpResponse::Created().json(contract))
}

/// Applies a milestone transition performed by `actor` and notifies the other party.
async fn move_milestone(
    data: &AppState,
    contract: &mut Contract,
    milestone_id: &str,
    next: MilestoneStatus,
    actor: &str,
    edit: impl FnOnce(&mut Milestone),
) -> AppResult<()> {
    ensure_active(contract)?;
    let now = Utc::now();
    let milestone = contract.milestone_mut(milestone_id)?;
    milestone.transition(next, now)?;
    edit(milestone);
    let title = milestone.title.clone();
    save_contract(data, contract).await?;
    info!("Milestone {} of contract {} is now {}", milestone_id, contract.id, next.as_str());

    if let Some(other) = contract.counterparty(actor) {
        notify_quietly(
            data,
            NewNotification {
                user_id: other,
                kind: NotificationKind::Contract,
                title: "Milestone updated",
                message: format!("Milestone \"{}\" is now {}", title, next.as_str()),
                link: Some(format!("/contracts/{}", contract.id)),
            },
        )
        .await;
    }
    Ok(())
}

/// POST /api/v1/contracts/{id}/milestones/{milestone_id}/submit
pub async fn submit_milestone(
    data: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<(String, String)>,
    info: Option<web::Json<SubmitMilestoneRequest>>,
) -> AppResult<HttpResponse> {
    let (contract_id, milestone_id) = path.into_inner();
    let mut contract = find_contract(&data, &contract_id).await?;
    if contract.freelancer_id != auth.id {
        return Err(AppError::forbidden("Only the freelancer can submit work"));
    }
    let note = info.and_then(|j| j.into_inner().note);
    move_milestone(&data, &mut contract, &milestone_id, MilestoneStatus::Submitted, &auth.id, |m| {
        m.submission_note = note;
    })
    .await?;
    Ok(HttpResponse::Ok().json(contract))
}

/// POST /api/v1/contracts/{id}/milestones/{milestone_id}/approve
pub async fn approve_milestone(
    data: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (contract_id, milestone_id) = path.into_inner();
    let mut contract = find_contract(&data, &contract_id).await?;
    if contract.client_id != auth.id {
        return Err(AppError::forbidden("Only the client can approve work"));
    }
    move_milestone(&data, &mut contract, &milestone_id, MilestoneStatus::Approved, &auth.id, |_| {})
        .await?;

    // Funds may already have gone out through the hold-period release.
    let released = data
        .mongodb
        .transactions()
        .count_documents(doc! {
            "contract_id": &contract.id,
            "milestone_id": &milestone_id,
            "status": TransactionStatus::Released.as_str(),
        })
        .await?;
    if released > 0 {
        let now = Utc::now();
        if let Settlement::Paid { completed } = contract.settle_milestone(&milestone_id, now)? {
            save_contract(&data, &mut contract).await?;
            if completed {
                complete_project(&data.mongodb, &contract.project_id, now).await?;
                info!("Contract {} completed", contract.id);
            }
        }
    }
    Ok(HttpResponse::Ok().json(contract))
}

/// POST /api/v1/contracts/{id}/milestones/{milestone_id}/reject
pub async fn reject_milestone(
    data: web::Data<AppState>,
    auth: AuthUser,
    path: web::Path<(String, String)>,
    info: web::Json<RejectMilestoneRequest>,
) -> AppResult<HttpResponse> {
    let (contract_id, milestone_id) = path.into_inner();
    let mut contract = find_contract(&data, &contract_id).await?;
    if contract.client_id != auth.id {
        return Err(AppError::forbidden("Only the client can reject work"));
    }
    let reason = info.into_inner().reason.trim().to_string();
    if reason.is_empty() {
        return Err(AppError::bad_request("A rejection reason is required"));
    }
    move_milestone(&data, &mut contract, &milestone_id, MilestoneStatus::Rejected, &auth.id, |m| {
        m.rejection_reason = Some(reason);
    })
    .await?;
    Ok(HttpResponse::Ok().json(contract))
}

/// POST /api/v1/contracts/{id}/cancel
/// Refused while any milestone money is pending or held.
pub async fn cancel_contract(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let mut contract = find_contract_for(&data, &auth, &id).await?;
    ensure_active(&contract)?;

    let live = [
        TransactionStatus::Pending,
        TransactionStatus::Processing,
        TransactionStatus::HeldInEscrow,
    ]
    .iter()
    .map(|s| s.as_str())
    .collect::<Vec<_>>();
    let funded = data
        .mongodb
        .transactions()
        .count_documents(doc! { "contract_id": &contract.id, "status": { "$in": live } })
        .await?;
    if funded > 0 {
        return Err(AppError::bad_request(
            "Contract has funds in escrow; release or refund them first",
        ));
    }

    contract.status = ContractStatus::Cancelled;
    save_contract(&data, &mut contract).await?;
    data.mongodb
        .projects()
        .update_one(
            doc! { "_id": &contract.project_id },
            doc! { "$set": {
                "status": ProjectStatus::Cancelled.as_str(),
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            } },
        )
        .await?;
    info!("Contract {} cancelled by {}", contract.id, auth.id);

    if let Some(other) = contract.counterparty(&auth.id) {
        notify_quietly(
            &data,
            NewNotification {
                user_id: other,
                kind: NotificationKind::Contract,
                title: "Contract cancelled",
                message: format!("\"{}\" was cancelled", contract.title),
                link: Some(format!("/contracts/{}", contract.id)),
            },
        )
        .await;
    }
    Ok(HttpResponse::Ok().json(contract))
}
