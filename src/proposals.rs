use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::{debug, info};
use mongodb::bson::doc;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::contracts::MilestoneInput;
use crate::error::{is_duplicate_key, AppError, AppResult};
use crate::models::{
    contract::{check_milestone_total, Contract, ContractStatus, Milestone},
    ensure_positive_amount, new_id,
    notification::NotificationKind,
    project::ProjectStatus,
    proposal::{Proposal, ProposalStatus, Timeline},
    user::Role,
};
use crate::notifications::{notify_quietly, NewNotification};
use crate::projects::find_project;

const MIN_COVER_LETTER: usize = 50;

#[derive(Debug, Deserialize)]
pub struct SubmitProposalRequest {
    pub cover_letter: String,
    pub bid_amount: i64,
    pub timeline: Timeline,
}

impl SubmitProposalRequest {
    pub fn validate(&self) -> AppResult<()> {
        ensure_positive_amount("Bid amount", self.bid_amount)?;
        if self.cover_letter.trim().chars().count() < MIN_COVER_LETTER {
            return Err(AppError::bad_request(format!(
                "Cover letter must be at least {MIN_COVER_LETTER} characters"
            )));
        }
        if self.timeline.duration == 0 {
            return Err(AppError::bad_request("Timeline duration must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AcceptProposalRequest {
    #[serde(default)]
    pub milestones: Vec<MilestoneInput>,
}

/// Milestones for a new contract: either those supplied, which must add up to
/// `amount`, or one milestone covering the whole amount.
pub fn plan_milestones(inputs: Vec<MilestoneInput>, amount: i64, title: &str) -> AppResult<Vec<Milestone>> {
    if inputs.is_empty() {
        return Ok(vec![Milestone::new(title.to_string(), None, amount, None)]);
    }
    let milestones: Vec<Milestone> = inputs.into_iter().map(MilestoneInput::into_milestone).collect();
    check_milestone_total(&milestones, amount)?;
    Ok(milestones)
}

async fn find_proposal(data: &AppState, proposal_id: &str) -> AppResult<Proposal> {
    data.mongodb
        .proposals()
        .find_one(doc! { "_id": proposal_id })
        .await?
        .ok_or_else(|| AppError::not_found("Proposal"))
}

/// POST /api/v1/projects/{id}/proposals
pub async fn submit_proposal(
    data: web::Data<AppState>,
    auth: AuthUser,
    project_id: web::Path<String>,
    info: web::Json<SubmitProposalRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Freelancer])?;
    debug!("submit_proposal by {} for {}: {:?}", auth.id, project_id, info);
    info.validate()?;

    let project = find_project(&data, &project_id).await?;
    if project.status != ProjectStatus::Open {
        return Err(AppError::bad_request("This project is not accepting proposals"));
    }

    let proposals = data.mongodb.proposals();
    let existing = proposals
        .find_one(doc! { "project_id": &project.id, "freelancer_id": &auth.id })
        .await?;
    if existing.is_some() {
        return Err(AppError::conflict("You have already submitted a proposal for this project"));
    }

    let info = info.into_inner();
    let now = Utc::now();
    let proposal = Proposal {
        id: new_id(),
        project_id: project.id.clone(),
        freelancer_id: auth.id.clone(),
        cover_letter: info.cover_letter.trim().to_string(),
        bid_amount: info.bid_amount,
        timeline: info.timeline,
        status: ProposalStatus::Pending,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = proposals.insert_one(&proposal).await {
        if is_duplicate_key(&e) {
            return Err(AppError::conflict("You have already submitted a proposal for this project"));
        }
        return Err(e.into());
    }
    data.mongodb
        .projects()
        .update_one(doc! { "_id": &project.id }, doc! { "$inc": { "proposal_count": 1 } })
        .await?;
    info!("Proposal {} submitted to project {}", proposal.id, project.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &project.client_id,
            kind: NotificationKind::Proposal,
            title: "New proposal",
            message: format!("You received a new proposal for \"{}\"", project.title),
            link: Some(format!("/projects/{}/proposals", project.id)),
        },
    )
    .await;

    Ok(HttpResponse::Created().json(proposal))
}

/// GET /api/v1/projects/{id}/proposals
pub async fn list_project_proposals(
    data: web::Data<AppState>,
    auth: AuthUser,
    project_id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let project = find_project(&data, &project_id).await?;
    if project.client_id != auth.id && !auth.is_admin() {
        return Err(AppError::forbidden("Only the project owner can view proposals"));
    }
    let proposals: Vec<Proposal> = data
        .mongodb
        .proposals()
        .find(doc! { "project_id": &project.id })
        .sort(doc! { "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(proposals))
}

/// GET /api/v1/proposals/mine
pub async fn my_proposals(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Freelancer])?;
    let proposals: Vec<Proposal> = data
        .mongodb
        .proposals()
        .find(doc! { "freelancer_id": &auth.id })
        .sort(doc! { "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(proposals))
}

/// PATCH /api/v1/proposals/{id}/withdraw
pub async fn withdraw_proposal(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let proposal = find_proposal(&data, &id).await?;
    if proposal.freelancer_id != auth.id {
        return Err(AppError::forbidden("Only the author can withdraw a proposal"));
    }
    if proposal.status != ProposalStatus::Pending {
        return Err(AppError::bad_request("Only pending proposals can be withdrawn"));
    }
    set_status(&data, &proposal.id, ProposalStatus::Pending, ProposalStatus::Withdrawn).await?;
    data.mongodb
        .projects()
        .update_one(
            doc! { "_id": &proposal.project_id, "proposal_count": { "$gt": 0 } },
            doc! { "$inc": { "proposal_count": -1 } },
        )
        .await?;
    info!("Proposal {} withdrawn", proposal.id);
    Ok(HttpResponse::NoContent().finish())
}

async fn set_status(
    data: &AppState,
    proposal_id: &str,
    from: ProposalStatus,
    to: ProposalStatus,
) -> AppResult<()> {
    let res = data
        .mongodb
        .proposals()
        .update_one(
            doc! { "_id": proposal_id, "status": bson::to_bson(&from)? },
            doc! { "$set": {
                "status": bson::to_bson(&to)?,
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            } },
        )
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::conflict("Proposal was changed by someone else"));
    }
    Ok(())
}

/// POST /api/v1/proposals/{id}/accept
/// Creates the contract, rejects competing proposals and starts the project.
pub async fn accept_proposal(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: Option<web::Json<AcceptProposalRequest>>,
) -> AppResult<HttpResponse> {
    let proposal = find_proposal(&data, &id).await?;
    let project = find_project(&data, &proposal.project_id).await?;
    if project.client_id != auth.id {
        return Err(AppError::forbidden("Only the project owner can accept proposals"));
    }
    if proposal.status != ProposalStatus::Pending {
        return Err(AppError::bad_request("Only pending proposals can be accepted"));
    }
    if project.status != ProjectStatus::Open {
        return Err(AppError::bad_request("This project is no longer open"));
    }

    let inputs = info.map(|j| j.into_inner().milestones).unwrap_or_default();
    let milestones = plan_milestones(inputs, proposal.bid_amount, &project.title)?;

    set_status(&data, &proposal.id, ProposalStatus::Pending, ProposalStatus::Accepted).await?;

    let now = Utc::now();
    let contract = Contract {
        id: new_id(),
        project_id: project.id.clone(),
        proposal_id: Some(proposal.id.clone()),
        client_id: project.client_id.clone(),
        freelancer_id: proposal.freelancer_id.clone(),
        title: project.title.clone(),
        total_amount: proposal.bid_amount,
        status: ContractStatus::Active,
        milestones,
        created_at: now,
        updated_at: now,
    };
    data.mongodb.contracts().insert_one(&contract).await?;

    let at = bson::DateTime::from_chrono(now);
    data.mongodb
        .proposals()
        .update_many(
            doc! { "project_id": &project.id, "status": "pending" },
            doc! { "$set": { "status": "rejected", "updated_at": at } },
        )
        .await?;
    data.mongodb
        .projects()
        .update_one(
            doc! { "_id": &project.id },
            doc! { "$set": { "status": ProjectStatus::InProgress.as_str(), "updated_at": at } },
        )
        .await?;
    info!("Proposal {} accepted; contract {} created", proposal.id, contract.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &contract.freelancer_id,
            kind: NotificationKind::Contract,
            title: "Proposal accepted",
            message: format!("Your proposal for \"{}\" was accepted", project.title),
            link: Some(format!("/contracts/{}", contract.id)),
        },
    )
    .await;

    Ok(HttpResponse::Created().json(contract))
}

/// POST /api/v1/proposals/{id}/reject
pub async fn reject_proposal(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let proposal = find_proposal(&data, &id).await?;
    let project = find_project(&data, &proposal.project_id).await?;
    if project.client_id != auth.id {
        return Err(AppError::forbidden("Only the project owner can reject proposals"));
    }
    if proposal.status != ProposalStatus::Pending {
        return Err(AppError::bad_request("Only pending proposals can be rejected"));
    }
    set_status(&data, &proposal.id, ProposalStatus::Pending, ProposalStatus::Rejected).await?;

    notify_quietly(
        &data,
        NewNotification {
            user_id: &proposal.freelancer_id,
            kind: NotificationKind::Proposal,
            title: "Proposal declined",
            message: format!("Your proposal for \"{}\" was declined", project.title),
            link: Some(format!("/projects/{}", project.id)),
        },
    )
    .await;
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::proposal::TimelineUnit;

    fn submission(bid_amount: i64) -> SubmitProposalRequest {
        SubmitProposalRequest {
            cover_letter: "I have shipped a dozen landing pages like this one and can start today.".into(),
            bid_amount,
            timeline: Timeline { duration: 2, unit: TimelineUnit::Weeks },
        }
    }

    #[test]
    fn non_positive_bids_are_rejected() {
        assert!(submission(75_000).validate().is_ok());

        let zero = submission(0).validate().unwrap_err();
        assert!(matches!(zero, AppError::BadRequest(_)));
        assert!(submission(-100).validate().is_err());
    }

    #[test]
    fn short_cover_letters_are_rejected() {
        let mut s = submission(10_000);
        s.cover_letter = "hire me".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn default_plan_is_one_milestone_for_the_bid() {
        let plan = plan_milestones(vec![], 80_000, "Landing page").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].amount, 80_000);
        assert_eq!(plan[0].title, "Landing page");
    }

    #[test]
    fn supplied_plan_must_cover_the_bid() {
        let input = |amount| MilestoneInput {
            title: "Part".into(),
            description: None,
            amount,
            due_date: None,
        };
        assert_eq!(plan_milestones(vec![input(30_000), input(50_000)], 80_000, "x").unwrap().len(), 2);
        assert!(plan_milestones(vec![input(30_000)], 80_000, "x").is_err());
    }
}
