use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::{info, warn};
use mongodb::bson::doc;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::contracts::{find_contract, find_contract_for};
use crate::error::{AppError, AppResult};
use crate::models::{
    contract::ContractStatus,
    dispute::{Dispute, DisputeStatus},
    new_id,
    notification::NotificationKind,
    user::Role,
    PageQuery,
};
use crate::notifications::{notify_quietly, NewNotification};

#[derive(Debug, Deserialize)]
pub struct OpenDisputeRequest {
    pub contract_id: String,
    pub reason: String,
    pub description: String,
}

impl OpenDisputeRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.reason.trim().is_empty() {
            return Err(AppError::bad_request("A dispute reason is required"));
        }
        if self.description.trim().chars().count() < 20 {
            return Err(AppError::bad_request(
                "Describe the dispute in at least 20 characters",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateDisputeRequest {
    pub status: DisputeStatus,
    pub resolution: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisputeFilter {
    pub status: Option<DisputeStatus>,
}

async fn set_contract_status(
    data: &AppState,
    contract_id: &str,
    from: ContractStatus,
    to: ContractStatus,
) -> AppResult<bool> {
    let res = data
        .mongodb
        .contracts()
        .update_one(
            doc! { "_id": contract_id, "status": from.as_str() },
            doc! { "$set": {
                "status": to.as_str(),
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            } },
        )
        .await?;
    Ok(res.modified_count > 0)
}

async fn find_dispute(data: &AppState, id: &str) -> AppResult<Dispute> {
    data.mongodb
        .disputes()
        .find_one(doc! { "_id": id })
        .await?
        .ok_or_else(|| AppError::not_found("Dispute"))
}

/// POST /api/v1/disputes
pub async fn open_dispute(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<OpenDisputeRequest>,
) -> AppResult<HttpResponse> {
    info.validate()?;
    let contract = find_contract(&data, &info.contract_id).await?;
    let against = contract
        .counterparty(&auth.id)
        .ok_or_else(|| AppError::forbidden("You are not a party to this contract"))?
        .to_string();
    if contract.status != ContractStatus::Active {
        return Err(AppError::bad_request(format!(
            "Cannot dispute a contract that is {}",
            contract.status.as_str()
        )));
    }
    // Flip the contract first so two parties racing get one dispute.
    if !set_contract_status(&data, &contract.id, ContractStatus::Active, ContractStatus::Disputed).await? {
        return Err(AppError::conflict("Contract was modified concurrently, please retry"));
    }

    let info = info.into_inner();
    let now = Utc::now();
    let dispute = Dispute {
        id: new_id(),
        contract_id: contract.id.clone(),
        raised_by: auth.id.clone(),
        against: against.clone(),
        reason: info.reason.trim().to_string(),
        description: info.description.trim().to_string(),
        status: DisputeStatus::Open,
        resolution: None,
        resolved_by: None,
        created_at: now,
        updated_at: now,
    };
    data.mongodb.disputes().insert_one(&dispute).await?;
    info!("Dispute {} opened on contract {} by {}", dispute.id, contract.id, auth.id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &against,
            kind: NotificationKind::Dispute,
            title: "Dispute opened",
            message: format!("A dispute was opened on \"{}\": {}", contract.title, dispute.reason),
            link: Some(format!("/disputes/{}", dispute.id)),
        },
    )
    .await;
    Ok(HttpResponse::Created().json(dispute))
}

/// GET /api/v1/disputes
/// Admins see every dispute; everyone else sees the ones they are involved in.
pub async fn list_disputes(
    data: web::Data<AppState>,
    auth: AuthUser,
    filter: web::Query<DisputeFilter>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let mut query = if auth.is_admin() {
        doc! {}
    } else {
        doc! { "$or": [ { "raised_by": &auth.id }, { "against": &auth.id } ] }
    };
    if let Some(status) = filter.status {
        query.insert("status", status.as_str());
    }
    let disputes: Vec<Dispute> = data
        .mongodb
        .disputes()
        .find(query)
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(disputes))
}

/// GET /api/v1/disputes/{id}
pub async fn get_dispute(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let dispute = find_dispute(&data, &id).await?;
    // Visibility follows the contract.
    find_contract_for(&data, &auth, &dispute.contract_id).await?;
    Ok(HttpResponse::Ok().json(dispute))
}

/// PATCH /api/v1/admin/disputes/{id}
pub async fn update_dispute(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<UpdateDisputeRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let mut dispute = find_dispute(&data, &id).await?;
    let next = info.status;
    if !dispute.status.can_transition_to(next) {
        return Err(AppError::bad_request(format!(
            "Cannot move dispute from {} to {}",
            dispute.status.as_str(),
            next.as_str()
        )));
    }
    let resolution = info
        .into_inner()
        .resolution
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if next == DisputeStatus::Resolved && resolution.is_none() {
        return Err(AppError::bad_request("A resolution is required to resolve a dispute"));
    }

    let prior = dispute.status;
    dispute.status = next;
    dispute.updated_at = Utc::now();
    if next.is_settled() {
        dispute.resolution = resolution;
        dispute.resolved_by = Some(auth.id.clone());
    }
    let res = data
        .mongodb
        .disputes()
        .replace_one(doc! { "_id": &dispute.id, "status": prior.as_str() }, &dispute)
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::conflict("Dispute was modified concurrently, please retry"));
    }
    info!("Dispute {} moved to {} by {}", dispute.id, next.as_str(), auth.id);

    if next.is_settled() {
        let reopened = set_contract_status(
            &data,
            &dispute.contract_id,
            ContractStatus::Disputed,
            ContractStatus::Active,
        )
        .await?;
        if !reopened {
            warn!("Contract {} was not disputed when dispute {} settled", dispute.contract_id, dispute.id);
        }
    }

    for user_id in [&dispute.raised_by, &dispute.against] {
        notify_quietly(
            &data,
            NewNotification {
                user_id,
                kind: NotificationKind::Dispute,
                title: "Dispute updated",
                message: match &dispute.resolution {
                    Some(r) if next.is_settled() => format!("Dispute {}: {}", next.as_str(), r),
                    _ => format!("Dispute is now {}", next.as_str().replace('_', " ")),
                },
                link: Some(format!("/disputes/{}", dispute.id)),
            },
        )
        .await;
    }
    Ok(HttpResponse::Ok().json(dispute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_needs_detail() {
        let vague = OpenDisputeRequest {
            contract_id: "c1".into(),
            reason: "quality".into(),
            description: "bad".into(),
        };
        assert!(vague.validate().is_err());

        let ok = OpenDisputeRequest {
            contract_id: "c1".into(),
            reason: "quality".into(),
            description: "The delivered code does not build at all.".into(),
        };
        assert!(ok.validate().is_ok());

        let no_reason = OpenDisputeRequest { reason: "  ".into(), ..ok };
        assert!(no_reason.validate().is_err());
    }
}
