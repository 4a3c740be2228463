use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use log::info;
use mongodb::bson::{doc, Document};
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::db::MongoDB;
use crate::error::{AppError, AppResult};
use crate::models::{
    settings::PlatformSettings,
    transaction::TransactionStatus,
    user::{AccountStatus, Role, User},
    PageQuery,
};

/// Stored settings, or the defaults when none were saved yet.
pub async fn load_settings(mongodb: &MongoDB) -> AppResult<PlatformSettings> {
    Ok(mongodb
        .settings()
        .find_one(doc! { "_id": PlatformSettings::ID })
        .await?
        .unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub commission_rate: Option<f64>,
    pub escrow_hold_days: Option<u32>,
    pub min_withdrawal: Option<i64>,
    pub maintenance_mode: Option<bool>,
}

impl UpdateSettingsRequest {
    pub fn apply(&self, mut settings: PlatformSettings) -> AppResult<PlatformSettings> {
        if let Some(rate) = self.commission_rate {
            settings.commission_rate = rate;
        }
        if let Some(days) = self.escrow_hold_days {
            settings.escrow_hold_days = days;
        }
        if let Some(min) = self.min_withdrawal {
            settings.min_withdrawal = min;
        }
        if let Some(flag) = self.maintenance_mode {
            settings.maintenance_mode = flag;
        }
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Deserialize)]
pub struct UserFilter {
    pub role: Option<Role>,
    pub status: Option<AccountStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserStatusRequest {
    pub status: AccountStatus,
}

/// GET /api/v1/admin/settings
pub async fn get_settings(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    Ok(HttpResponse::Ok().json(load_settings(&data.mongodb).await?))
}

/// GET /api/v1/settings/public
/// What clients need to show fees and the maintenance banner.
pub async fn public_settings(data: web::Data<AppState>) -> AppResult<HttpResponse> {
    let settings = load_settings(&data.mongodb).await?;
    Ok(HttpResponse::Ok().json(json!({
        "commission_rate": settings.commission_rate,
        "escrow_hold_days": settings.escrow_hold_days,
        "maintenance_mode": settings.maintenance_mode,
    })))
}

/// PUT /api/v1/admin/settings
pub async fn update_settings(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<UpdateSettingsRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let settings = info.apply(load_settings(&data.mongodb).await?)?;
    data.mongodb
        .settings()
        .replace_one(doc! { "_id": PlatformSettings::ID }, &settings)
        .upsert(true)
        .await?;
    info!(
        "Platform settings updated by {}: commission={}%, hold={}d",
        auth.id, settings.commission_rate, settings.escrow_hold_days
    );
    Ok(HttpResponse::Ok().json(settings))
}

/// GET /api/v1/admin/users
pub async fn list_users(
    data: web::Data<AppState>,
    auth: AuthUser,
    filter: web::Query<UserFilter>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let mut query = Document::new();
    if let Some(role) = filter.role {
        query.insert("role", role.as_str());
    }
    if let Some(status) = filter.status {
        query.insert("account_status", bson::to_bson(&status)?);
    }
    let users: Vec<User> = data
        .mongodb
        .users()
        .find(query)
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    let users: Vec<User> = users.into_iter().map(User::public).collect();
    Ok(HttpResponse::Ok().json(users))
}

/// PATCH /api/v1/admin/users/{id}/status
pub async fn update_user_status(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<UpdateUserStatusRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    if *id == auth.id {
        return Err(AppError::bad_request("Admins cannot change their own account status"));
    }
    let res = data
        .mongodb
        .users()
        .update_one(
            doc! { "_id": id.as_str() },
            doc! { "$set": {
                "account_status": bson::to_bson(&info.status)?,
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            } },
        )
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::not_found("User"));
    }
    info!("User {} status set to {:?} by {}", id, info.status, auth.id);
    Ok(HttpResponse::NoContent().finish())
}

/// GET /api/v1/admin/stats
pub async fn stats(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let db = &data.mongodb;

    let users = db.users().count_documents(doc! {}).await?;
    let freelancers = db.users().count_documents(doc! { "role": "freelancer" }).await?;
    let clients = db.users().count_documents(doc! { "role": "client" }).await?;
    let open_projects = db.projects().count_documents(doc! { "status": "open" }).await?;
    let active_contracts = db.contracts().count_documents(doc! { "status": "active" }).await?;
    let open_disputes = db
        .disputes()
        .count_documents(doc! { "status": { "$in": ["open", "under_review"] } })
        .await?;

    let mut totals = db
        .transactions()
        .aggregate(vec![
            doc! { "$group": {
                "_id": "$status",
                "amount": { "$sum": "$amount" },
                "commission": { "$sum": "$platform_commission" },
            } },
        ])
        .await?;
    let mut in_escrow: i64 = 0;
    let mut platform_revenue: i64 = 0;
    while let Some(group) = totals.next().await {
        let group = group?;
        let status = group.get_str("_id").unwrap_or_default();
        let amount = group.get_i64("amount").unwrap_or_default();
        let commission = group.get_i64("commission").unwrap_or_default();
        if status == TransactionStatus::HeldInEscrow.as_str() {
            in_escrow = amount;
        }
        if status == TransactionStatus::Released.as_str() {
            platform_revenue = commission;
        }
    }

    Ok(HttpResponse::Ok().json(json!({
        "users": { "total": users, "freelancers": freelancers, "clients": clients },
        "open_projects": open_projects,
        "active_contracts": active_contracts,
        "open_disputes": open_disputes,
        "escrow": { "held": in_escrow, "platform_revenue": platform_revenue },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_update() {
        let req = UpdateSettingsRequest {
            commission_rate: Some(12.5),
            escrow_hold_days: None,
            min_withdrawal: None,
            maintenance_mode: Some(true),
        };
        let updated = req.apply(PlatformSettings::default()).unwrap();
        assert_eq!(updated.commission_rate, 12.5);
        assert_eq!(updated.escrow_hold_days, 7);
        assert!(updated.maintenance_mode);
    }

    #[test]
    fn invalid_settings_are_refused() {
        let req = UpdateSettingsRequest {
            commission_rate: Some(-1.0),
            escrow_hold_days: None,
            min_withdrawal: None,
            maintenance_mode: None,
        };
        assert!(req.apply(PlatformSettings::default()).is_err());
    }
}
