use actix::Addr;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::error;
use mongodb::bson::doc;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::db::MongoDB;
use crate::error::{AppError, AppResult};
use crate::models::{
    new_id,
    notification::{Notification, NotificationKind},
    PageQuery,
};
use crate::notification_hub::{Deliver, NotificationHub};

pub struct NewNotification<'a> {
    pub user_id: &'a str,
    pub kind: NotificationKind,
    pub title: &'a str,
    pub message: String,
    pub link: Option<String>,
}

/// Stores a notification and pushes it to the user's live sessions.
pub async fn notify(
    mongodb: &MongoDB,
    hub: &Addr<NotificationHub>,
    new: NewNotification<'_>,
) -> AppResult<Notification> {
    let notification = Notification {
        id: new_id(),
        user_id: new.user_id.to_string(),
        kind: new.kind,
        title: new.title.to_string(),
        message: new.message,
        link: new.link,
        is_read: false,
        created_at: Utc::now(),
    };
    mongodb.notifications().insert_one(&notification).await?;
    hub.do_send(Deliver::to(new.user_id, "notification:new", &notification));
    Ok(notification)
}

/// Like [`notify`] but a failure only gets logged; used after the primary
/// write already succeeded.
pub async fn notify_quietly(data: &AppState, new: NewNotification<'_>) {
    let user_id = new.user_id.to_string();
    if let Err(e) = notify(&data.mongodb, &data.notification_hub, new).await {
        error!("Failed to notify {}: {}", user_id, e);
    }
}

/// GET /api/v1/notifications
pub async fn list_notifications(
    data: web::Data<AppState>,
    auth: AuthUser,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let notifications: Vec<Notification> = data
        .mongodb
        .notifications()
        .find(doc! { "user_id": &auth.id })
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(notifications))
}

/// GET /api/v1/notifications/unread-count
pub async fn unread_count(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let count = data
        .mongodb
        .notifications()
        .count_documents(doc! { "user_id": &auth.id, "is_read": false })
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "count": count })))
}

/// PATCH /api/v1/notifications/{id}/read
pub async fn mark_read(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let res = data
        .mongodb
        .notifications()
        .update_one(
            doc! { "_id": id.as_str(), "user_id": &auth.id },
            doc! { "$set": { "is_read": true } },
        )
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::not_found("Notification"));
    }
    Ok(HttpResponse::NoContent().finish())
}

/// PATCH /api/v1/notifications/read-all
pub async fn mark_all_read(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let res = data
        .mongodb
        .notifications()
        .update_many(
            doc! { "user_id": &auth.id, "is_read": false },
            doc! { "$set": { "is_read": true } },
        )
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "updated": res.modified_count })))
}
