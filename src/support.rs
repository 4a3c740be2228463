use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::doc;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::models::{
    new_id,
    notification::NotificationKind,
    support_ticket::{SupportTicket, TicketMessage, TicketStatus},
    user::Role,
    PageQuery,
};
use crate::notifications::{notify_quietly, NewNotification};

const MAX_BODY_LEN: usize = 5_000;

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub message: String,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TicketReply {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct TicketStatusRequest {
    pub status: TicketStatus,
}

#[derive(Debug, Deserialize)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
}

fn check_body(body: &str) -> AppResult<String> {
    let body = body.trim();
    if body.is_empty() {
        return Err(AppError::bad_request("Message cannot be empty"));
    }
    if body.chars().count() > MAX_BODY_LEN {
        return Err(AppError::bad_request(format!(
            "Message cannot exceed {MAX_BODY_LEN} characters"
        )));
    }
    Ok(body.to_string())
}

/// A reply from the user reopens a resolved ticket; staff replies on an open
/// one mark it in progress. Closed tickets take no replies.
pub fn status_after_reply(current: TicketStatus, is_staff: bool) -> AppResult<TicketStatus> {
    match (current, is_staff) {
        (TicketStatus::Closed, _) => Err(AppError::bad_request("This ticket is closed")),
        (TicketStatus::Open, true) => Ok(TicketStatus::InProgress),
        (TicketStatus::Resolved, false) => Ok(TicketStatus::Open),
        (status, _) => Ok(status),
    }
}

async fn find_ticket_for(data: &AppState, auth: &AuthUser, id: &str) -> AppResult<SupportTicket> {
    let ticket = data
        .mongodb
        .support_tickets()
        .find_one(doc! { "_id": id })
        .await?
        .ok_or_else(|| AppError::not_found("Ticket"))?;
    if ticket.user_id != auth.id && !auth.is_admin() {
        return Err(AppError::forbidden("This ticket belongs to someone else"));
    }
    Ok(ticket)
}

/// POST /api/v1/support/tickets
pub async fn create_ticket(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<CreateTicketRequest>,
) -> AppResult<HttpResponse> {
    let subject = info.subject.trim();
    if subject.is_empty() {
        return Err(AppError::bad_request("Subject is required"));
    }
    let body = check_body(&info.message)?;

    let now = Utc::now();
    let ticket = SupportTicket {
        id: new_id(),
        user_id: auth.id.clone(),
        subject: subject.to_string(),
        category: info.category.trim().to_lowercase(),
        status: TicketStatus::Open,
        messages: vec![TicketMessage {
            author_id: auth.id.clone(),
            is_staff: false,
            body,
            sent_at: now,
        }],
        created_at: now,
        updated_at: now,
    };
    data.mongodb.support_tickets().insert_one(&ticket).await?;
    info!("Support ticket {} opened by {}", ticket.id, auth.id);
    Ok(HttpResponse::Created().json(ticket))
}

/// GET /api/v1/support/tickets
pub async fn my_tickets(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let tickets: Vec<SupportTicket> = data
        .mongodb
        .support_tickets()
        .find(doc! { "user_id": &auth.id })
        .sort(doc! { "updated_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(tickets))
}

/// GET /api/v1/support/tickets/{id}
pub async fn get_ticket(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(find_ticket_for(&data, &auth, &id).await?))
}

/// POST /api/v1/support/tickets/{id}/messages
/// Used by the ticket owner and by staff replying.
pub async fn reply_to_ticket(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<TicketReply>,
) -> AppResult<HttpResponse> {
    let body = check_body(&info.message)?;
    let mut ticket = find_ticket_for(&data, &auth, &id).await?;
    let is_staff = auth.is_admin() && ticket.user_id != auth.id;
    let prior = ticket.status;
    ticket.status = status_after_reply(prior, is_staff)?;

    let now = Utc::now();
    ticket.messages.push(TicketMessage {
        author_id: auth.id.clone(),
        is_staff,
        body,
        sent_at: now,
    });
    ticket.updated_at = now;
    let res = data
        .mongodb
        .support_tickets()
        .replace_one(doc! { "_id": &ticket.id, "status": prior.as_str() }, &ticket)
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::conflict("Ticket was modified concurrently, please retry"));
    }

    if is_staff {
        notify_quietly(
            &data,
            NewNotification {
                user_id: &ticket.user_id,
                kind: NotificationKind::System,
                title: "Support replied",
                message: format!("New reply on \"{}\"", ticket.subject),
                link: Some(format!("/support/{}", ticket.id)),
            },
        )
        .await;
    }
    Ok(HttpResponse::Ok().json(ticket))
}

/// GET /api/v1/admin/support/tickets
pub async fn list_all_tickets(
    data: web::Data<AppState>,
    auth: AuthUser,
    filter: web::Query<TicketFilter>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let mut query = doc! {};
    if let Some(status) = filter.status {
        query.insert("status", status.as_str());
    }
    let tickets: Vec<SupportTicket> = data
        .mongodb
        .support_tickets()
        .find(query)
        .sort(doc! { "updated_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(tickets))
}

/// PATCH /api/v1/admin/support/tickets/{id}/status
pub async fn update_ticket_status(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<TicketStatusRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let res = data
        .mongodb
        .support_tickets()
        .update_one(
            doc! { "_id": id.as_str() },
            doc! { "$set": {
                "status": info.status.as_str(),
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            } },
        )
        .await?;
    if res.matched_count == 0 {
        return Err(AppError::not_found("Ticket"));
    }
    info!("Ticket {} set to {} by {}", id, info.status.as_str(), auth.id);
    let ticket = find_ticket_for(&data, &auth, &id).await?;

    notify_quietly(
        &data,
        NewNotification {
            user_id: &ticket.user_id,
            kind: NotificationKind::System,
            title: "Ticket updated",
            message: format!("\"{}\" is now {}", ticket.subject, ticket.status.as_str().replace('_', " ")),
            link: Some(format!("/support/{}", ticket.id)),
        },
    )
    .await;
    Ok(HttpResponse::Ok().json(ticket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_move_ticket_status() {
        use TicketStatus::*;
        assert_eq!(status_after_reply(Open, true).unwrap(), InProgress);
        assert_eq!(status_after_reply(Open, false).unwrap(), Open);
        assert_eq!(status_after_reply(Resolved, false).unwrap(), Open);
        assert_eq!(status_after_reply(Resolved, true).unwrap(), Resolved);
        assert_eq!(status_after_reply(InProgress, true).unwrap(), InProgress);
        assert!(status_after_reply(Closed, false).is_err());
    }

    #[test]
    fn body_is_trimmed_and_bounded() {
        assert_eq!(check_body("  help  ").unwrap(), "help");
        assert!(check_body("   ").is_err());
        assert!(check_body(&"x".repeat(MAX_BODY_LEN + 1)).is_err());
    }
}
