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
    conversation::{Conversation, Message},
    new_id, PageQuery,
};
use crate::notification_hub::Deliver;
use crate::users::find_user;

const MAX_MESSAGE_LEN: usize = 5_000;

#[derive(Debug, Deserialize)]
pub struct StartConversationRequest {
    pub participant_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl SendMessageRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.content.trim().is_empty() && self.attachments.is_empty() {
            return Err(AppError::bad_request("Message cannot be empty"));
        }
        if self.content.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::bad_request(format!(
                "Message cannot exceed {MAX_MESSAGE_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Participants stored in a stable order so a pair maps to one thread.
pub fn participant_pair(a: &str, b: &str) -> Vec<String> {
    let mut pair = vec![a.to_string(), b.to_string()];
    pair.sort();
    pair
}

async fn find_conversation_for(data: &AppState, auth: &AuthUser, id: &str) -> AppResult<Conversation> {
    let conversation = data
        .mongodb
        .conversations()
        .find_one(doc! { "_id": id })
        .await?
        .ok_or_else(|| AppError::not_found("Conversation"))?;
    if !conversation.has_participant(&auth.id) {
        return Err(AppError::forbidden("You are not part of this conversation"));
    }
    Ok(conversation)
}

/// POST /api/v1/conversations
/// Returns the existing thread with that user or opens a new one.
pub async fn start_conversation(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<StartConversationRequest>,
) -> AppResult<HttpResponse> {
    if info.participant_id == auth.id {
        return Err(AppError::bad_request("You cannot message yourself"));
    }
    find_user(&data, &info.participant_id).await?;

    let participants = participant_pair(&auth.id, &info.participant_id);
    let conversations = data.mongodb.conversations();
    if let Some(existing) = conversations.find_one(doc! { "participants": &participants }).await? {
        return Ok(HttpResponse::Ok().json(existing));
    }

    let now = Utc::now();
    let conversation = Conversation {
        id: new_id(),
        participants,
        last_message: None,
        last_message_at: now,
        created_at: now,
    };
    conversations.insert_one(&conversation).await?;
    info!("Conversation {} opened by {}", conversation.id, auth.id);
    Ok(HttpResponse::Created().json(conversation))
}

/// GET /api/v1/conversations
pub async fn list_conversations(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let conversations: Vec<Conversation> = data
        .mongodb
        .conversations()
        .find(doc! { "participants": &auth.id })
        .sort(doc! { "last_message_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(conversations))
}

/// GET /api/v1/conversations/{id}/messages
/// Oldest first. Marks the other side's messages as read.
pub async fn get_messages(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let conversation = find_conversation_for(&data, &auth, &id).await?;
    let messages_coll = data.mongodb.messages();
    let messages: Vec<Message> = messages_coll
        .find(doc! { "conversation_id": &conversation.id })
        .sort(doc! { "created_at": 1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;

    messages_coll
        .update_many(
            doc! {
                "conversation_id": &conversation.id,
                "sender_id": { "$ne": &auth.id },
                "read_by": { "$ne": &auth.id },
            },
            doc! { "$addToSet": { "read_by": &auth.id } },
        )
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /api/v1/conversations/{id}/messages
pub async fn send_message(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<SendMessageRequest>,
) -> AppResult<HttpResponse> {
    info.validate()?;
    let conversation = find_conversation_for(&data, &auth, &id).await?;

    let info = info.into_inner();
    let now = Utc::now();
    let message = Message {
        id: new_id(),
        conversation_id: conversation.id.clone(),
        sender_id: auth.id.clone(),
        content: info.content.trim().to_string(),
        attachments: info.attachments,
        read_by: vec![auth.id.clone()],
        created_at: now,
    };
    data.mongodb.messages().insert_one(&message).await?;

    let preview: String = message.content.chars().take(100).collect();
    data.mongodb
        .conversations()
        .update_one(
            doc! { "_id": &conversation.id },
            doc! { "$set": {
                "last_message": preview,
                "last_message_at": bson::DateTime::from_chrono(now),
            } },
        )
        .await?;

    data.notification_hub.do_send(Deliver {
        user_ids: conversation.other_participants(&auth.id).cloned().collect(),
        event: "message:new".to_string(),
        payload: serde_json::to_value(&message).unwrap_or_default(),
    });
    Ok(HttpResponse::Created().json(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_order_is_stable() {
        assert_eq!(participant_pair("b", "a"), participant_pair("a", "b"));
        assert_eq!(participant_pair("b", "a"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn message_validation() {
        let empty = SendMessageRequest { content: "   ".into(), attachments: vec![] };
        assert!(empty.validate().is_err());

        let attachment_only = SendMessageRequest {
            content: String::new(),
            attachments: vec!["https://cdn.example.com/brief.pdf".into()],
        };
        assert!(attachment_only.validate().is_ok());

        let long = SendMessageRequest { content: "x".repeat(MAX_MESSAGE_LEN + 1), attachments: vec![] };
        assert!(long.validate().is_err());
    }

    #[test]
    fn other_participants_excludes_sender() {
        let now = Utc::now();
        let c = Conversation {
            id: "c".into(),
            participants: participant_pair("u1", "u2"),
            last_message: None,
            last_message_at: now,
            created_at: now,
        };
        let others: Vec<_> = c.other_participants("u1").collect();
        assert_eq!(others, vec!["u2"]);
    }
}
