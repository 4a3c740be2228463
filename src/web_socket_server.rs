use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, warn};
use mongodb::bson::doc;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::validate_jwt;
use crate::db::MongoDB;
use crate::error::{AppError, AppResult};
use crate::models::conversation::Conversation;
use crate::notification_hub::{Connect, Deliver, Disconnect, NotificationHub, Push};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames a client may send. Everything else is ignored.
#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientFrame {
    Typing { conversation_id: String },
}

/// Who should see `sender` typing. `None` when the sender is not in the thread.
fn typing_targets(conversation: &Conversation, sender: &str) -> Option<Vec<String>> {
    if !conversation.has_participant(sender) {
        return None;
    }
    Some(conversation.other_participants(sender).cloned().collect())
}

pub struct WsSession {
    pub user_id: String,
    pub hb: Instant,
    pub hub: Addr<NotificationHub>,
    pub mongodb: Arc<MongoDB>,
}

impl WsSession {
    fn relay_typing(&self, conversation_id: String) {
        let mongodb = self.mongodb.clone();
        let hub = self.hub.clone();
        let sender = self.user_id.clone();
        actix::spawn(async move {
            let conversation = match mongodb.conversations().find_one(doc! { "_id": &conversation_id }).await {
                Ok(Some(conversation)) => conversation,
                Ok(None) => return,
                Err(e) => {
                    warn!("Typing relay lookup failed for {}: {}", conversation_id, e);
                    return;
                }
            };
            match typing_targets(&conversation, &sender) {
                Some(user_ids) => hub.do_send(Deliver {
                    user_ids,
                    event: "message:typing".to_string(),
                    payload: json!({ "conversation_id": conversation_id, "user_id": sender }),
                }),
                None => debug!("{} is not in conversation {}, typing ignored", sender, conversation_id),
            }
        });
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                debug!("WebSocket heartbeat failed for {}, disconnecting", act.user_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        self.hub.do_send(Connect {
            user_id: self.user_id.clone(),
            addr: ctx.address().recipient(),
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        self.hub.do_send(Disconnect {
            user_id: self.user_id.clone(),
            addr: ctx.address().recipient(),
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Typing { conversation_id }) => self.relay_typing(conversation_id),
                    Err(e) => debug!("Ignoring client frame from {}: {}", self.user_id, e),
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket error for {}: {}", self.user_id, e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<Push> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Push, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// GET /ws?token=<jwt>
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    data: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let claims = validate_jwt(&query.token, &data.config.jwt_secret)?;
    let session = WsSession {
        user_id: claims.sub,
        hb: Instant::now(),
        hub: data.notification_hub.clone(),
        mongodb: data.mongodb.clone(),
    };
    ws::start(session, &req, stream).map_err(|e| AppError::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn conversation(participants: &[&str]) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: "c1".into(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            last_message: None,
            last_message_at: now,
            created_at: now,
        }
    }

    #[test]
    fn typing_only_reaches_the_other_participant() {
        let c = conversation(&["alice", "bob"]);
        assert_eq!(typing_targets(&c, "alice"), Some(vec!["bob".to_string()]));
        assert_eq!(typing_targets(&c, "mallory"), None);
    }

    #[test]
    fn typing_frame_names_only_the_conversation() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"typing","conversation_id":"c1"}"#).unwrap();
        let ClientFrame::Typing { conversation_id } = frame;
        assert_eq!(conversation_id, "c1");
        assert!(serde_json::from_str::<ClientFrame>(r#"{"event":"shout","to":"bob"}"#).is_err());
    }
}
