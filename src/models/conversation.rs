use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bson_datetime;

/// A one-to-one thread between two users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,
    pub participants: Vec<String>,
    pub last_message: Option<String>,
    #[serde(with = "bson_datetime")]
    pub last_message_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn other_participants<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a String> {
        self.participants.iter().filter(move |p| p.as_str() != user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
}
