use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bson_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HireRequestStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
}

impl HireRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HireRequestStatus::Pending => "pending",
            HireRequestStatus::Accepted => "accepted",
            HireRequestStatus::Declined => "declined",
            HireRequestStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HireNowRequest {
    #[serde(rename = "_id")]
    pub id: String,
    pub client_id: String,
    pub freelancer_id: String,
    pub title: String,
    pub description: String,
    /// Cents.
    pub budget: i64,
    pub status: HireRequestStatus,
    pub contract_id: Option<String>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}
