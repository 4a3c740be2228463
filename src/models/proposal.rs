use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bson_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineUnit {
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub duration: u32,
    pub unit: TimelineUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(rename = "_id")]
    pub id: String,
    pub project_id: String,
    pub freelancer_id: String,
    pub cover_letter: String,
    /// Cents.
    pub bid_amount: i64,
    pub timeline: Timeline,
    pub status: ProposalStatus,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}
