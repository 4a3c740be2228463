use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bson_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Resolved,
    Closed,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::UnderReview => "under_review",
            DisputeStatus::Resolved => "resolved",
            DisputeStatus::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: DisputeStatus) -> bool {
        use DisputeStatus::*;
        matches!(
            (self, next),
            (Open, UnderReview) | (Open, Resolved) | (Open, Closed) | (UnderReview, Resolved) | (UnderReview, Closed)
        )
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, DisputeStatus::Resolved | DisputeStatus::Closed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    #[serde(rename = "_id")]
    pub id: String,
    pub contract_id: String,
    pub raised_by: String,
    pub against: String,
    pub reason: String,
    pub description: String,
    pub status: DisputeStatus,
    pub resolution: Option<String>,
    pub resolved_by: Option<String>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_disputes_stay_settled() {
        use DisputeStatus::*;
        assert!(Open.can_transition_to(UnderReview));
        assert!(UnderReview.can_transition_to(Resolved));
        assert!(!UnderReview.can_transition_to(Open));
        assert!(!Resolved.can_transition_to(UnderReview));
        assert!(!Closed.can_transition_to(Resolved));
        assert!(Resolved.is_settled() && Closed.is_settled());
    }
}
