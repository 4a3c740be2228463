use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{bson_datetime, bson_datetime_opt};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
    OnHold,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Open => "open",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
            ProjectStatus::OnHold => "on_hold",
        }
    }

    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Open, InProgress | Cancelled | OnHold)
                | (OnHold, Open | Cancelled)
                | (InProgress, Completed | Cancelled | OnHold)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetType {
    Fixed,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    #[serde(rename = "type")]
    pub budget_type: BudgetType,
    pub min: i64,
    pub max: i64,
}

impl Budget {
    pub fn validate(&self) -> AppResult<()> {
        if self.min <= 0 || self.max <= 0 {
            return Err(AppError::bad_request("Budget must be greater than zero"));
        }
        if self.min > self.max {
            return Err(AppError::bad_request("Budget minimum cannot exceed maximum"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "_id")]
    pub id: String,
    pub client_id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub budget: Budget,
    #[serde(with = "bson_datetime_opt", default)]
    pub deadline: Option<DateTime<Utc>>,
    pub status: ProjectStatus,
    #[serde(default)]
    pub proposal_count: u32,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_status_transitions() {
        use ProjectStatus::*;
        assert!(Open.can_transition_to(InProgress));
        assert!(OnHold.can_transition_to(Open));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Open.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Open));
        assert!(!Cancelled.can_transition_to(Open));
    }

    #[test]
    fn budget_validation() {
        let ok = Budget { budget_type: BudgetType::Fixed, min: 10_000, max: 50_000 };
        assert!(ok.validate().is_ok());

        let inverted = Budget { budget_type: BudgetType::Hourly, min: 5_000, max: 1_000 };
        assert!(inverted.validate().is_err());

        let zero = Budget { budget_type: BudgetType::Fixed, min: 0, max: 1_000 };
        assert!(zero.validate().is_err());
    }
}
