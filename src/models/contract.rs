use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{bson_datetime, bson_datetime_opt};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Completed,
    Cancelled,
    Disputed,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Active => "active",
            ContractStatus::Completed => "completed",
            ContractStatus::Cancelled => "cancelled",
            ContractStatus::Disputed => "disputed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Submitted,
    Approved,
    Paid,
    Rejected,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Submitted => "submitted",
            MilestoneStatus::Approved => "approved",
            MilestoneStatus::Paid => "paid",
            MilestoneStatus::Rejected => "rejected",
        }
    }

    /// `paid` is only reachable from `approved`, and only through a payment release.
    pub fn can_transition_to(self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Submitted, Approved | Rejected)
                | (Rejected, Submitted)
                | (Approved, Paid)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    /// Cents.
    pub amount: i64,
    #[serde(with = "bson_datetime_opt", default)]
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    pub submission_note: Option<String>,
    pub rejection_reason: Option<String>,
    #[serde(with = "bson_datetime_opt", default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(with = "bson_datetime_opt", default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(with = "bson_datetime_opt", default)]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Milestone {
    pub fn new(title: String, description: Option<String>, amount: i64, due_date: Option<DateTime<Utc>>) -> Self {
        Milestone {
            id: super::new_id(),
            title,
            description,
            amount,
            due_date,
            status: MilestoneStatus::Pending,
            submission_note: None,
            rejection_reason: None,
            submitted_at: None,
            approved_at: None,
            paid_at: None,
        }
    }

    /// Moves to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: MilestoneStatus, now: DateTime<Utc>) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::bad_request(format!(
                "Milestone cannot move from {} to {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        match next {
            MilestoneStatus::Submitted => {
                self.submitted_at = Some(now);
                self.rejection_reason = None;
            }
            MilestoneStatus::Approved => self.approved_at = Some(now),
            MilestoneStatus::Paid => self.paid_at = Some(now),
            MilestoneStatus::Pending | MilestoneStatus::Rejected => {}
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    #[serde(rename = "_id")]
    pub id: String,
    pub project_id: String,
    pub proposal_id: Option<String>,
    pub client_id: String,
    pub freelancer_id: String,
    pub title: String,
    /// Cents.
    pub total_amount: i64,
    pub status: ContractStatus,
    pub milestones: Vec<Milestone>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.client_id == user_id || self.freelancer_id == user_id
    }

    /// The other side of the contract, if `user_id` is a party.
    pub fn counterparty(&self, user_id: &str) -> Option<&str> {
        if self.client_id == user_id {
            Some(&self.freelancer_id)
        } else if self.freelancer_id == user_id {
            Some(&self.client_id)
        } else {
            None
        }
    }

    pub fn milestone(&self, milestone_id: &str) -> AppResult<&Milestone> {
        self.milestones
            .iter()
            .find(|m| m.id == milestone_id)
            .ok_or_else(|| AppError::not_found("Milestone"))
    }

    pub fn milestone_mut(&mut self, milestone_id: &str) -> AppResult<&mut Milestone> {
        self.milestones
            .iter_mut()
            .find(|m| m.id == milestone_id)
            .ok_or_else(|| AppError::not_found("Milestone"))
    }

    pub fn all_milestones_paid(&self) -> bool {
        !self.milestones.is_empty()
            && self.milestones.iter().all(|m| m.status == MilestoneStatus::Paid)
    }

    /// Appends a milestone and grows the contract total by its amount.
    pub fn push_milestone(&mut self, milestone: Milestone) -> AppResult<()> {
        self.total_amount = self
            .total_amount
            .checked_add(milestone.amount)
            .ok_or_else(|| AppError::bad_request("Contract amount is too large"))?;
        self.milestones.push(milestone);
        Ok(())
    }

    /// Records that the milestone's escrowed funds reached the freelancer.
    /// A submitted milestone counts as approved. Pending or rejected ones are
    /// left alone until the client approves them. The contract completes
    /// with its last paid milestone. `updated_at` is left to the caller.
    pub fn settle_milestone(&mut self, milestone_id: &str, now: DateTime<Utc>) -> AppResult<Settlement> {
        let milestone = self.milestone_mut(milestone_id)?;
        if milestone.status == MilestoneStatus::Submitted {
            milestone.transition(MilestoneStatus::Approved, now)?;
        }
        if milestone.status != MilestoneStatus::Approved {
            return Ok(Settlement::Unchanged(milestone.status));
        }
        milestone.transition(MilestoneStatus::Paid, now)?;

        let completed = self.all_milestones_paid();
        if completed {
            self.status = ContractStatus::Completed;
        }
        Ok(Settlement::Paid { completed })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Paid { completed: bool },
    Unchanged(MilestoneStatus),
}

/// Milestones supplied with a proposal acceptance must cover the bid exactly.
pub fn check_milestone_total(milestones: &[Milestone], expected: i64) -> AppResult<()> {
    if milestones.iter().any(|m| m.amount <= 0) {
        return Err(AppError::bad_request("Milestone amount must be greater than zero"));
    }
    let total = milestones
        .iter()
        .try_fold(0i64, |acc, m| acc.checked_add(m.amount))
        .ok_or_else(|| AppError::bad_request("Milestone amounts are too large"))?;
    if total != expected {
        return Err(AppError::bad_request(format!(
            "Milestone amounts ({total}) must add up to the contract amount ({expected})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milestone(amount: i64) -> Milestone {
        Milestone::new("Design".into(), None, amount, None)
    }

    fn contract(milestones: Vec<Milestone>) -> Contract {
        Contract {
            id: "c1".into(),
            project_id: "p1".into(),
            proposal_id: None,
            client_id: "client".into(),
            freelancer_id: "free".into(),
            title: "Site".into(),
            total_amount: milestones.iter().map(|m| m.amount).sum(),
            status: ContractStatus::Active,
            milestones,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn pending_cannot_jump_to_paid() {
        let mut m = milestone(10_000);
        let err = m.transition(MilestoneStatus::Paid, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(m.status, MilestoneStatus::Pending);
    }

    #[test]
    fn full_milestone_lifecycle() {
        let now = Utc::now();
        let mut m = milestone(10_000);
        m.transition(MilestoneStatus::Submitted, now).unwrap();
        m.transition(MilestoneStatus::Rejected, now).unwrap();
        m.transition(MilestoneStatus::Submitted, now).unwrap();
        m.transition(MilestoneStatus::Approved, now).unwrap();
        m.transition(MilestoneStatus::Paid, now).unwrap();
        assert_eq!(m.status, MilestoneStatus::Paid);
        assert!(m.submitted_at.is_some());
        assert!(m.approved_at.is_some());
        assert!(m.paid_at.is_some());
    }

    #[test]
    fn submitted_cannot_be_paid_without_approval() {
        assert!(!MilestoneStatus::Submitted.can_transition_to(MilestoneStatus::Paid));
        assert!(!MilestoneStatus::Paid.can_transition_to(MilestoneStatus::Pending));
        assert!(!MilestoneStatus::Approved.can_transition_to(MilestoneStatus::Rejected));
    }

    #[test]
    fn milestone_totals_must_match_bid() {
        let ms = vec![milestone(4_000), milestone(6_000)];
        assert!(check_milestone_total(&ms, 10_000).is_ok());
        assert!(check_milestone_total(&ms, 9_000).is_err());
        assert!(check_milestone_total(&[milestone(0), milestone(10_000)], 10_000).is_err());
    }

    #[test]
    fn overflowing_milestone_totals_are_rejected() {
        let ms = vec![milestone(i64::MAX), milestone(i64::MAX), milestone(102)];
        let err = check_milestone_total(&ms, 100).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let mut c = contract(vec![milestone(10_000)]);
        assert!(c.push_milestone(milestone(i64::MAX)).is_err());
        assert_eq!(c.total_amount, 10_000);
        assert_eq!(c.milestones.len(), 1);

        c.push_milestone(milestone(5_000)).unwrap();
        assert_eq!(c.total_amount, 15_000);
        assert_eq!(c.milestones.len(), 2);
    }

    #[test]
    fn settling_pays_approved_or_submitted_milestones() {
        let now = Utc::now();
        let mut first = milestone(4_000);
        first.transition(MilestoneStatus::Submitted, now).unwrap();
        let mut second = milestone(6_000);
        second.transition(MilestoneStatus::Submitted, now).unwrap();
        second.transition(MilestoneStatus::Approved, now).unwrap();
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        let mut c = contract(vec![first, second]);

        assert_eq!(c.settle_milestone(&first_id, now).unwrap(), Settlement::Paid { completed: false });
        assert_eq!(c.milestone(&first_id).unwrap().status, MilestoneStatus::Paid);
        assert!(c.milestone(&first_id).unwrap().approved_at.is_some());
        assert_eq!(c.status, ContractStatus::Active);

        assert_eq!(c.settle_milestone(&second_id, now).unwrap(), Settlement::Paid { completed: true });
        assert_eq!(c.status, ContractStatus::Completed);
        assert!(c.all_milestones_paid());
    }

    #[test]
    fn settling_leaves_unapproved_work_alone() {
        let now = Utc::now();
        let pending = milestone(10_000);
        let id = pending.id.clone();
        let mut c = contract(vec![pending]);

        assert_eq!(
            c.settle_milestone(&id, now).unwrap(),
            Settlement::Unchanged(MilestoneStatus::Pending)
        );
        assert_eq!(c.status, ContractStatus::Active);

        // Approval later lets the already-released funds count.
        c.milestone_mut(&id).unwrap().transition(MilestoneStatus::Submitted, now).unwrap();
        c.milestone_mut(&id).unwrap().transition(MilestoneStatus::Approved, now).unwrap();
        assert_eq!(c.settle_milestone(&id, now).unwrap(), Settlement::Paid { completed: true });
        assert!(matches!(c.settle_milestone("missing", now), Err(AppError::NotFound(_))));
    }

    #[test]
    fn counterparty_lookup() {
        let contract = Contract {
            id: "c1".into(),
            project_id: "p1".into(),
            proposal_id: None,
            client_id: "client".into(),
            freelancer_id: "free".into(),
            title: "Site".into(),
            total_amount: 10_000,
            status: ContractStatus::Active,
            milestones: vec![milestone(10_000)],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(contract.counterparty("client"), Some("free"));
        assert_eq!(contract.counterparty("free"), Some("client"));
        assert_eq!(contract.counterparty("stranger"), None);
        assert!(!contract.all_milestones_paid());
    }
}
