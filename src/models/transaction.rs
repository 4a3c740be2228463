use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{bson_datetime, bson_datetime_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    HeldInEscrow,
    Released,
    Refunded,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::HeldInEscrow => "held_in_escrow",
            TransactionStatus::Released => "released",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that still occupy the milestone; a new funding attempt must wait.
    pub fn occupies_milestone(&self) -> bool {
        !matches!(self, TransactionStatus::Failed | TransactionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub contract_id: String,
    pub milestone_id: String,
    pub client_id: String,
    pub freelancer_id: String,
    /// All amounts in cents.
    pub amount: i64,
    pub platform_commission: i64,
    pub freelancer_amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_intent_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
    #[serde(with = "bson_datetime_opt", default)]
    pub escrow_release_date: Option<DateTime<Utc>>,
    #[serde(with = "bson_datetime_opt", default)]
    pub released_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Held funds whose release date has passed.
    pub fn is_due_for_release(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::HeldInEscrow
            && self.escrow_release_date.is_some_and(|at| at <= now)
    }
}

/// Splits `amount` into `(platform_commission, freelancer_amount)`.
/// `rate_percent` is rounded half away from zero to whole cents.
pub fn split_commission(amount: i64, rate_percent: f64) -> (i64, i64) {
    let commission = ((amount as f64) * rate_percent / 100.0).round() as i64;
    let commission = commission.clamp(0, amount);
    (commission, amount - commission)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn commission_split() {
        assert_eq!(split_commission(10_000, 10.0), (1_000, 9_000));
        assert_eq!(split_commission(999, 10.0), (100, 899));
        assert_eq!(split_commission(12_345, 0.0), (0, 12_345));
        assert_eq!(split_commission(5_000, 12.5), (625, 4_375));
    }

    #[test]
    fn due_only_when_held_and_past_release_date() {
        let now = Utc::now();
        let mut tx = Transaction {
            id: "t1".into(),
            contract_id: "c1".into(),
            milestone_id: "m1".into(),
            client_id: "client".into(),
            freelancer_id: "free".into(),
            amount: 10_000,
            platform_commission: 1_000,
            freelancer_amount: 9_000,
            currency: "usd".into(),
            status: TransactionStatus::HeldInEscrow,
            payment_intent_id: None,
            transfer_id: None,
            refund_id: None,
            escrow_release_date: Some(now - Duration::hours(1)),
            released_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        assert!(tx.is_due_for_release(now));

        tx.escrow_release_date = Some(now + Duration::hours(1));
        assert!(!tx.is_due_for_release(now));

        tx.escrow_release_date = Some(now);
        assert!(tx.is_due_for_release(now));

        tx.status = TransactionStatus::Released;
        assert!(!tx.is_due_for_release(now));

        tx.status = TransactionStatus::HeldInEscrow;
        tx.escrow_release_date = None;
        assert!(!tx.is_due_for_release(now));
    }
}
