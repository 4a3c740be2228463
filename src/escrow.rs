//! Escrow release: moving held funds to the freelancer once a milestone is
//! approved or its hold period runs out.
//!
//! The auto-release pass is a plain sequential batch. It is triggered by the
//! interval task spawned from `main` and by the admin endpoint; both call
//! [`auto_release_escrow_payments`]. Nothing serialises the two triggers.

use std::sync::Arc;
use std::time::Duration;

use actix::Addr;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use log::{error, info, warn};
use mongodb::bson::doc;
use serde::Serialize;

use crate::app_state::AppState;
use crate::contracts::complete_project;
use crate::db::MongoDB;
use crate::error::{AppError, AppResult};
use crate::models::{
    contract::Settlement,
    notification::NotificationKind,
    transaction::{Transaction, TransactionStatus},
};
use crate::notification_hub::NotificationHub;
use crate::notifications::{notify, NewNotification};
use crate::payment_log::PaymentDebugLogger;
use crate::payments::money;
use crate::stripe::{PayoutGateway, PayoutRequest};

/// Persistence the release flow needs.
#[async_trait]
pub trait EscrowLedger: Send + Sync {
    async fn due_for_release(&self, now: DateTime<Utc>) -> AppResult<Vec<Transaction>>;

    /// Connected payout account of the freelancer.
    async fn payout_destination(&self, freelancer_id: &str) -> AppResult<Option<String>>;

    async fn mark_released(&self, tx: &Transaction, transfer_id: &str, now: DateTime<Utc>) -> AppResult<()>;

    /// Pays the funded milestone once its transaction is released.
    async fn settle_milestone(&self, tx: &Transaction, now: DateTime<Utc>) -> AppResult<()>;

    async fn record_failure(&self, tx: &Transaction, reason: &str) -> AppResult<()>;
}

#[derive(Debug, Serialize)]
pub struct ReleaseFailure {
    pub transaction_id: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ReleaseSummary {
    pub processed: usize,
    pub released: usize,
    pub failed: usize,
    pub failures: Vec<ReleaseFailure>,
}

/// Transfers one held transaction and records it as released.
/// On failure the transaction keeps its status; the reason is stored.
/// Once the transaction is released, milestone bookkeeping errors are only logged.
pub async fn release_transaction(
    ledger: &dyn EscrowLedger,
    gateway: &dyn PayoutGateway,
    tx: &Transaction,
    now: DateTime<Utc>,
) -> AppResult<String> {
    let log = PaymentDebugLogger::start("release", &tx.id);

    let result = async {
        if tx.status != TransactionStatus::HeldInEscrow {
            return Err(AppError::bad_request(format!(
                "Only funds held in escrow can be released (status is {})",
                tx.status.as_str()
            )));
        }
        let destination = ledger
            .payout_destination(&tx.freelancer_id)
            .await?
            .ok_or_else(|| AppError::bad_request("Freelancer has no connected payout account"))?;
        log.step(format!("transferring {} {} to {}", tx.freelancer_amount, tx.currency, destination));

        let transfer_id = gateway
            .transfer(&PayoutRequest {
                transaction_id: tx.id.clone(),
                destination,
                amount: tx.freelancer_amount,
                currency: tx.currency.clone(),
            })
            .await?;
        log.step(format!("transfer {transfer_id} created"));

        ledger.mark_released(tx, &transfer_id, now).await?;
        Ok::<_, AppError>(transfer_id)
    }
    .await;

    if result.is_ok() {
        if let Err(e) = ledger.settle_milestone(tx, now).await {
            error!(
                "Transaction {} released but milestone {} was not settled: {}",
                tx.id, tx.milestone_id, e
            );
        }
    }

    match &result {
        Ok(transfer_id) => log.finished(format!("released via {transfer_id}")),
        Err(e) => {
            log.failed(e);
            if tx.status == TransactionStatus::HeldInEscrow {
                if let Err(record_err) = ledger.record_failure(tx, &e.to_string()).await {
                    error!("Could not record release failure for {}: {}", tx.id, record_err);
                }
            }
        }
    }
    result
}

/// Releases every held transaction whose `escrow_release_date` has passed.
/// One failure never stops the batch.
pub async fn auto_release_escrow_payments(
    ledger: &dyn EscrowLedger,
    gateway: &dyn PayoutGateway,
    now: DateTime<Utc>,
) -> AppResult<ReleaseSummary> {
    let mut due = ledger.due_for_release(now).await?;
    due.retain(|tx| tx.is_due_for_release(now));

    let mut summary = ReleaseSummary::default();
    for tx in &due {
        summary.processed += 1;
        match release_transaction(ledger, gateway, tx, now).await {
            Ok(_) => summary.released += 1,
            Err(e) => {
                summary.failed += 1;
                summary.failures.push(ReleaseFailure {
                    transaction_id: tx.id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        "Escrow auto-release: processed={} released={} failed={}",
        summary.processed, summary.released, summary.failed
    );
    Ok(summary)
}

pub struct MongoEscrowLedger {
    mongodb: Arc<MongoDB>,
    hub: Addr<NotificationHub>,
}

impl MongoEscrowLedger {
    pub fn new(mongodb: Arc<MongoDB>, hub: Addr<NotificationHub>) -> Self {
        MongoEscrowLedger { mongodb, hub }
    }

    pub fn from_state(data: &AppState) -> Self {
        Self::new(data.mongodb.clone(), data.notification_hub.clone())
    }
}

#[async_trait]
impl EscrowLedger for MongoEscrowLedger {
    async fn due_for_release(&self, now: DateTime<Utc>) -> AppResult<Vec<Transaction>> {
        let due = self
            .mongodb
            .transactions()
            .find(doc! {
                "status": TransactionStatus::HeldInEscrow.as_str(),
                "escrow_release_date": { "$lte": bson::DateTime::from_chrono(now) },
            })
            .sort(doc! { "escrow_release_date": 1 })
            .await?
            .try_collect()
            .await?;
        Ok(due)
    }

    async fn payout_destination(&self, freelancer_id: &str) -> AppResult<Option<String>> {
        let user = self
            .mongodb
            .users()
            .find_one(doc! { "_id": freelancer_id })
            .await?
            .ok_or_else(|| AppError::not_found("Freelancer"))?;
        Ok(user.stripe_account_id)
    }

    async fn mark_released(&self, tx: &Transaction, transfer_id: &str, now: DateTime<Utc>) -> AppResult<()> {
        let at = bson::DateTime::from_chrono(now);
        self.mongodb
            .transactions()
            .update_one(
                doc! { "_id": &tx.id },
                doc! {
                    "$set": {
                        "status": TransactionStatus::Released.as_str(),
                        "transfer_id": transfer_id,
                        "released_at": at,
                        "updated_at": at,
                    },
                    "$unset": { "failure_reason": "" },
                },
            )
            .await?;

        let payment_notice = NewNotification {
            user_id: &tx.freelancer_id,
            kind: NotificationKind::Payment,
            title: "Payment released",
            message: format!(
                "{} has been released to your account",
                money(tx.freelancer_amount, &tx.currency)
            ),
            link: Some(format!("/contracts/{}", tx.contract_id)),
        };
        if let Err(e) = notify(&self.mongodb, &self.hub, payment_notice).await {
            error!("Failed to notify release of {}: {}", tx.id, e);
        }
        Ok(())
    }

    /// A submitted milestone whose hold period lapsed counts as approved.
    async fn settle_milestone(&self, tx: &Transaction, now: DateTime<Utc>) -> AppResult<()> {
        let contracts = self.mongodb.contracts();
        let mut contract = contracts
            .find_one(doc! { "_id": &tx.contract_id })
            .await?
            .ok_or_else(|| AppError::not_found("Contract"))?;

        match contract.settle_milestone(&tx.milestone_id, now)? {
            Settlement::Unchanged(status) => {
                warn!(
                    "Funds for milestone {} released while it is {}; it is paid on approval",
                    tx.milestone_id,
                    status.as_str()
                );
            }
            Settlement::Paid { completed } => {
                contract.updated_at = now;
                contracts.replace_one(doc! { "_id": &contract.id }, &contract).await?;
                if completed {
                    complete_project(&self.mongodb, &contract.project_id, now).await?;
                    info!("Contract {} completed", contract.id);
                }
            }
        }
        Ok(())
    }

    async fn record_failure(&self, tx: &Transaction, reason: &str) -> AppResult<()> {
        self.mongodb
            .transactions()
            .update_one(
                doc! { "_id": &tx.id },
                doc! { "$set": {
                    "failure_reason": reason,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                } },
            )
            .await?;
        Ok(())
    }
}

/// Runs the auto-release pass every `interval` on the current arbiter.
pub fn spawn_auto_release(state: AppState, interval: Duration) {
    actix_web::rt::spawn(async move {
        let ledger = MongoEscrowLedger::from_state(&state);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) =
                auto_release_escrow_payments(&ledger, state.stripe.as_ref(), Utc::now()).await
            {
                error!("Escrow auto-release pass failed: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLedger {
        transactions: Mutex<Vec<Transaction>>,
        accounts: HashMap<String, String>,
        failures: Mutex<Vec<(String, String)>>,
        settled: Mutex<Vec<String>>,
        settle_fails: bool,
    }

    #[async_trait]
    impl EscrowLedger for FakeLedger {
        /// Returns everything so the batch's own filtering is exercised.
        async fn due_for_release(&self, _now: DateTime<Utc>) -> AppResult<Vec<Transaction>> {
            Ok(self.transactions.lock().unwrap().clone())
        }

        async fn payout_destination(&self, freelancer_id: &str) -> AppResult<Option<String>> {
            Ok(self.accounts.get(freelancer_id).cloned())
        }

        async fn mark_released(&self, tx: &Transaction, transfer_id: &str, now: DateTime<Utc>) -> AppResult<()> {
            let mut txs = self.transactions.lock().unwrap();
            let stored = txs.iter_mut().find(|t| t.id == tx.id).unwrap();
            stored.status = TransactionStatus::Released;
            stored.transfer_id = Some(transfer_id.to_string());
            stored.released_at = Some(now);
            Ok(())
        }

        async fn settle_milestone(&self, tx: &Transaction, _now: DateTime<Utc>) -> AppResult<()> {
            if self.settle_fails {
                return Err(AppError::not_found("Contract"));
            }
            self.settled.lock().unwrap().push(tx.milestone_id.clone());
            Ok(())
        }

        async fn record_failure(&self, tx: &Transaction, reason: &str) -> AppResult<()> {
            self.failures.lock().unwrap().push((tx.id.clone(), reason.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        payouts: Mutex<Vec<PayoutRequest>>,
        reject_destination: Option<String>,
    }

    #[async_trait]
    impl PayoutGateway for FakeGateway {
        async fn transfer(&self, payout: &PayoutRequest) -> AppResult<String> {
            if self.reject_destination.as_deref() == Some(payout.destination.as_str()) {
                return Err(AppError::Payment("destination account is restricted".into()));
            }
            let mut payouts = self.payouts.lock().unwrap();
            payouts.push(payout.clone());
            Ok(format!("tr_{}", payouts.len()))
        }
    }

    fn tx(id: &str, freelancer: &str, status: TransactionStatus, release: Option<DateTime<Utc>>) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: id.into(),
            contract_id: "c1".into(),
            milestone_id: format!("m-{id}"),
            client_id: "client".into(),
            freelancer_id: freelancer.into(),
            amount: 10_000,
            platform_commission: 1_000,
            freelancer_amount: 9_000,
            currency: "usd".into(),
            status,
            payment_intent_id: Some(format!("pi_{id}")),
            transfer_id: None,
            refund_id: None,
            escrow_release_date: release,
            released_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn ledger_with(transactions: Vec<Transaction>) -> FakeLedger {
        FakeLedger {
            transactions: Mutex::new(transactions),
            accounts: HashMap::from([
                ("alice".to_string(), "acct_alice".to_string()),
                ("bob".to_string(), "acct_bob".to_string()),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn only_held_and_due_transactions_are_released() {
        let now = Utc::now();
        let past = Some(now - ChronoDuration::days(1));
        let future = Some(now + ChronoDuration::days(1));
        let ledger = ledger_with(vec![
            tx("due", "alice", TransactionStatus::HeldInEscrow, past),
            tx("exactly-now", "bob", TransactionStatus::HeldInEscrow, Some(now)),
            tx("not-yet", "alice", TransactionStatus::HeldInEscrow, future),
            tx("pending", "alice", TransactionStatus::Pending, past),
            tx("already", "alice", TransactionStatus::Released, past),
            tx("refunded", "alice", TransactionStatus::Refunded, past),
            tx("no-date", "alice", TransactionStatus::HeldInEscrow, None),
        ]);
        let gateway = FakeGateway::default();

        let summary = auto_release_escrow_payments(&ledger, &gateway, now).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.released, 2);
        assert_eq!(summary.failed, 0);

        let payouts = gateway.payouts.lock().unwrap();
        let ids: Vec<_> = payouts.iter().map(|p| p.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["due", "exactly-now"]);
        assert_eq!(payouts[0].amount, 9_000);
        assert_eq!(payouts[0].destination, "acct_alice");

        let txs = ledger.transactions.lock().unwrap();
        let status = |id: &str| txs.iter().find(|t| t.id == id).unwrap().status;
        assert_eq!(status("due"), TransactionStatus::Released);
        assert_eq!(status("not-yet"), TransactionStatus::HeldInEscrow);
        assert_eq!(status("pending"), TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn failures_are_recorded_and_do_not_stop_the_batch() {
        let now = Utc::now();
        let past = Some(now - ChronoDuration::hours(2));
        let ledger = ledger_with(vec![
            tx("bad", "bob", TransactionStatus::HeldInEscrow, past),
            tx("orphan", "carol", TransactionStatus::HeldInEscrow, past),
            tx("good", "alice", TransactionStatus::HeldInEscrow, past),
        ]);
        let gateway = FakeGateway {
            reject_destination: Some("acct_bob".into()),
            ..Default::default()
        };

        let summary = auto_release_escrow_payments(&ledger, &gateway, now).await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.released, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failures[0].transaction_id, "bad");

        let txs = ledger.transactions.lock().unwrap();
        let bad = txs.iter().find(|t| t.id == "bad").unwrap();
        assert_eq!(bad.status, TransactionStatus::HeldInEscrow);

        let failures = ledger.failures.lock().unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].1.contains("restricted"));
        assert!(failures[1].1.contains("payout account"));
    }

    #[tokio::test]
    async fn release_refuses_funds_not_in_escrow() {
        let ledger = ledger_with(vec![]);
        let gateway = FakeGateway::default();
        let pending = tx("p", "alice", TransactionStatus::Pending, None);

        let err = release_transaction(&ledger, &gateway, &pending, Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(gateway.payouts.lock().unwrap().is_empty());
        assert!(ledger.failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn released_funds_settle_their_milestone() {
        let now = Utc::now();
        let ledger = ledger_with(vec![tx("t1", "alice", TransactionStatus::HeldInEscrow, None)]);
        let gateway = FakeGateway::default();
        let held = ledger.transactions.lock().unwrap()[0].clone();

        release_transaction(&ledger, &gateway, &held, now).await.unwrap();
        assert_eq!(*ledger.settled.lock().unwrap(), vec!["m-t1".to_string()]);
    }

    #[tokio::test]
    async fn settle_errors_do_not_undo_a_release() {
        let now = Utc::now();
        let past = Some(now - ChronoDuration::days(1));
        let ledger = FakeLedger {
            settle_fails: true,
            ..ledger_with(vec![tx("t1", "alice", TransactionStatus::HeldInEscrow, past)])
        };
        let gateway = FakeGateway::default();

        let summary = auto_release_escrow_payments(&ledger, &gateway, now).await.unwrap();
        assert_eq!(summary.released, 1);
        assert_eq!(summary.failed, 0);
        assert!(ledger.failures.lock().unwrap().is_empty());

        let txs = ledger.transactions.lock().unwrap();
        assert_eq!(txs[0].status, TransactionStatus::Released);
        assert_eq!(txs[0].transfer_id.as_deref(), Some("tr_1"));
    }
}
