use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::doc;
use serde::Deserialize;
use serde_json::json;

use crate::admin::load_settings;
use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::contracts::find_contract;
use crate::error::{AppError, AppResult};
use crate::escrow::{auto_release_escrow_payments, release_transaction, MongoEscrowLedger};
use crate::models::{
    contract::{ContractStatus, MilestoneStatus},
    new_id,
    notification::NotificationKind,
    transaction::{split_commission, Transaction, TransactionStatus},
    user::Role,
    PageQuery,
};
use crate::notifications::{notify_quietly, NewNotification};
use crate::payment_log::PaymentDebugLogger;

#[derive(Debug, Deserialize)]
pub struct FundMilestoneRequest {
    pub contract_id: String,
    pub milestone_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
}

async fn find_transaction(data: &AppState, id: &str) -> AppResult<Transaction> {
    data.mongodb
        .transactions()
        .find_one(doc! { "_id": id })
        .await?
        .ok_or_else(|| AppError::not_found("Transaction"))
}

pub(crate) fn money(cents: i64, currency: &str) -> String {
    format!("{:.2} {}", cents as f64 / 100.0, currency.to_uppercase())
}

/// POST /api/v1/payments/fund
/// Starts a Stripe payment for one milestone; funds land in escrow once confirmed.
pub async fn fund_milestone(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<FundMilestoneRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Client])?;
    let contract = find_contract(&data, &info.contract_id).await?;
    if contract.client_id != auth.id {
        return Err(AppError::forbidden("Only the contract's client can fund it"));
    }
    if contract.status != ContractStatus::Active {
        return Err(AppError::bad_request("Only active contracts can be funded"));
    }
    let milestone = contract.milestone(&info.milestone_id)?;
    if milestone.status == MilestoneStatus::Paid {
        return Err(AppError::bad_request("Milestone is already paid"));
    }

    let existing: Vec<Transaction> = data
        .mongodb
        .transactions()
        .find(doc! { "contract_id": &contract.id, "milestone_id": &milestone.id })
        .await?
        .try_collect()
        .await?;
    if existing.iter().any(|t| t.status.occupies_milestone()) {
        return Err(AppError::conflict("Milestone already has a payment in progress"));
    }

    let settings = load_settings(&data.mongodb).await?;
    let (platform_commission, freelancer_amount) =
        split_commission(milestone.amount, settings.commission_rate);
    let transaction_id = new_id();
    let log = PaymentDebugLogger::start("fund", &transaction_id);
    log.step(format!(
        "milestone={} amount={} commission={} rate={}%",
        milestone.id, milestone.amount, platform_commission, settings.commission_rate
    ));

    let currency = data.config.default_currency.clone();
    let intent = data
        .stripe
        .create_payment_intent(milestone.amount, &currency, &transaction_id, &contract.id)
        .await
        .inspect_err(|e| log.failed(e))?;
    log.step(format!("payment intent {} created ({})", intent.id, intent.status));

    let now = Utc::now();
    let transaction = Transaction {
        id: transaction_id,
        contract_id: contract.id.clone(),
        milestone_id: milestone.id.clone(),
        client_id: contract.client_id.clone(),
        freelancer_id: contract.freelancer_id.clone(),
        amount: milestone.amount,
        platform_commission,
        freelancer_amount,
        currency,
        status: TransactionStatus::Pending,
        payment_intent_id: Some(intent.id.clone()),
        transfer_id: None,
        refund_id: None,
        escrow_release_date: None,
        released_at: None,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    };
    data.mongodb.transactions().insert_one(&transaction).await?;
    log.finished("pending");

    Ok(HttpResponse::Created().json(json!({
        "transaction": transaction,
        "client_secret": intent.client_secret,
    })))
}

/// POST /api/v1/payments/{id}/confirm
pub async fn confirm_payment(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let tx = find_transaction(&data, &id).await?;
    if tx.client_id != auth.id {
        return Err(AppError::forbidden("Only the paying client can confirm this payment"));
    }
    if !matches!(tx.status, TransactionStatus::Pending | TransactionStatus::Processing) {
        return Err(AppError::bad_request(format!(
            "Payment is already {}",
            tx.status.as_str()
        )));
    }
    let intent_id = tx
        .payment_intent_id
        .as_deref()
        .ok_or_else(|| AppError::Internal(format!("transaction {} has no payment intent", tx.id)))?;

    let log = PaymentDebugLogger::start("confirm", &tx.id);
    let intent = data
        .stripe
        .retrieve_payment_intent(intent_id)
        .await
        .inspect_err(|e| log.failed(e))?;
    log.step(format!("payment intent {} is {}", intent.id, intent.status));

    let now = Utc::now();
    let at = bson::DateTime::from_chrono(now);
    let transactions = data.mongodb.transactions();
    if intent.succeeded() {
        let settings = load_settings(&data.mongodb).await?;
        let release_date = now + Duration::days(i64::from(settings.escrow_hold_days));
        let res = transactions
            .update_one(
                doc! { "_id": &tx.id, "status": tx.status.as_str() },
                doc! { "$set": {
                    "status": TransactionStatus::HeldInEscrow.as_str(),
                    "escrow_release_date": bson::DateTime::from_chrono(release_date),
                    "updated_at": at,
                } },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(AppError::conflict("Payment was updated concurrently"));
        }
        log.finished(format!("held in escrow until {release_date}"));

        notify_quietly(
            &data,
            NewNotification {
                user_id: &tx.freelancer_id,
                kind: NotificationKind::Payment,
                title: "Milestone funded",
                message: format!("{} is now held in escrow for your milestone", money(tx.amount, &tx.currency)),
                link: Some(format!("/contracts/{}", tx.contract_id)),
            },
        )
        .await;
    } else if intent.status == "processing" {
        transactions
            .update_one(
                doc! { "_id": &tx.id },
                doc! { "$set": { "status": TransactionStatus::Processing.as_str(), "updated_at": at } },
            )
            .await?;
        log.finished("processing");
    } else if intent.status == "canceled" {
        transactions
            .update_one(
                doc! { "_id": &tx.id },
                doc! { "$set": { "status": TransactionStatus::Cancelled.as_str(), "updated_at": at } },
            )
            .await?;
        log.finished("cancelled");
    } else {
        return Err(AppError::bad_request(format!(
            "Payment has not completed (status: {})",
            intent.status
        )));
    }

    Ok(HttpResponse::Ok().json(find_transaction(&data, &tx.id).await?))
}

/// POST /api/v1/payments/{id}/release
/// Client releases an approved milestone's escrow ahead of the hold date.
pub async fn release_payment(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let tx = find_transaction(&data, &id).await?;
    if !auth.is_admin() {
        if tx.client_id != auth.id {
            return Err(AppError::forbidden("Only the paying client can release this payment"));
        }
        let contract = find_contract(&data, &tx.contract_id).await?;
        if contract.milestone(&tx.milestone_id)?.status != MilestoneStatus::Approved {
            return Err(AppError::bad_request("Approve the milestone before releasing payment"));
        }
    }

    let ledger = MongoEscrowLedger::from_state(&data);
    let transfer_id = release_transaction(&ledger, data.stripe.as_ref(), &tx, Utc::now()).await?;
    info!("Transaction {} released by {}", tx.id, auth.id);
    Ok(HttpResponse::Ok().json(json!({ "transaction_id": tx.id, "transfer_id": transfer_id })))
}

/// GET /api/v1/payments/mine
pub async fn my_payments(
    data: web::Data<AppState>,
    auth: AuthUser,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let txs: Vec<Transaction> = data
        .mongodb
        .transactions()
        .find(doc! { "$or": [ { "client_id": &auth.id }, { "freelancer_id": &auth.id } ] })
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(txs))
}

/// GET /api/v1/admin/payments
pub async fn list_transactions(
    data: web::Data<AppState>,
    auth: AuthUser,
    filter: web::Query<TransactionFilter>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let mut query = doc! {};
    if let Some(status) = filter.status {
        query.insert("status", status.as_str());
    }
    let txs: Vec<Transaction> = data
        .mongodb
        .transactions()
        .find(query)
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(txs))
}

/// POST /api/v1/admin/payments/auto-release
pub async fn trigger_auto_release(
    data: web::Data<AppState>,
    auth: AuthUser,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    info!("Manual escrow auto-release triggered by {}", auth.id);
    let ledger = MongoEscrowLedger::from_state(&data);
    let summary = auto_release_escrow_payments(&ledger, data.stripe.as_ref(), Utc::now()).await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// POST /api/v1/admin/payments/{id}/refund
pub async fn refund_payment(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Admin])?;
    let tx = find_transaction(&data, &id).await?;
    if tx.status != TransactionStatus::HeldInEscrow {
        return Err(AppError::bad_request("Only funds held in escrow can be refunded"));
    }
    let intent_id = tx
        .payment_intent_id
        .as_deref()
        .ok_or_else(|| AppError::Internal(format!("transaction {} has no payment intent", tx.id)))?;

    let log = PaymentDebugLogger::start("refund", &tx.id);
    let refund = data.stripe.refund(intent_id).await.inspect_err(|e| log.failed(e))?;
    log.step(format!("refund {} is {}", refund.id, refund.status));

    let at = bson::DateTime::from_chrono(Utc::now());
    data.mongodb
        .transactions()
        .update_one(
            doc! { "_id": &tx.id, "status": TransactionStatus::HeldInEscrow.as_str() },
            doc! { "$set": {
                "status": TransactionStatus::Refunded.as_str(),
                "refund_id": &refund.id,
                "updated_at": at,
            } },
        )
        .await?;
    log.finished("refunded");

    notify_quietly(
        &data,
        NewNotification {
            user_id: &tx.client_id,
            kind: NotificationKind::Payment,
            title: "Payment refunded",
            message: format!("{} was refunded to you", money(tx.amount, &tx.currency)),
            link: Some(format!("/contracts/{}", tx.contract_id)),
        },
    )
    .await;
    Ok(HttpResponse::Ok().json(find_transaction(&data, &tx.id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_formats_minor_units() {
        assert_eq!(money(123_456, "usd"), "1234.56 USD");
        assert_eq!(money(5, "eur"), "0.05 EUR");
    }
}
