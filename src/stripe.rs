//! Minimal Stripe REST client: payment intents, Connect transfers, refunds.

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub client_secret: Option<String>,
}

impl PaymentIntent {
    pub fn succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

#[derive(Debug, Deserialize)]
pub struct Transfer {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct Refund {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

/// Funds moving from the platform balance to a freelancer's connected account.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub transaction_id: String,
    pub destination: String,
    pub amount: i64,
    pub currency: String,
}

/// Where released escrow money goes. Stripe in production, a fake in tests.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    /// Returns the provider's transfer id.
    async fn transfer(&self, payout: &PayoutRequest) -> AppResult<String>;
}

pub struct StripeClient {
    http: Client,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(api_base: &str, secret_key: &str) -> Self {
        StripeClient {
            http: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: &[(&str, String)]) -> AppResult<T> {
        let url = format!("{}{}", self.api_base, path);
        debug!("Stripe POST {}", path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::Payment(e.to_string()))?;
        Self::parse(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        let url = format!("{}{}", self.api_base, path);
        debug!("Stripe GET {}", path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| AppError::Payment(e.to_string()))?;
        Self::parse(resp).await
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> AppResult<T> {
        let status = resp.status();
        let body = resp.text().await.map_err(|e| AppError::Payment(e.to_string()))?;
        if !status.is_success() {
            let message = serde_json::from_str::<StripeErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(AppError::Payment(message));
        }
        serde_json::from_str(&body).map_err(|e| AppError::Payment(format!("unexpected response: {e}")))
    }

    pub async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        transaction_id: &str,
        contract_id: &str,
    ) -> AppResult<PaymentIntent> {
        self.post_form(
            "/v1/payment_intents",
            &[
                ("amount", amount.to_string()),
                ("currency", currency.to_string()),
                ("transfer_group", contract_id.to_string()),
                ("metadata[transaction_id]", transaction_id.to_string()),
                ("metadata[contract_id]", contract_id.to_string()),
            ],
        )
        .await
    }

    pub async fn retrieve_payment_intent(&self, id: &str) -> AppResult<PaymentIntent> {
        self.get(&format!("/v1/payment_intents/{id}")).await
    }

    pub async fn refund(&self, payment_intent_id: &str) -> AppResult<Refund> {
        self.post_form("/v1/refunds", &[("payment_intent", payment_intent_id.to_string())])
            .await
    }
}

#[async_trait]
impl PayoutGateway for StripeClient {
    async fn transfer(&self, payout: &PayoutRequest) -> AppResult<String> {
        let transfer: Transfer = self
            .post_form(
                "/v1/transfers",
                &[
                    ("amount", payout.amount.to_string()),
                    ("currency", payout.currency.clone()),
                    ("destination", payout.destination.clone()),
                    ("metadata[transaction_id]", payout.transaction_id.clone()),
                ],
            )
            .await?;
        Ok(transfer.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_message_is_extracted() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"No such destination"}}"#;
        let parsed: StripeErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.error.message.as_deref(), Some("No such destination"));
    }

    #[test]
    fn payment_intent_status() {
        let pi: PaymentIntent =
            serde_json::from_str(r#"{"id":"pi_1","status":"succeeded","client_secret":null}"#).unwrap();
        assert!(pi.succeeded());
        let pi: PaymentIntent =
            serde_json::from_str(r#"{"id":"pi_2","status":"requires_payment_method"}"#).unwrap();
        assert!(!pi.succeeded());
        assert!(pi.client_secret.is_none());
    }

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let client = StripeClient::new("https://api.stripe.com/", "sk_test");
        assert_eq!(client.api_base, "https://api.stripe.com");
    }
}
