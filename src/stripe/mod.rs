// Stripe provider module

pub mod errors;
pub mod rest;
pub mod types;
pub mod webhook;

use async_trait::async_trait;
use reqwest::Client;

use self::errors::StripeApiError;
use self::types::{CheckoutSession, CreateCheckoutSessionRequest, LineItem};
use crate::settings::StripeSettings;

/// The payment-provider operations the checkout flow consumes.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeApiError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<serde_json::Value, StripeApiError>;

    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItem>, StripeApiError>;
}

#[derive(Clone)]
pub struct StripeProvider {
    rest: self::rest::StripeRestClient,
}

impl StripeProvider {
    // Build reqwest client with rustls and timeout from cfg.
    pub fn new(cfg: &StripeSettings) -> Result<Self, StripeApiError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| StripeApiError::Http(e.to_string()))?;

        let rest = self::rest::StripeRestClient::new(http, cfg.secret_key.clone()).with_version(
            if cfg.stripe_version.is_empty() {
                None
            } else {
                Some(cfg.stripe_version.clone())
            },
        );

        Ok(Self { rest })
    }

    pub fn rest(&self) -> &self::rest::StripeRestClient {
        &self.rest
    }
}

#[async_trait]
impl CheckoutProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeApiError> {
        self.rest().create_checkout_session(request).await
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<serde_json::Value, StripeApiError> {
        self.rest().retrieve_checkout_session(session_id).await
    }

    async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItem>, StripeApiError> {
        self.rest().list_line_items(session_id).await
    }
}
