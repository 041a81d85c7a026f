// Stripe REST client
// Checkout Session endpoints only. No retries: every failure is returned to the caller as-is.

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{info, instrument};

use crate::stripe::errors::{StripeApiError, StripeErrorEnvelope};
use crate::stripe::types::{CheckoutSession, CreateCheckoutSessionRequest, LineItem, List};

const STRIPE_API_BASE: &str = "https://api.stripe.com";
const LINE_ITEMS_PAGE_SIZE: &str = "100";

#[derive(Clone)]
pub struct StripeRestClient {
    pub(crate) http: Client,
    pub(crate) api_key: String,
    pub(crate) stripe_version: Option<String>,
    pub(crate) base_url: String,
}

impl StripeRestClient {
    pub fn new(http: Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
            stripe_version: None,
            base_url: STRIPE_API_BASE.to_string(),
        }
    }

    pub fn with_version(mut self, ver: impl Into<Option<String>>) -> Self {
        self.stripe_version = ver.into();
        self
    }

    fn apply_common_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req.bearer_auth(&self.api_key);
        if let Some(v) = &self.stripe_version {
            if !v.is_empty() {
                req = req.header("Stripe-Version", v);
            }
        }
        req
    }

    /// `/v1/checkout/sessions/{id}[/suffix..]`. The id is checked and pushed as a
    /// single encoded segment, so it can never leave the sessions collection.
    fn session_url(&self, session_id: &str, suffix: &[&str]) -> Result<Url, StripeApiError> {
        if !is_valid_session_id(session_id) {
            return Err(StripeApiError::InvalidId(session_id.to_string()));
        }
        let mut url = Url::parse(&self.base_url).map_err(|e| StripeApiError::Http(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StripeApiError::Http(format!("cannot-be-a-base url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["v1", "checkout", "sessions", session_id])
            .extend(suffix);
        Ok(url)
    }

    fn map_error(status: StatusCode, body: &str) -> StripeApiError {
        if let Ok(env) = serde_json::from_str::<StripeErrorEnvelope>(body) {
            env.to_api_error_with_status(Some(status.as_u16()))
        } else {
            StripeApiError::Http(format!("status={} body={}", status.as_u16(), body))
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, StripeApiError> {
        let resp = self
            .apply_common_headers(req)
            .send()
            .await
            .map_err(|e| StripeApiError::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StripeApiError::Decode(e.to_string()))?;
        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| StripeApiError::Decode(e.to_string()))
        } else {
            Err(Self::map_error(status, &text))
        }
    }

    // POST /v1/checkout/sessions
    // application/x-www-form-urlencoded
    #[instrument(skip(self, request), fields(method="POST", path="/v1/checkout/sessions", items=request.line_items.len()))]
    pub async fn create_checkout_session(
        &self,
        request: &CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeApiError> {
        let form = request.to_form();

        info!(
            target: "stripe",
            method = "POST",
            path = "/v1/checkout/sessions",
            line_items = request.line_items.len(),
            "stripe request"
        );

        let url = format!("{}/v1/checkout/sessions", self.base_url);
        self.send(self.http.post(url).form(&form)).await
    }

    // GET /v1/checkout/sessions/{id}
    // Returned untyped: callers pass it through to the client.
    #[instrument(skip(self), fields(method="GET", path="/v1/checkout/sessions/{id}", session_id=%session_id))]
    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<serde_json::Value, StripeApiError> {
        info!(
            target: "stripe",
            method = "GET",
            path = "/v1/checkout/sessions/{id}",
            session_id = %session_id,
            "stripe request"
        );

        let url = self.session_url(session_id, &[])?;
        let req = self
            .http
            .get(url)
            .query(&[("expand[]", "line_items"), ("expand[]", "customer_details")]);
        self.send(req).await
    }

    // GET /v1/checkout/sessions/{id}/line_items
    // Follows has_more/starting_after until the list is exhausted.
    #[instrument(skip(self), fields(method="GET", path="/v1/checkout/sessions/{id}/line_items", session_id=%session_id))]
    pub async fn list_line_items(&self, session_id: &str) -> Result<Vec<LineItem>, StripeApiError> {
        let url = self.session_url(session_id, &["line_items"])?;
        let mut items: Vec<LineItem> = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            info!(
                target: "stripe",
                method = "GET",
                path = "/v1/checkout/sessions/{id}/line_items",
                session_id = %session_id,
                starting_after = starting_after.as_deref().unwrap_or(""),
                "stripe request"
            );

            let mut query: Vec<(&str, String)> = vec![
                ("expand[]", "data.price.product".to_string()),
                ("limit", LINE_ITEMS_PAGE_SIZE.to_string()),
            ];
            if let Some(cursor) = &starting_after {
                query.push(("starting_after", cursor.clone()));
            }

            let page: List<LineItem> = self.send(self.http.get(url.clone()).query(&query)).await?;
            let has_more = page.has_more;
            starting_after = page.data.last().map(|li| li.id.clone());
            items.extend(page.data);

            if !has_more || starting_after.is_none() {
                break;
            }
        }

        Ok(items)
    }
}

/// Stripe object ids are `prefix_` plus alphanumerics.
fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
