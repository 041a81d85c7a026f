// Checkout session initiation: validate stock, then open a hosted Stripe Checkout session

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::inventory::{InventoryError, InventoryGateway};
use crate::settings::CheckoutSettings;
use crate::stock::{self, Rejection};
use crate::stripe::errors::StripeApiError;
use crate::stripe::types::{to_minor_units, CheckoutLineItem, CreateCheckoutSessionRequest};
use crate::stripe::CheckoutProvider;

/// One client-supplied cart line. `id` is the inventory key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    #[serde(default, deserialize_with = "deserialize_quantity")]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub image: Option<String>,
}

impl CartItem {
    /// Requested quantity; an absent quantity means one unit.
    pub fn quantity(&self) -> u32 {
        self.quantity.unwrap_or(1)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityInput {
    Number(u32),
    Text(String),
}

/// Quantities arrive as numbers or numeric strings. A blank string counts as absent.
fn deserialize_quantity<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<QuantityInput>::deserialize(deserializer)? {
        None => Ok(None),
        Some(QuantityInput::Number(n)) => Ok(Some(n)),
        Some(QuantityInput::Text(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse()
                .map(Some)
                .map_err(|_| de::Error::custom(format!("invalid quantity {text:?}")))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub items: Vec<CartItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("cart is empty")]
    EmptyCart,
    #[error("invalid cart item {id}: {reason}")]
    InvalidItem { id: String, reason: String },
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    PaymentProvider(#[from] StripeApiError),
    #[error("payment provider returned session {0} without a redirect url")]
    MissingRedirect(String),
}

impl CheckoutError {
    /// Client input problems are 400, upstream failures 500.
    pub fn status_code(&self) -> u16 {
        match self {
            CheckoutError::EmptyCart
            | CheckoutError::InvalidItem { .. }
            | CheckoutError::Rejected(_) => 400,
            CheckoutError::Inventory(_)
            | CheckoutError::PaymentProvider(_)
            | CheckoutError::MissingRedirect(_) => 500,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    inventory: Arc<dyn InventoryGateway>,
    provider: Arc<dyn CheckoutProvider>,
    policy: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        inventory: Arc<dyn InventoryGateway>,
        provider: Arc<dyn CheckoutProvider>,
        policy: CheckoutSettings,
    ) -> Self {
        Self {
            inventory,
            provider,
            policy,
        }
    }

    /// Validate the cart against a fresh inventory snapshot, then create the session.
    #[instrument(skip(self, cart), fields(items = cart.len()))]
    pub async fn start_checkout(&self, cart: &[CartItem]) -> Result<SessionHandle, CheckoutError> {
        check_cart(cart)?;

        let snapshot = self.inventory.fetch_snapshot().await?;
        if let Err(rejection) = stock::validate(cart, &snapshot) {
            warn!(reason = %rejection, "Cart rejected");
            return Err(rejection.into());
        }

        self.create_session(cart).await
    }

    /// One provider line item per cart item, tagged with the inventory id.
    pub fn session_request(
        &self,
        cart: &[CartItem],
    ) -> Result<CreateCheckoutSessionRequest, CheckoutError> {
        let line_items = cart
            .iter()
            .map(|item| {
                let unit_amount =
                    to_minor_units(item.price).map_err(|e| CheckoutError::InvalidItem {
                        id: item.id.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(CheckoutLineItem {
                    currency: self.policy.currency.clone(),
                    name: item.name.clone(),
                    image: item.image.clone(),
                    product_id: item.id.clone(),
                    unit_amount,
                    quantity: item.quantity(),
                })
            })
            .collect::<Result<Vec<_>, CheckoutError>>()?;

        Ok(CreateCheckoutSessionRequest {
            line_items,
            success_url: self.policy.success_url.clone(),
            cancel_url: self.policy.cancel_url.clone(),
            allowed_countries: self.policy.allowed_countries.clone(),
            collect_phone: self.policy.collect_phone,
            metadata: HashMap::from([("source".to_string(), "cart".to_string())]),
        })
    }

    #[instrument(skip(self, cart), fields(provider = self.provider.name()))]
    pub async fn create_session(&self, cart: &[CartItem]) -> Result<SessionHandle, CheckoutError> {
        let request = self.session_request(cart)?;
        let session = self.provider.create_checkout_session(&request).await?;
        let redirect_url = session
            .url
            .ok_or_else(|| CheckoutError::MissingRedirect(session.id.clone()))?;

        info!(session_id = %session.id, "Checkout session created");
        Ok(SessionHandle {
            session_id: session.id,
            redirect_url,
        })
    }

    /// Read-only passthrough used for client-side status polling.
    pub async fn get_session(&self, session_id: &str) -> Result<serde_json::Value, CheckoutError> {
        Ok(self.provider.retrieve_checkout_session(session_id).await?)
    }
}

fn check_cart(cart: &[CartItem]) -> Result<(), CheckoutError> {
    if cart.is_empty() {
        return Err(CheckoutError::EmptyCart);
    }
    for item in cart {
        if item.quantity == Some(0) {
            return Err(CheckoutError::InvalidItem {
                id: item.id.clone(),
                reason: "quantity must be at least 1".to_string(),
            });
        }
        if item.price.is_sign_negative() && !item.price.is_zero() {
            return Err(CheckoutError::InvalidItem {
                id: item.id.clone(),
                reason: "price must not be negative".to_string(),
            });
        }
    }
    Ok(())
}
