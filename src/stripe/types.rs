// Minimal Stripe DTOs and helper types
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Event kind that drives reconciliation.
pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StripePreconditionError {
    #[error("amount must be non-negative")]
    NegativeAmount,
    #[error("amount {0} does not fit in minor units")]
    Overflow(Decimal),
}

/// Converts a decimal major-unit price into integer minor units (cents),
/// rounding half away from zero on `price * 100`.
pub fn to_minor_units(price: Decimal) -> Result<i64, StripePreconditionError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(StripePreconditionError::NegativeAmount);
    }
    let scaled = price
        .checked_mul(Decimal::ONE_HUNDRED)
        .ok_or(StripePreconditionError::Overflow(price))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled
        .to_i64()
        .ok_or(StripePreconditionError::Overflow(price))
}

// Request shape for POST /v1/checkout/sessions, flattened to form fields by the REST client.

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCheckoutSessionRequest {
    pub line_items: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
    pub allowed_countries: Vec<String>,
    pub collect_phone: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutLineItem {
    pub currency: String,
    pub name: String,
    pub image: Option<String>,
    /// Inventory id, carried as product metadata so it survives to reconciliation.
    pub product_id: String,
    pub unit_amount: i64,
    pub quantity: u32,
}

impl CreateCheckoutSessionRequest {
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("payment_method_types[0]".into(), "card".into()),
        ];
        for (i, item) in self.line_items.iter().enumerate() {
            let prefix = format!("line_items[{i}]");
            form.push((format!("{prefix}[price_data][currency]"), item.currency.clone()));
            form.push((format!("{prefix}[price_data][product_data][name]"), item.name.clone()));
            if let Some(image) = item.image.as_deref().filter(|s| !s.is_empty()) {
                form.push((
                    format!("{prefix}[price_data][product_data][images][0]"),
                    image.to_string(),
                ));
            }
            form.push((
                format!("{prefix}[price_data][product_data][metadata][id]"),
                item.product_id.clone(),
            ));
            form.push((
                format!("{prefix}[price_data][unit_amount]"),
                item.unit_amount.to_string(),
            ));
            form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
        }
        form.push(("success_url".into(), self.success_url.clone()));
        form.push(("cancel_url".into(), self.cancel_url.clone()));
        for (i, country) in self.allowed_countries.iter().enumerate() {
            form.push((
                format!("shipping_address_collection[allowed_countries][{i}]"),
                country.clone(),
            ));
        }
        form.push((
            "phone_number_collection[enabled]".into(),
            self.collect_phone.to_string(),
        ));
        let mut meta: Vec<_> = self.metadata.iter().collect();
        meta.sort();
        for (k, v) in meta {
            form.push((format!("metadata[{k}]"), v.clone()));
        }
        form
    }
}

// Checkout Session minimal shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Stripe list envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<u64>,
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub product: Option<Expandable<Product>>,
}

/// A field that is either an object id or, when expanded, the object itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Object(Box<T>),
    Id(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl LineItem {
    /// The inventory id stamped on the product at session creation, if the product was expanded.
    pub fn product_metadata_id(&self) -> Option<&str> {
        match self.price.as_ref()?.product.as_ref()? {
            Expandable::Object(product) => product
                .metadata
                .get("id")
                .map(String::as_str)
                .filter(|id| !id.is_empty()),
            Expandable::Id(_) => None,
        }
    }
}

// Webhook event types

/// Stripe webhook event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub livemode: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}
