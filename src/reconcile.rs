// Payment event reconciliation: completed Checkout Sessions become inventory decrements

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::database::{DeadLetterEntry, FulfillmentStore, SessionState};
use crate::inventory::{Decrement, InventoryError, InventoryGateway};
use crate::settings::{ReconcileSettings, StripeSettings};
use crate::stripe::errors::WebhookError;
use crate::stripe::types::{LineItem, CHECKOUT_SESSION_COMPLETED};
use crate::stripe::{webhook, CheckoutProvider};

/// A purchased line mapped back to its inventory row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub id: String,
    pub quantity: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub session_id: String,
    pub decremented: Vec<Decrement>,
    /// Ids with no matching inventory row.
    pub skipped: Vec<String>,
    /// Ids whose write failed upstream.
    pub failed: Vec<String>,
    pub dead_letters: Vec<DeadLetterEntry>,
}

/// What happened to one verified delivery. Every variant is acknowledged with 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Ignored { event_type: String },
    Duplicate { session_id: String },
    Reconciled(ReconcileReport),
    Abandoned { session_id: String, reason: String },
}

/// Maps a line item to its inventory id. The product metadata id stamped at
/// session creation is authoritative; the description is only consulted when
/// `description_fallback` is on.
pub fn resolve_line_item(item: &LineItem, description_fallback: bool) -> Result<ResolvedItem, String> {
    let quantity = item.quantity.unwrap_or(1);
    if let Some(id) = item.product_metadata_id() {
        return Ok(ResolvedItem {
            id: id.to_string(),
            quantity,
        });
    }
    if !description_fallback {
        return Err("missing product metadata id".to_string());
    }
    match item.description.as_deref().map(str::trim) {
        Some(description) if !description.is_empty() => Ok(ResolvedItem {
            id: description.to_string(),
            quantity,
        }),
        _ => Err("unresolved".to_string()),
    }
}

pub struct Reconciler {
    provider: Arc<dyn CheckoutProvider>,
    inventory: Arc<dyn InventoryGateway>,
    store: FulfillmentStore,
    webhook_secret: String,
    tolerance_seconds: i64,
    description_fallback: bool,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn CheckoutProvider>,
        inventory: Arc<dyn InventoryGateway>,
        store: FulfillmentStore,
        stripe: &StripeSettings,
        settings: &ReconcileSettings,
    ) -> Self {
        Self {
            provider,
            inventory,
            store,
            webhook_secret: stripe.webhook_secret.clone(),
            tolerance_seconds: stripe.webhook_tolerance_seconds,
            description_fallback: settings.description_fallback,
        }
    }

    /// Handles one webhook delivery. Only an authenticity failure is an error;
    /// everything past verification is acknowledged so the provider stops redelivering.
    #[instrument(skip(self, payload, headers), fields(bytes = payload.len()))]
    pub async fn handle_delivery(
        &self,
        payload: &[u8],
        headers: &http::HeaderMap,
    ) -> Result<WebhookOutcome, WebhookError> {
        let evt = webhook::construct_event(
            payload,
            headers,
            &self.webhook_secret,
            self.tolerance_seconds,
        )?;

        debug!(event_id = %evt.id, event_type = %evt.event_type, "Webhook signature verified");

        if evt.event_type != CHECKOUT_SESSION_COMPLETED {
            info!(event_type = %evt.event_type, "Ignoring unsupported event type");
            return Ok(WebhookOutcome::Ignored {
                event_type: evt.event_type,
            });
        }

        let Some(session_id) = evt.data.object.get("id").and_then(|v| v.as_str()) else {
            error!(event_id = %evt.id, "Completed event carries no session id");
            return Ok(WebhookOutcome::Abandoned {
                session_id: String::new(),
                reason: "event object has no id".to_string(),
            });
        };

        Ok(self.reconcile_session(session_id, &evt.id).await)
    }

    /// Decrements inventory for every purchased line of a completed session, at most once per session.
    #[instrument(skip(self))]
    pub async fn reconcile_session(&self, session_id: &str, event_id: &str) -> WebhookOutcome {
        match self.store.try_claim(session_id, event_id) {
            Ok(true) => {}
            Ok(false) => {
                match self.store.session(session_id) {
                    Ok(Some(record)) if record.state == SessionState::InProgress => warn!(
                        session_id = %session_id,
                        claimed_by = %record.event_id,
                        "Session claim was never completed; needs manual review"
                    ),
                    _ => info!(session_id = %session_id, "Session already reconciled; skipping redelivery"),
                }
                return WebhookOutcome::Duplicate {
                    session_id: session_id.to_string(),
                };
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to claim session");
                return WebhookOutcome::Abandoned {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                };
            }
        }

        let line_items = match self.provider.list_line_items(session_id).await {
            Ok(items) => items,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to list line items");
                if let Err(e) = self.store.release(session_id) {
                    error!(session_id = %session_id, error = %e, "Failed to release session claim");
                }
                return WebhookOutcome::Abandoned {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        let mut report = ReconcileReport {
            session_id: session_id.to_string(),
            ..Default::default()
        };

        let mut resolved = Vec::with_capacity(line_items.len());
        for item in &line_items {
            match resolve_line_item(item, self.description_fallback) {
                Ok(r) => {
                    debug!(line_item = %item.id, description = ?item.description, id = %r.id, "Line item resolved");
                    resolved.push(r);
                }
                Err(reason) => {
                    warn!(
                        session_id = %session_id,
                        line_item = %item.id,
                        description = ?item.description,
                        reason = %reason,
                        "Line item routed to dead letters"
                    );
                    let entry = DeadLetterEntry {
                        session_id: session_id.to_string(),
                        line_item_id: item.id.clone(),
                        description: item.description.clone(),
                        quantity: item.quantity.unwrap_or(1),
                        reason,
                        recorded_at: Utc::now().timestamp(),
                    };
                    if let Err(e) = self.store.record_dead_letter(&entry) {
                        error!(session_id = %session_id, error = %e, "Failed to record dead letter");
                    }
                    report.dead_letters.push(entry);
                }
            }
        }

        info!(session_id = %session_id, items = resolved.len(), "Updating stock");

        for item in resolved {
            match self.inventory.decrement(&item.id, item.quantity).await {
                Ok(d) => report.decremented.push(d),
                Err(InventoryError::RowNotFound(id)) => {
                    warn!(session_id = %session_id, id = %id, "Skipping item with no inventory row");
                    report.skipped.push(id);
                }
                Err(e) => {
                    error!(session_id = %session_id, id = %item.id, error = %e, "Stock update failed");
                    report.failed.push(item.id);
                }
            }
        }

        let decremented = report.decremented.iter().map(|d| d.id.clone()).collect();
        let mut not_applied = report.skipped.clone();
        not_applied.extend(report.failed.iter().cloned());
        if let Err(e) = self
            .store
            .mark_reconciled(session_id, decremented, not_applied)
        {
            error!(session_id = %session_id, error = %e, "Failed to mark session reconciled");
        }

        WebhookOutcome::Reconciled(report)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::checkout::fake::FakeProvider;
    use crate::inventory::memory::MemoryInventory;
    use crate::settings::StripeSettings;

    fn reconciler(
        provider: Arc<FakeProvider>,
        inventory: Arc<MemoryInventory>,
        description_fallback: bool,
    ) -> (Reconciler, FulfillmentStore) {
        let store = FulfillmentStore::open_in_memory().unwrap();
        let stripe = StripeSettings {
            webhook_secret: SECRET.to_string(),
            ..Default::default()
        };
        let settings = ReconcileSettings { description_fallback };
        (
            Reconciler::new(provider, inventory, store.clone(), &stripe, &settings),
            store,
        )
    }

    #[tokio::test]
    async fn test_completed_session_decrements_stock() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", Some("A1"), "Mug", 2)],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, store) = reconciler(provider, inventory.clone(), false);

        let payload = completed_event("cs_1");
        let outcome = rec.handle_delivery(&payload, &signed_headers(&payload)).await.unwrap();

        let WebhookOutcome::Reconciled(report) = outcome else {
            panic!("expected reconciliation");
        };
        assert_eq!(
            report.decremented,
            vec![Decrement { id: "A1".into(), old_quantity: 5, new_quantity: 3 }]
        );
        assert_eq!(inventory.available("A1").await, Some(3));
        assert!(store.session("cs_1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_signature_writes_nothing() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", Some("A1"), "Mug", 2)],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, _store) = reconciler(provider.clone(), inventory.clone(), false);

        let payload = completed_event("cs_1");
        let mut headers = signed_headers(b"some other body");
        let result = rec.handle_delivery(&payload, &headers).await;
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));

        headers.clear();
        let result = rec.handle_delivery(&payload, &headers).await;
        assert!(matches!(result, Err(WebhookError::MissingSignature)));

        assert_eq!(inventory.writes(), 0);
        assert!(provider.listed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_event_kinds_are_acknowledged_without_writes() {
        let provider = Arc::new(FakeProvider::default());
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, _store) = reconciler(provider, inventory.clone(), false);

        let payload = serde_json::json!({
            "id": "evt_2",
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_1"}}
        })
        .to_string()
        .into_bytes();
        let outcome = rec.handle_delivery(&payload, &signed_headers(&payload)).await.unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Ignored { event_type: "payment_intent.succeeded".into() }
        );
        assert_eq!(inventory.writes(), 0);
    }

    #[tokio::test]
    async fn test_missing_row_is_skipped_and_siblings_still_apply() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![
                line_item("li_1", Some("ZZZ"), "Ghost", 1),
                line_item("li_2", Some("A1"), "Mug", 1),
            ],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, store) = reconciler(provider, inventory.clone(), false);

        let WebhookOutcome::Reconciled(report) = rec.reconcile_session("cs_1", "evt_1").await else {
            panic!("expected reconciliation");
        };
        assert_eq!(report.skipped, vec!["ZZZ"]);
        assert_eq!(report.decremented.len(), 1);
        assert_eq!(inventory.available("A1").await, Some(4));
        assert_eq!(store.session("cs_1").unwrap().unwrap().skipped, vec!["ZZZ"]);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", Some("A1"), "Mug", 2)],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, _store) = reconciler(provider.clone(), inventory.clone(), false);

        let payload = completed_event("cs_1");
        rec.handle_delivery(&payload, &signed_headers(&payload)).await.unwrap();
        let second = rec.handle_delivery(&payload, &signed_headers(&payload)).await.unwrap();

        assert_eq!(second, WebhookOutcome::Duplicate { session_id: "cs_1".into() });
        assert_eq!(inventory.available("A1").await, Some(3));
        assert_eq!(provider.listed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_claim_is_not_reprocessed() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", Some("A1"), "Mug", 2)],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, store) = reconciler(provider.clone(), inventory.clone(), false);
        assert!(store.try_claim("cs_1", "evt_crashed").unwrap());

        let outcome = rec.reconcile_session("cs_1", "evt_retry").await;

        assert_eq!(outcome, WebhookOutcome::Duplicate { session_id: "cs_1".into() });
        let record = store.session("cs_1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::InProgress);
        assert_eq!(record.event_id, "evt_crashed");
        assert!(provider.listed.lock().unwrap().is_empty());
        assert_eq!(inventory.writes(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_is_acknowledged_and_releases_claim() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", Some("A1"), "Mug", 2)],
        ));
        provider.set_failing(true);
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, store) = reconciler(provider.clone(), inventory.clone(), false);

        let payload = completed_event("cs_1");
        let outcome = rec.handle_delivery(&payload, &signed_headers(&payload)).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Abandoned { .. }));
        assert_eq!(inventory.writes(), 0);
        assert!(store.session("cs_1").unwrap().is_none());

        provider.set_failing(false);
        let outcome = rec.handle_delivery(&payload, &signed_headers(&payload)).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Reconciled(_)));
        assert_eq!(inventory.available("A1").await, Some(3));
    }

    #[tokio::test]
    async fn test_missing_metadata_goes_to_dead_letters() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", None, "A1", 2)],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, store) = reconciler(provider, inventory.clone(), false);

        let WebhookOutcome::Reconciled(report) = rec.reconcile_session("cs_1", "evt_1").await else {
            panic!("expected reconciliation");
        };
        assert!(report.decremented.is_empty());
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(inventory.writes(), 0);

        let stored = store.dead_letters().unwrap();
        assert_eq!(stored[0].line_item_id, "li_1");
        assert_eq!(stored[0].quantity, 2);
        assert_eq!(stored[0].reason, "missing product metadata id");
    }

    #[tokio::test]
    async fn test_description_fallback_when_enabled() {
        let provider = Arc::new(FakeProvider::with_line_items(
            "cs_1",
            vec![line_item("li_1", None, "A1", 2), line_item("li_2", None, "  ", 1)],
        ));
        let inventory = Arc::new(MemoryInventory::with_rows(&[("A1", "Mug", 5)]));
        let (rec, _store) = reconciler(provider, inventory.clone(), true);

        let WebhookOutcome::Reconciled(report) = rec.reconcile_session("cs_1", "evt_1").await else {
            panic!("expected reconciliation");
        };
        assert_eq!(inventory.available("A1").await, Some(3));
        assert_eq!(report.dead_letters.len(), 1);
        assert_eq!(report.dead_letters[0].reason, "unresolved");
    }

    #[test]
    fn test_resolve_prefers_metadata_over_description() {
        let item = line_item("li_1", Some("A1"), "Blue mug", 3);
        assert_eq!(
            resolve_line_item(&item, true),
            Ok(ResolvedItem { id: "A1".into(), quantity: 3 })
        );
    }
}
