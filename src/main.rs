mod checkout;
mod database;
mod inventory;
mod reconcile;
mod server;
mod settings;
mod sheets;
mod stock;
mod stripe;

use crate::checkout::CheckoutService;
use crate::database::FulfillmentStore;
use crate::inventory::SheetInventory;
use crate::reconcile::Reconciler;
use crate::server::AppState;
use crate::sheets::SheetsClient;
use crate::stripe::StripeProvider;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration from config.toml and environment
    let cfg = match settings::Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{}; exiting", e);
            return Err(e.into());
        }
    };

    let service_account = match cfg.validate() {
        Ok(key) => key,
        Err(e) => {
            tracing::error!("{}; exiting", e);
            return Err(e.into());
        }
    };
    tracing::info!(
        spreadsheet_id = %cfg.sheets.spreadsheet_id,
        sheet = %cfg.sheets.sheet_name,
        "Starting checkout service"
    );

    let sheets = SheetsClient::new(&cfg.sheets, service_account)
        .context("building spreadsheet client")?;
    let inventory = Arc::new(SheetInventory::new(sheets, &cfg.sheets.sheet_name));
    let provider = Arc::new(StripeProvider::new(&cfg.stripe).context("building stripe client")?);
    let store = FulfillmentStore::open(&cfg.state_db_path)
        .with_context(|| format!("opening state database at {}", cfg.state_db_path))?;

    let pending = store.dead_letters().context("reading dead letters")?;
    for entry in &pending {
        tracing::warn!(
            session_id = %entry.session_id,
            line_item = %entry.line_item_id,
            description = ?entry.description,
            quantity = entry.quantity,
            reason = %entry.reason,
            "Unresolved line item awaiting manual review"
        );
    }

    let checkout = CheckoutService::new(inventory.clone(), provider.clone(), cfg.checkout.clone());
    let reconciler = Reconciler::new(provider, inventory, store, &cfg.stripe, &cfg.reconcile);

    let state = AppState {
        checkout,
        reconciler: Arc::new(reconciler),
    };

    server::run_server(cfg.server_port, state, &cfg.public_dir).await
}
