//! Inventory gateway over the stock spreadsheet.
//!
//! The sheet is the only persistent catalog state. Layout: one header row,
//! then one product per row with columns A..E = id, name, price, image,
//! available. Every call re-reads the table; nothing is cached.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::sheets::{SheetsError, ValuesApi};

/// Sheet row holding the first product (row 1 is the header).
pub const FIRST_DATA_ROW: usize = 2;
const AVAILABLE_COLUMN: &str = "E";

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryRow {
    pub id: String,
    pub name: String,
    pub price: Option<Decimal>,
    pub image: String,
    pub available: u64,
    /// 1-based sheet row this entry was read from.
    pub row_number: usize,
}

/// Outcome of one applied decrement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrement {
    pub id: String,
    pub old_quantity: u64,
    pub new_quantity: u64,
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("inventory unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("product not found in inventory: {0}")]
    RowNotFound(String),
}

impl From<SheetsError> for InventoryError {
    fn from(e: SheetsError) -> Self {
        InventoryError::UpstreamUnavailable(e.to_string())
    }
}

#[async_trait]
pub trait InventoryGateway: Send + Sync {
    /// Reads the whole table in sheet order.
    async fn fetch_snapshot(&self) -> Result<Vec<InventoryRow>, InventoryError>;

    /// Sets `available = max(0, available - quantity)` on the row keyed by `id`.
    async fn decrement(&self, id: &str, quantity: u64) -> Result<Decrement, InventoryError>;
}

/// Stock left after removing `quantity`; floored at zero, never negative.
pub fn next_available(available: u64, quantity: u64) -> u64 {
    available.saturating_sub(quantity)
}

/// Leading-integer parse of an "available" cell. Anything unparseable is 0.
pub fn parse_available(cell: &str) -> u64 {
    let trimmed = cell.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if negative {
        return 0;
    }
    digits
        .get(..end)
        .and_then(|d| d.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Turns raw sheet rows (starting at [`FIRST_DATA_ROW`]) into inventory rows.
/// Rows with a blank id keep their position but are dropped.
pub fn parse_rows(values: Vec<Vec<String>>) -> Vec<InventoryRow> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let mut cells = row.into_iter();
            let id = cells.next().unwrap_or_default().trim().to_string();
            if id.is_empty() {
                return None;
            }
            let name = cells.next().unwrap_or_default();
            let price = cells
                .next()
                .and_then(|p| Decimal::from_str(p.trim().trim_start_matches('€')).ok());
            let image = cells.next().unwrap_or_default();
            let available = cells.next().map(|a| parse_available(&a)).unwrap_or(0);
            Some(InventoryRow {
                id,
                name,
                price,
                image,
                available,
                row_number: index + FIRST_DATA_ROW,
            })
        })
        .collect()
}

/// A1 sheet prefix, quoted when the name is not a bare identifier.
pub fn sheet_prefix(sheet_name: &str) -> String {
    if sheet_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        sheet_name.to_string()
    } else {
        format!("'{}'", sheet_name.replace('\'', "''"))
    }
}

/// Sheet-backed gateway. Decrements of the same id are serialized in-process
/// so a read-modify-write never interleaves with another one for that row.
pub struct SheetInventory {
    client: Box<dyn ValuesApi>,
    sheet: String,
    row_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SheetInventory {
    pub fn new(client: impl ValuesApi + 'static, sheet_name: &str) -> Self {
        Self {
            client: Box::new(client),
            sheet: sheet_prefix(sheet_name),
            row_locks: DashMap::new(),
        }
    }

    fn read_range(&self) -> String {
        format!("{}!A{}:{}", self.sheet, FIRST_DATA_ROW, AVAILABLE_COLUMN)
    }

    fn available_cell(&self, row_number: usize) -> String {
        format!("{}!{}{}", self.sheet, AVAILABLE_COLUMN, row_number)
    }

    fn row_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry for `id` once no decrement holds or waits on it.
    fn release_row_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.row_locks
            .remove_if(id, |_, entry| Arc::strong_count(entry) == 1);
    }

    async fn decrement_row(&self, id: &str, quantity: u64) -> Result<Decrement, InventoryError> {
        let snapshot = self.fetch_snapshot().await?;
        let Some(row) = snapshot.iter().find(|row| row.id == id) else {
            warn!(id = %id, "Product not found in sheet");
            return Err(InventoryError::RowNotFound(id.to_string()));
        };

        let new_quantity = next_available(row.available, quantity);
        let cell = self.available_cell(row.row_number);
        let value = i64::try_from(new_quantity)
            .map_err(|e| InventoryError::UpstreamUnavailable(e.to_string()))?;
        self.client.update_cell(&cell, value).await?;

        info!(
            id = %id,
            cell = %cell,
            old_quantity = row.available,
            new_quantity = new_quantity,
            "Stock updated"
        );

        Ok(Decrement {
            id: id.to_string(),
            old_quantity: row.available,
            new_quantity,
        })
    }
}

#[async_trait]
impl InventoryGateway for SheetInventory {
    #[instrument(skip(self))]
    async fn fetch_snapshot(&self) -> Result<Vec<InventoryRow>, InventoryError> {
        let values = self.client.get_values(&self.read_range()).await?;
        Ok(parse_rows(values))
    }

    #[instrument(skip(self))]
    async fn decrement(&self, id: &str, quantity: u64) -> Result<Decrement, InventoryError> {
        let lock = self.row_lock(id);
        let result = {
            let _guard = lock.lock().await;
            self.decrement_row(id, quantity).await
        };
        self.release_row_lock(id, lock);
        result
    }
}
