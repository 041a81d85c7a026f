//! redb store for reconciliation bookkeeping
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `processed_sessions` | session id | `SessionRecord` JSON | Idempotency of webhook redelivery |
//! | `dead_letters` | `(session id, line item id)` | `DeadLetterEntry` JSON | Line items that could not be mapped to inventory |

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const PROCESSED_SESSIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("processed_sessions");

const DEAD_LETTER_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("dead_letters");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    InProgress,
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub state: SessionState,
    pub event_id: String,
    pub claimed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<i64>,
    #[serde(default)]
    pub decremented: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
}

/// A purchased line that never reached inventory and needs manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub session_id: String,
    pub line_item_id: String,
    pub description: Option<String>,
    pub quantity: u64,
    pub reason: String,
    pub recorded_at: i64,
}

#[derive(Clone)]
pub struct FulfillmentStore {
    db: Arc<Database>,
}

impl FulfillmentStore {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PROCESSED_SESSIONS_TABLE)?;
            let _ = write_txn.open_table(DEAD_LETTER_TABLE)?;
        }
        write_txn.commit()?;

        info!("Fulfillment store initialized");
        Ok(Self { db: Arc::new(db) })
    }

    /// Atomically claims a session for reconciliation.
    /// Returns false when the session was already claimed or reconciled.
    pub fn try_claim(&self, session_id: &str, event_id: &str) -> StorageResult<bool> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROCESSED_SESSIONS_TABLE)?;
            if table.get(session_id)?.is_some() {
                return Ok(false);
            }
            let record = SessionRecord {
                state: SessionState::InProgress,
                event_id: event_id.to_string(),
                claimed_at: Utc::now().timestamp(),
                reconciled_at: None,
                decremented: Vec::new(),
                skipped: Vec::new(),
            };
            let value = serde_json::to_vec(&record)?;
            table.insert(session_id, value.as_slice())?;
        }
        write_txn.commit()?;
        debug!(session_id = %session_id, "Session claimed");
        Ok(true)
    }

    /// Drops a claim so a later delivery can reconcile the session.
    pub fn release(&self, session_id: &str) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROCESSED_SESSIONS_TABLE)?;
            table.remove(session_id)?;
        }
        write_txn.commit()?;
        debug!(session_id = %session_id, "Session claim released");
        Ok(())
    }

    pub fn mark_reconciled(
        &self,
        session_id: &str,
        decremented: Vec<String>,
        skipped: Vec<String>,
    ) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROCESSED_SESSIONS_TABLE)?;
            let existing = match table.get(session_id)? {
                Some(curr) => Some(serde_json::from_slice::<SessionRecord>(curr.value())?),
                None => None,
            };
            let now = Utc::now().timestamp();
            let record = SessionRecord {
                state: SessionState::Reconciled,
                event_id: existing
                    .as_ref()
                    .map(|r| r.event_id.clone())
                    .unwrap_or_default(),
                claimed_at: existing.map(|r| r.claimed_at).unwrap_or(now),
                reconciled_at: Some(now),
                decremented,
                skipped,
            };
            let value = serde_json::to_vec(&record)?;
            table.insert(session_id, value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn session(&self, session_id: &str) -> StorageResult<Option<SessionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROCESSED_SESSIONS_TABLE)?;
        match table.get(session_id)? {
            Some(curr) => Ok(Some(serde_json::from_slice(curr.value())?)),
            None => Ok(None),
        }
    }

    pub fn record_dead_letter(&self, entry: &DeadLetterEntry) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEAD_LETTER_TABLE)?;
            let value = serde_json::to_vec(entry)?;
            table.insert(
                (entry.session_id.as_str(), entry.line_item_id.as_str()),
                value.as_slice(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn dead_letters(&self) -> StorageResult<Vec<DeadLetterEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEAD_LETTER_TABLE)?;
        let mut entries = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let store = FulfillmentStore::open_in_memory().unwrap();
        assert!(store.try_claim("cs_1", "evt_1").unwrap());
        assert!(!store.try_claim("cs_1", "evt_2").unwrap());
        assert!(store.try_claim("cs_2", "evt_3").unwrap());

        let record = store.session("cs_1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::InProgress);
        assert_eq!(record.event_id, "evt_1");
    }

    #[test]
    fn test_release_allows_reclaim() {
        let store = FulfillmentStore::open_in_memory().unwrap();
        assert!(store.try_claim("cs_1", "evt_1").unwrap());
        store.release("cs_1").unwrap();
        assert!(store.session("cs_1").unwrap().is_none());
        assert!(store.try_claim("cs_1", "evt_2").unwrap());
    }

    #[test]
    fn test_reconciled_record_keeps_claim_details() {
        let store = FulfillmentStore::open_in_memory().unwrap();
        store.try_claim("cs_1", "evt_1").unwrap();
        store
            .mark_reconciled("cs_1", vec!["A1".into()], vec!["ZZZ".into()])
            .unwrap();

        let record = store.session("cs_1").unwrap().unwrap();
        assert_eq!(record.state, SessionState::Reconciled);
        assert_eq!(record.event_id, "evt_1");
        assert_eq!(record.decremented, vec!["A1"]);
        assert_eq!(record.skipped, vec!["ZZZ"]);
        assert!(record.reconciled_at.is_some());
        assert!(!store.try_claim("cs_1", "evt_9").unwrap());
    }

    #[test]
    fn test_dead_letters_roundtrip() {
        let store = FulfillmentStore::open_in_memory().unwrap();
        let entry = DeadLetterEntry {
            session_id: "cs_1".into(),
            line_item_id: "li_1".into(),
            description: Some("Mug".into()),
            quantity: 2,
            reason: "missing product metadata id".into(),
            recorded_at: 1_700_000_000,
        };
        store.record_dead_letter(&entry).unwrap();
        assert_eq!(store.dead_letters().unwrap(), vec![entry]);
    }
}
