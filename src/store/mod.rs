//! Persistence contracts for accounts and processed payment events.
//!
//! The ledger relies entirely on the conditional write here for correctness:
//! no in-process lock is held across a read-modify-write, so any number of
//! stateless instances can share one store.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::billing::{Account, AccountRef};

pub use memory::{InMemoryAccountStore, InMemoryEventStore};
pub use sqlite::SqliteStore;

/// Store-level failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The record changed since it was read.
    #[error("version conflict")]
    VersionConflict,

    /// A uniqueness constraint (id, email, API key, event id) was hit.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the failure may clear up on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::VersionConflict => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Durable account records, addressable by id, email, or API key.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch an account by any unique key.
    async fn get(&self, key: &AccountRef) -> Result<Option<Account>, StoreError>;

    /// Write `account` only if the stored version still equals
    /// `expected_version`; fails with [`StoreError::VersionConflict`] otherwise.
    async fn conditional_put(
        &self,
        account: &Account,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Insert a new account; fails with [`StoreError::AlreadyExists`] when the
    /// id, email, or API key is taken.
    async fn create(&self, account: &Account) -> Result<(), StoreError>;
}

/// Idempotency ledger of applied payment events.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn exists(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Record `event_id` once; a second call fails with
    /// [`StoreError::AlreadyExists`].
    async fn conditional_create(
        &self,
        event_id: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
