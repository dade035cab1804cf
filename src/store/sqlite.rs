//! SQLite-backed account and processed-event store.
//!
//! Tables:
//! - `accounts`: one row per account, `version` column for conditional writes
//! - `processed_events`: payment event ids that have already been applied

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;

use super::{AccountStore, ProcessedEventStore, StoreError};
use crate::billing::{Account, AccountRef, Tier};

const ACCOUNT_COLUMNS: &str = "id, email, api_key, tier, balance, purchased_balance, \
     total_consumed, last_refill_at, email_verified, verification_token, created_at, \
     updated_at, version";

/// SQLite store. One connection behind a mutex; every statement is short.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the ledger database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(db_path)?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and `--store memory` dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        // WAL mode for concurrent readers across processes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                api_key TEXT NOT NULL UNIQUE,
                tier TEXT NOT NULL,
                balance INTEGER NOT NULL,
                purchased_balance INTEGER NOT NULL,
                total_consumed INTEGER NOT NULL,
                last_refill_at INTEGER NOT NULL,
                email_verified INTEGER NOT NULL DEFAULT 0,
                verification_token TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// ── Row conversion ──────────────────────────────────────────────

struct AccountRow {
    id: String,
    email: String,
    api_key: String,
    tier: String,
    balance: i64,
    purchased_balance: i64,
    total_consumed: i64,
    last_refill_at: i64,
    email_verified: bool,
    verification_token: Option<String>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl AccountRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            api_key: row.get(2)?,
            tier: row.get(3)?,
            balance: row.get(4)?,
            purchased_balance: row.get(5)?,
            total_consumed: row.get(6)?,
            last_refill_at: row.get(7)?,
            email_verified: row.get(8)?,
            verification_token: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            version: row.get(12)?,
        })
    }

    fn into_account(self) -> Result<Account, StoreError> {
        let tier: Tier = self
            .tier
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("account {}: tier '{}'", self.id, self.tier)))?;
        Ok(Account {
            balance: to_u64(&self.id, "balance", self.balance)?,
            purchased_balance: to_u64(&self.id, "purchased_balance", self.purchased_balance)?,
            total_consumed: to_u64(&self.id, "total_consumed", self.total_consumed)?,
            last_refill_at: to_time(&self.id, "last_refill_at", self.last_refill_at)?,
            created_at: to_time(&self.id, "created_at", self.created_at)?,
            updated_at: to_time(&self.id, "updated_at", self.updated_at)?,
            version: to_u64(&self.id, "version", self.version)?,
            tier,
            email_verified: self.email_verified,
            verification_token: self.verification_token,
            email: self.email,
            api_key: self.api_key,
            id: self.id,
        })
    }
}

fn to_u64(id: &str, column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("account {id}: negative {column}")))
}

fn to_i64(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range")))
}

fn to_time(id: &str, column: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("account {id}: bad {column}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ── AccountStore ────────────────────────────────────────────────

#[async_trait]
impl AccountStore for SqliteStore {
    async fn get(&self, key: &AccountRef) -> Result<Option<Account>, StoreError> {
        let (column, value) = match key {
            AccountRef::Id(v) => ("id", v),
            AccountRef::Email(v) => ("email", v),
            AccountRef::ApiKey(v) => ("api_key", v),
        };
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {column} = ?1");

        let conn = self.conn.lock();
        let row = conn.query_row(&sql, rusqlite::params![value], AccountRow::from_row);
        match row {
            Ok(row) => row.into_account().map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn conditional_put(
        &self,
        account: &Account,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE accounts SET
                tier = ?1, balance = ?2, purchased_balance = ?3, total_consumed = ?4,
                last_refill_at = ?5, email_verified = ?6, verification_token = ?7,
                updated_at = ?8, version = ?9
             WHERE id = ?10 AND version = ?11",
            rusqlite::params![
                account.tier.as_str(),
                to_i64("balance", account.balance)?,
                to_i64("purchased_balance", account.purchased_balance)?,
                to_i64("total_consumed", account.total_consumed)?,
                account.last_refill_at.timestamp_millis(),
                account.email_verified,
                account.verification_token,
                account.updated_at.timestamp_millis(),
                to_i64("version", account.version)?,
                account.id,
                to_i64("version", expected_version)?,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::VersionConflict);
        }
        Ok(())
    }

    async fn create(&self, account: &Account) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO accounts (id, email, api_key, tier, balance, purchased_balance,
                total_consumed, last_refill_at, email_verified, verification_token,
                created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                account.id,
                account.email,
                account.api_key,
                account.tier.as_str(),
                to_i64("balance", account.balance)?,
                to_i64("purchased_balance", account.purchased_balance)?,
                to_i64("total_consumed", account.total_consumed)?,
                account.last_refill_at.timestamp_millis(),
                account.email_verified,
                account.verification_token,
                account.created_at.timestamp_millis(),
                account.updated_at.timestamp_millis(),
                to_i64("version", account.version)?,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::AlreadyExists(format!("email {}", account.email)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── ProcessedEventStore ─────────────────────────────────────────

#[async_trait]
impl ProcessedEventStore for SqliteStore {
    async fn exists(&self, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_events WHERE event_id = ?1",
            rusqlite::params![event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn conditional_create(
        &self,
        event_id: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO processed_events (event_id, applied_at) VALUES (?1, ?2)",
            rusqlite::params![event_id, applied_at.timestamp_millis()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::AlreadyExists(format!("event {event_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("ledger.db")).unwrap();
        (tmp, store)
    }

    fn account(id: &str, email: &str, key: &str) -> Account {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        Account {
            id: id.into(),
            email: email.into(),
            api_key: key.into(),
            tier: Tier::Free,
            balance: 50,
            purchased_balance: 30,
            total_consumed: 4,
            last_refill_at: t,
            email_verified: false,
            verification_token: Some("tok".into()),
            created_at: t,
            updated_at: t,
            version: 0,
        }
    }

    #[tokio::test]
    async fn stored_account_reads_back_identically() {
        let (_tmp, store) = temp_store();
        let acct = account("a1", "user@example.com", "key1");
        store.create(&acct).await.unwrap();

        let by_email = store
            .get(&AccountRef::email("user@example.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email, acct);

        let by_key = store.get(&AccountRef::api_key("key1")).await.unwrap();
        assert_eq!(by_key.unwrap().id, "a1");
        assert!(store.get(&AccountRef::id("zzz")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_already_exists() {
        let (_tmp, store) = temp_store();
        store
            .create(&account("a1", "user@example.com", "key1"))
            .await
            .unwrap();
        let err = store
            .create(&account("a2", "user@example.com", "key2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn conditional_put_rejects_stale_version() {
        let (_tmp, store) = temp_store();
        let mut acct = account("a1", "user@example.com", "key1");
        store.create(&acct).await.unwrap();

        acct.balance = 48;
        acct.tier = Tier::Premium;
        acct.version = 1;
        store.conditional_put(&acct, 0).await.unwrap();

        let err = store.conditional_put(&acct, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict));

        let stored = store.get(&AccountRef::id("a1")).await.unwrap().unwrap();
        assert_eq!(stored.balance, 48);
        assert_eq!(stored.tier, Tier::Premium);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn processed_events_are_unique() {
        let (_tmp, store) = temp_store();
        assert!(!store.exists("evt_1").await.unwrap());
        store.conditional_create("evt_1", Utc::now()).await.unwrap();
        assert!(store.exists("evt_1").await.unwrap());
        let err = store
            .conditional_create("evt_1", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create(&account("a1", "user@example.com", "key1"))
                .await
                .unwrap();
            store.conditional_create("evt_9", Utc::now()).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(&AccountRef::id("a1")).await.unwrap().is_some());
        assert!(store.exists("evt_9").await.unwrap());
    }
}
