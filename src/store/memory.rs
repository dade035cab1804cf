//! In-process stores for tests and single-instance development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{AccountStore, ProcessedEventStore, StoreError};
use crate::billing::{Account, AccountRef};

#[derive(Default)]
struct Accounts {
    by_id: HashMap<String, Account>,
    /// email -> id
    emails: HashMap<String, String>,
    /// api key -> id
    api_keys: HashMap<String, String>,
}

/// Account store backed by a mutex-guarded map with secondary indexes.
#[derive(Default)]
pub struct InMemoryAccountStore {
    inner: Mutex<Accounts>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored accounts.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, key: &AccountRef) -> Result<Option<Account>, StoreError> {
        let inner = self.inner.lock();
        let id = match key {
            AccountRef::Id(id) => Some(id),
            AccountRef::Email(email) => inner.emails.get(email),
            AccountRef::ApiKey(api_key) => inner.api_keys.get(api_key),
        };
        Ok(id.and_then(|id| inner.by_id.get(id)).cloned())
    }

    async fn conditional_put(
        &self,
        account: &Account,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.by_id.get(&account.id) else {
            return Err(StoreError::VersionConflict);
        };
        if current.version != expected_version {
            return Err(StoreError::VersionConflict);
        }
        if current.email != account.email || current.api_key != account.api_key {
            return Err(StoreError::Corrupt(format!(
                "account {} attempted to change a unique key",
                account.id
            )));
        }
        inner.by_id.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn create(&self, account: &Account) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.by_id.contains_key(&account.id) {
            return Err(StoreError::AlreadyExists(format!("id {}", account.id)));
        }
        if inner.emails.contains_key(&account.email) {
            return Err(StoreError::AlreadyExists(format!("email {}", account.email)));
        }
        if inner.api_keys.contains_key(&account.api_key) {
            return Err(StoreError::AlreadyExists("api key".into()));
        }
        inner
            .emails
            .insert(account.email.clone(), account.id.clone());
        inner
            .api_keys
            .insert(account.api_key.clone(), account.id.clone());
        inner.by_id.insert(account.id.clone(), account.clone());
        Ok(())
    }
}

/// Processed-event set backed by a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryEventStore {
    async fn exists(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.events.lock().contains_key(event_id))
    }

    async fn conditional_create(
        &self,
        event_id: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut events = self.events.lock();
        if events.contains_key(event_id) {
            return Err(StoreError::AlreadyExists(format!("event {event_id}")));
        }
        events.insert(event_id.to_string(), applied_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::Tier;

    fn account(id: &str, email: &str, key: &str) -> Account {
        let now = Utc::now();
        Account {
            id: id.into(),
            email: email.into(),
            api_key: key.into(),
            tier: Tier::Free,
            balance: 20,
            purchased_balance: 0,
            total_consumed: 0,
            last_refill_at: now,
            email_verified: false,
            verification_token: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[tokio::test]
    async fn create_and_get_by_every_key() {
        let store = InMemoryAccountStore::new();
        store.create(&account("a1", "x@y.z", "k1")).await.unwrap();

        for key in [
            AccountRef::id("a1"),
            AccountRef::email("X@Y.Z"),
            AccountRef::api_key("k1"),
        ] {
            let found = store.get(&key).await.unwrap();
            assert_eq!(found.unwrap().id, "a1");
        }
        assert!(store.get(&AccountRef::id("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email_and_key() {
        let store = InMemoryAccountStore::new();
        store.create(&account("a1", "x@y.z", "k1")).await.unwrap();

        let dup_email = store.create(&account("a2", "x@y.z", "k2")).await;
        assert!(matches!(dup_email, Err(StoreError::AlreadyExists(_))));

        let dup_key = store.create(&account("a3", "other@y.z", "k1")).await;
        assert!(matches!(dup_key, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn conditional_put_detects_stale_version() {
        let store = InMemoryAccountStore::new();
        let mut acct = account("a1", "x@y.z", "k1");
        store.create(&acct).await.unwrap();

        acct.balance = 10;
        acct.version = 1;
        store.conditional_put(&acct, 0).await.unwrap();

        acct.balance = 5;
        acct.version = 1;
        let stale = store.conditional_put(&acct, 0).await;
        assert!(matches!(stale, Err(StoreError::VersionConflict)));

        let stored = store.get(&AccountRef::id("a1")).await.unwrap().unwrap();
        assert_eq!(stored.balance, 10);
    }

    #[tokio::test]
    async fn event_store_records_once() {
        let store = InMemoryEventStore::new();
        assert!(!store.exists("evt_1").await.unwrap());
        store.conditional_create("evt_1", Utc::now()).await.unwrap();
        assert!(store.exists("evt_1").await.unwrap());
        let again = store.conditional_create("evt_1", Utc::now()).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
    }
}
