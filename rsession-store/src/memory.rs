//! In-memory hash store.
//!
//! A process-local stand-in for the remote store. Commands are applied the
//! moment they are issued and acknowledged with a ready future, which makes
//! the store trivially order-preserving. Key expiry follows the remote
//! store's rules: writes keep an existing deadline, removing the last field
//! removes the key, and expired keys read as absent.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{self, FutureExt};
use rsession_core::StoreResult;
use tokio::time::Instant;

use crate::pipeline::HashBackend;
use crate::store::{FieldMap, HashStore, OperationKind, StoreFuture};

/// A mutation as recorded in the store's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOperation {
    pub key: String,
    pub kind: OperationKind,
}

#[derive(Debug, Default)]
struct StoredKey {
    fields: FieldMap,
    expires_at: Option<Instant>,
}

impl StoredKey {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    keys: HashMap<String, StoredKey>,
    log: Vec<LoggedOperation>,
    reads: u64,
}

impl MemoryState {
    /// Drop `key` if its deadline has passed.
    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|k| k.is_expired(now)) {
            self.keys.remove(key);
        }
    }
}

/// Thread-safe in-memory hash-of-hashes.
#[derive(Debug, Default)]
pub struct InMemoryHashStore {
    state: RwLock<MemoryState>,
}

impl InMemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning a shareable handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed `key` with raw field bytes without logging an operation.
    pub fn seed(&self, key: &str, fields: FieldMap) {
        let mut state = self.write();
        state.keys.entry(key.to_string()).or_default().fields.extend(fields);
    }

    /// Current fields of `key`, if it exists and has not expired.
    pub fn snapshot(&self, key: &str) -> Option<FieldMap> {
        let now = Instant::now();
        self.read()
            .keys
            .get(key)
            .filter(|k| !k.is_expired(now))
            .map(|k| k.fields.clone())
    }

    /// Remaining time-to-live of `key`, if it has a deadline.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.read()
            .keys
            .get(key)
            .and_then(|k| k.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Every mutation applied so far, in order.
    pub fn operations(&self) -> Vec<LoggedOperation> {
        self.read().log.clone()
    }

    /// Number of bulk reads served.
    pub fn read_count(&self) -> u64 {
        self.read().reads
    }

    pub fn clear_log(&self) {
        self.write().log.clear();
    }

    fn apply_get_all(&self, key: &str) -> StoreResult<FieldMap> {
        let mut state = self.write();
        state.purge_expired(key);
        state.reads += 1;
        Ok(state
            .keys
            .get(key)
            .map(|k| k.fields.clone())
            .unwrap_or_default())
    }

    fn apply_set(&self, key: &str, fields: FieldMap) -> StoreResult<()> {
        let mut state = self.write();
        state.purge_expired(key);
        let kind = OperationKind::set_fields(&fields);
        state.keys.entry(key.to_string()).or_default().fields.extend(fields);
        state.log.push(LoggedOperation {
            key: key.to_string(),
            kind,
        });
        Ok(())
    }

    fn apply_remove_field(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut state = self.write();
        state.purge_expired(key);
        let now_empty = match state.keys.get_mut(key) {
            Some(stored) => {
                stored.fields.remove(field);
                stored.fields.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.keys.remove(key);
        }
        state.log.push(LoggedOperation {
            key: key.to_string(),
            kind: OperationKind::RemoveField {
                field: field.to_string(),
            },
        });
        Ok(())
    }

    fn apply_remove_key(&self, key: &str) -> StoreResult<()> {
        let mut state = self.write();
        state.keys.remove(key);
        state.log.push(LoggedOperation {
            key: key.to_string(),
            kind: OperationKind::RemoveKey,
        });
        Ok(())
    }

    fn apply_expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut state = self.write();
        state.purge_expired(key);
        if let Some(stored) = state.keys.get_mut(key) {
            stored.expires_at = Some(Instant::now() + ttl);
        }
        state.log.push(LoggedOperation {
            key: key.to_string(),
            kind: OperationKind::ExpireKey {
                seconds: ttl.as_secs(),
            },
        });
        Ok(())
    }
}

impl HashStore for InMemoryHashStore {
    fn get_all_fields(&self, key: &str) -> StoreFuture<FieldMap> {
        future::ready(self.apply_get_all(key)).boxed()
    }

    fn set_fields(&self, key: &str, fields: FieldMap) -> StoreFuture<()> {
        future::ready(self.apply_set(key, fields)).boxed()
    }

    fn remove_field(&self, key: &str, field: &str) -> StoreFuture<()> {
        future::ready(self.apply_remove_field(key, field)).boxed()
    }

    fn remove_key(&self, key: &str) -> StoreFuture<()> {
        future::ready(self.apply_remove_key(key)).boxed()
    }

    fn expire_key(&self, key: &str, ttl: Duration) -> StoreFuture<()> {
        future::ready(self.apply_expire(key, ttl)).boxed()
    }
}

#[async_trait]
impl HashBackend for Arc<InMemoryHashStore> {
    async fn get_all_fields(&mut self, key: &str) -> StoreResult<FieldMap> {
        self.apply_get_all(key)
    }

    async fn set_fields(&mut self, key: &str, fields: FieldMap) -> StoreResult<()> {
        self.apply_set(key, fields)
    }

    async fn remove_field(&mut self, key: &str, field: &str) -> StoreResult<()> {
        self.apply_remove_field(key, field)
    }

    async fn remove_key(&mut self, key: &str) -> StoreResult<()> {
        self.apply_remove_key(key)
    }

    async fn expire_key(&mut self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.apply_expire(key, ttl)
    }
}
