//! Write-back session record cache.
//!
//! A [`SessionRecord`] is the per-request view of one session's fields. It
//! issues a bulk read of the whole record when it is created and only waits
//! for that read the first time a field is touched. Mutations are tracked per
//! field against the bytes last written to (or read from) the store, so the
//! store only sees writes for fields whose encoding actually changed.
//!
//! # Persistence
//!
//! - [`SessionRecord::set`] writes the field immediately when its encoding
//!   changed (speculative persist).
//! - [`SessionRecord::remove`], [`SessionRecord::set_deferred`] and
//!   [`SessionRecord::update`] leave the store alone until
//!   [`SessionRecord::harvest`], which batches every remaining write into one
//!   multi-field command, removes deleted fields, and refreshes the key's
//!   time-to-live.
//! - [`SessionRecord::clear`] collapses everything into a single key removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rsession_core::{codec, record_key, CodecError, SessionResult, SessionValue};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

use crate::coordinator::{self, PendingOperation, PendingOperations, TeardownReport};
use crate::store::{FieldMap, HashStore, OperationKind, StoreFuture};

/// What a field currently holds.
#[derive(Debug, Clone)]
enum Slot {
    Value(SessionValue),
    /// Stored bytes that failed to decode. Reported on read, never rewritten.
    Undecodable(CodecError),
    Removed,
}

/// Per-field tracking state.
#[derive(Debug, Clone)]
struct Item {
    slot: Slot,
    /// Assigned since the last persist.
    dirty: bool,
    /// The store has no copy of this field.
    added: bool,
    /// Deleted locally; the store copy must go.
    removed: bool,
    /// Bytes last written to or read from the store.
    persisted: Option<Vec<u8>>,
}

/// A write decided for a single field.
enum FieldWrite {
    Set(Vec<u8>),
    Remove,
}

impl Item {
    fn from_store(bytes: Vec<u8>) -> Self {
        let slot = match codec::decode(&bytes) {
            Ok(SessionValue::Null) => Slot::Removed,
            Ok(value) => Slot::Value(value),
            Err(e) => Slot::Undecodable(e),
        };
        Self {
            slot,
            dirty: false,
            added: false,
            removed: false,
            persisted: Some(bytes),
        }
    }

    fn new_added() -> Self {
        Self {
            slot: Slot::Removed,
            dirty: true,
            added: true,
            removed: false,
            persisted: None,
        }
    }

    fn is_live(&self) -> bool {
        !matches!(self.slot, Slot::Removed)
    }

    fn assign(&mut self, value: SessionValue) {
        self.dirty = true;
        if value.is_null() {
            if self.is_live() {
                self.removed = true;
            }
            self.slot = Slot::Removed;
        } else {
            self.removed = false;
            self.slot = Slot::Value(value);
        }
    }

    fn mark_removed(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.slot = Slot::Removed;
        self.removed = true;
        true
    }

    /// Reconciliation rule. A field removed before the store ever saw it
    /// needs nothing.
    ///
    /// Stored bytes that decode but are not the canonical encoding (trailing
    /// bytes, a boolean payload other than 0 or 1, opaque JSON with other
    /// key order or spacing) compare unequal, so the first harvest after
    /// loading them rewrites the field once, even on a read-only request.
    /// Later loads see the canonical bytes and write nothing.
    fn needs_persisting(&self) -> bool {
        match &self.slot {
            Slot::Value(value) => {
                self.dirty
                    || self.added
                    || self.persisted.as_deref() != Some(codec::encode(value).as_slice())
            }
            Slot::Removed => self.removed && !self.added,
            Slot::Undecodable(_) => false,
        }
    }

    /// Decide and record the write that brings the store in line with this
    /// field, then clear the transient flags.
    fn take_write(&mut self, force: bool) -> Option<FieldWrite> {
        let write = match &self.slot {
            Slot::Value(value) => {
                let encoded = codec::encode(value);
                if force || self.added || self.persisted.as_deref() != Some(encoded.as_slice()) {
                    self.persisted = Some(encoded.clone());
                    Some(FieldWrite::Set(encoded))
                } else {
                    None
                }
            }
            Slot::Removed if self.removed && !self.added => {
                self.persisted = None;
                Some(FieldWrite::Remove)
            }
            _ => None,
        };
        self.dirty = false;
        self.removed = false;
        self.added = self.persisted.is_none();
        write
    }
}

#[derive(Debug, Default)]
struct RecordState {
    items: HashMap<String, Item>,
    cleared: bool,
    dirty: bool,
}

/// The cached fields of one session for the duration of one request.
pub struct SessionRecord {
    session_id: String,
    record_key: String,
    store: Arc<dyn HashStore>,
    timeout: Duration,
    initial_read: AsyncMutex<Option<StoreFuture<FieldMap>>>,
    loaded: AtomicBool,
    state: RwLock<RecordState>,
    pending: PendingOperations,
}

impl SessionRecord {
    /// Create the record and issue the bulk read of its fields.
    ///
    /// The read is not awaited here; the first field access waits for it.
    pub fn new(session_id: impl Into<String>, store: Arc<dyn HashStore>, timeout: Duration) -> Self {
        let session_id = session_id.into();
        let record_key = record_key(&session_id);
        let initial_read = store.get_all_fields(&record_key);
        debug!(session_key = %record_key, "issued initial session read");
        Self {
            session_id,
            record_key,
            store,
            timeout,
            initial_read: AsyncMutex::new(Some(initial_read)),
            loaded: AtomicBool::new(false),
            state: RwLock::new(RecordState::default()),
            pending: PendingOperations::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store key holding this session.
    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the initial read has been consumed.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn is_cleared(&self) -> bool {
        self.read_state().cleared
    }

    /// Whether anything was mutated during this request.
    pub fn is_dirty(&self) -> bool {
        let state = self.read_state();
        state.dirty || state.cleared
    }

    /// Kinds of the operations issued so far and not yet harvested.
    pub fn pending_kinds(&self) -> Vec<OperationKind> {
        self.pending.kinds()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RecordState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RecordState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the initial read and merge it into the record.
    ///
    /// A failed read is returned to this caller only; the record then
    /// behaves as an empty session.
    async fn ensure_loaded(&self) -> SessionResult<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let mut initial_read = self.initial_read.lock().await;
        // Awaited in place so a cancelled caller leaves the read for the next.
        let Some(read) = initial_read.as_mut() else {
            return Ok(());
        };
        let result = read.await;
        *initial_read = None;

        let outcome = match result {
            Ok(fields) => {
                let count = fields.len();
                let mut state = self.write_state();
                for (key, bytes) in fields {
                    state.items.insert(key, Item::from_store(bytes));
                }
                debug!(session_key = %self.record_key, fields = count, "session loaded");
                Ok(())
            }
            Err(e) => {
                error!(session_key = %self.record_key, error = %e, "initial session read failed");
                Err(e.into())
            }
        };
        self.loaded.store(true, Ordering::Release);
        outcome
    }

    fn issue_write(&self, field: &str, write: FieldWrite) {
        match write {
            FieldWrite::Set(bytes) => {
                let mut fields = FieldMap::with_capacity(1);
                fields.insert(field.to_string(), bytes);
                self.issue_set(fields);
            }
            FieldWrite::Remove => {
                let ack = self.store.remove_field(&self.record_key, field);
                self.track(
                    OperationKind::RemoveField {
                        field: field.to_string(),
                    },
                    ack,
                );
            }
        }
    }

    fn issue_set(&self, fields: FieldMap) {
        let kind = OperationKind::set_fields(&fields);
        let ack = self.store.set_fields(&self.record_key, fields);
        self.track(kind, ack);
    }

    fn track(&self, kind: OperationKind, ack: StoreFuture<()>) {
        debug!(session_key = %self.record_key, operation = %kind, "issued session write");
        self.pending.push(PendingOperation::new(kind, ack));
    }

    /// Read a field. `None` if it was never set or has been removed.
    ///
    /// Fails with a codec error if the stored bytes cannot be decoded.
    pub async fn get(&self, key: &str) -> SessionResult<Option<SessionValue>> {
        self.ensure_loaded().await?;
        let state = self.read_state();
        match state.items.get(key).map(|item| &item.slot) {
            Some(Slot::Value(value)) => Ok(Some(value.clone())),
            Some(Slot::Undecodable(e)) => Err(e.clone().into()),
            Some(Slot::Removed) | None => Ok(None),
        }
    }

    /// Whether a field is currently live.
    pub async fn contains(&self, key: &str) -> SessionResult<bool> {
        self.ensure_loaded().await?;
        Ok(self
            .read_state()
            .items
            .get(key)
            .is_some_and(Item::is_live))
    }

    /// Assign a field and write it through if its encoding changed.
    ///
    /// Assigning [`SessionValue::Null`] removes the field.
    pub async fn set(&self, key: &str, value: impl Into<SessionValue>) -> SessionResult<()> {
        self.ensure_loaded().await?;
        let mut state = self.write_state();
        state.dirty = true;
        let cleared = state.cleared;
        let item = state
            .items
            .entry(key.to_string())
            .or_insert_with(Item::new_added);
        item.assign(value.into());
        // Held for harvest until the pending key removal is issued.
        if cleared {
            return Ok(());
        }
        // Issued under the lock so writes to one field leave in call order.
        if let Some(write) = item.take_write(false) {
            self.issue_write(key, write);
        }
        Ok(())
    }

    /// Assign a field without writing it; harvest persists it.
    pub async fn set_deferred(&self, key: &str, value: impl Into<SessionValue>) -> SessionResult<()> {
        self.ensure_loaded().await?;
        let mut state = self.write_state();
        state.dirty = true;
        state
            .items
            .entry(key.to_string())
            .or_insert_with(Item::new_added)
            .assign(value.into());
        Ok(())
    }

    /// Mutate a live field in place. Returns `false` if the field is absent.
    ///
    /// No write is issued; harvest detects the change by re-encoding.
    /// Setting the value to `Null` inside `f` removes the field.
    pub async fn update<F>(&self, key: &str, f: F) -> SessionResult<bool>
    where
        F: FnOnce(&mut SessionValue),
    {
        self.ensure_loaded().await?;
        let mut state = self.write_state();
        let Some(item) = state.items.get_mut(key) else {
            return Ok(false);
        };
        match &mut item.slot {
            Slot::Value(value) => {
                f(value);
                if value.is_null() {
                    item.mark_removed();
                }
            }
            Slot::Undecodable(e) => return Err(e.clone().into()),
            Slot::Removed => return Ok(false),
        }
        state.dirty = true;
        Ok(true)
    }

    /// Delete a field. The store is updated at harvest.
    pub async fn remove(&self, key: &str) -> SessionResult<()> {
        self.ensure_loaded().await?;
        let mut state = self.write_state();
        let removed = state
            .items
            .get_mut(key)
            .is_some_and(Item::mark_removed);
        if removed {
            state.dirty = true;
        }
        Ok(())
    }

    /// Discard every field. Harvest removes the whole key.
    ///
    /// A bulk read that has not been consumed yet is abandoned.
    pub async fn clear(&self) {
        {
            let mut initial_read = self.initial_read.lock().await;
            *initial_read = None;
            self.loaded.store(true, Ordering::Release);
        }
        let mut state = self.write_state();
        state.items.clear();
        state.cleared = true;
        state.dirty = true;
    }

    /// Snapshot of the live field names, sorted.
    pub async fn keys(&self) -> SessionResult<Vec<String>> {
        self.ensure_loaded().await?;
        let state = self.read_state();
        let mut keys: Vec<String> = state
            .items
            .iter()
            .filter(|(_, item)| item.is_live())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Number of live fields.
    pub async fn len(&self) -> SessionResult<usize> {
        self.ensure_loaded().await?;
        Ok(self.read_state().items.values().filter(|item| item.is_live()).count())
    }

    pub async fn is_empty(&self) -> SessionResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// End-of-request reconciliation.
    ///
    /// Issues the key removal if the record was cleared, then the writes and
    /// removals still owed to the store, then a time-to-live refresh. Hands
    /// back every operation issued since the last harvest.
    pub fn harvest(&self) -> Vec<PendingOperation> {
        {
            let mut state = self.write_state();
            if state.cleared {
                let ack = self.store.remove_key(&self.record_key);
                self.track(OperationKind::RemoveKey, ack);
                state.cleared = false;
            }

            let mut keys: Vec<String> = state
                .items
                .iter()
                .filter(|(_, item)| item.needs_persisting())
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort();

            let mut batch = FieldMap::new();
            for key in keys {
                let Some(item) = state.items.get_mut(&key) else {
                    continue;
                };
                match item.take_write(true) {
                    Some(FieldWrite::Set(bytes)) => {
                        batch.insert(key, bytes);
                    }
                    Some(FieldWrite::Remove) => self.issue_write(&key, FieldWrite::Remove),
                    None => {}
                }
            }
            if !batch.is_empty() {
                self.issue_set(batch);
            }
        }

        let ack = self.store.expire_key(&self.record_key, self.timeout);
        self.track(
            OperationKind::ExpireKey {
                seconds: self.timeout.as_secs(),
            },
            ack,
        );
        self.pending.take_all()
    }

    /// Harvest and wait for everything issued, bounded by `wait`.
    pub async fn finish(&self, wait: Duration) -> TeardownReport {
        let ops = self.harvest();
        coordinator::await_all(ops, wait).await
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("record_key", &self.record_key)
            .field("timeout", &self.timeout)
            .field("loaded", &self.is_loaded())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
