//! rsession Test Utilities
//!
//! Shared test infrastructure for the rsession workspace:
//! - Proptest generators for session values and field maps
//! - Store wrappers that inject failures or hold acknowledgements
//! - Fixtures for seeded stores and hosts
//! - Assertions over the store's operation log

pub use rsession_core::{
    codec, record_key, CodecError, SessionConfig, SessionError, SessionResult, SessionValue,
    StoreError, StoreResult,
};
pub use rsession_store::{
    FieldMap, HashStore, InMemoryHashStore, OperationKind, SessionHost, SessionRecord,
    StoreFuture,
};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{self, FutureExt};
use tokio::sync::watch;

// ============================================================================
// STORE WRAPPERS
// ============================================================================

/// Store wrapper that rejects selected operations.
///
/// Operations are selected by [`OperationKind::name`] (`"get_all_fields"`
/// for the bulk read). A rejected operation never reaches the inner store.
pub struct FaultyStore {
    inner: Arc<dyn HashStore>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn HashStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Reject every future `operation`.
    pub fn fail(&self, operation: &'static str) -> &Self {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation);
        self
    }

    /// Stop rejecting `operation`.
    pub fn heal(&self, operation: &'static str) -> &Self {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(operation);
        self
    }

    fn rejects(&self, operation: &str) -> bool {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(operation)
    }

    fn rejected<T: Send + 'static>(operation: &str, key: &str) -> StoreFuture<T> {
        future::ready(Err(StoreError::operation_failed(operation, key, "injected failure"))).boxed()
    }
}

impl HashStore for FaultyStore {
    fn get_all_fields(&self, key: &str) -> StoreFuture<FieldMap> {
        if self.rejects("get_all_fields") {
            return Self::rejected("get_all_fields", key);
        }
        self.inner.get_all_fields(key)
    }

    fn set_fields(&self, key: &str, fields: FieldMap) -> StoreFuture<()> {
        if self.rejects("set_fields") {
            return Self::rejected("set_fields", key);
        }
        self.inner.set_fields(key, fields)
    }

    fn remove_field(&self, key: &str, field: &str) -> StoreFuture<()> {
        if self.rejects("remove_field") {
            return Self::rejected("remove_field", key);
        }
        self.inner.remove_field(key, field)
    }

    fn remove_key(&self, key: &str) -> StoreFuture<()> {
        if self.rejects("remove_key") {
            return Self::rejected("remove_key", key);
        }
        self.inner.remove_key(key)
    }

    fn expire_key(&self, key: &str, ttl: Duration) -> StoreFuture<()> {
        if self.rejects("expire_key") {
            return Self::rejected("expire_key", key);
        }
        self.inner.expire_key(key, ttl)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

/// Store wrapper that withholds acknowledgements until released.
///
/// Commands still reach the inner store at issue time; only the returned
/// futures wait on the gate. Reads and writes have separate gates, both
/// open by default.
pub struct GatedStore {
    inner: Arc<dyn HashStore>,
    reads: watch::Sender<bool>,
    writes: watch::Sender<bool>,
}

impl GatedStore {
    pub fn new(inner: Arc<dyn HashStore>) -> Self {
        Self {
            inner,
            reads: watch::Sender::new(true),
            writes: watch::Sender::new(true),
        }
    }

    pub fn hold_reads(&self) {
        self.reads.send_replace(false);
    }

    pub fn release_reads(&self) {
        self.reads.send_replace(true);
    }

    pub fn hold_writes(&self) {
        self.writes.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.writes.send_replace(true);
    }

    fn gated<T: Send + 'static>(gate: &watch::Sender<bool>, ack: StoreFuture<T>) -> StoreFuture<T> {
        let mut open = gate.subscribe();
        async move {
            // The sender lives as long as the store; a closed gate means the
            // store is gone, which releases the waiter.
            let _ = open.wait_for(|open| *open).await;
            ack.await
        }
        .boxed()
    }
}

impl HashStore for GatedStore {
    fn get_all_fields(&self, key: &str) -> StoreFuture<FieldMap> {
        Self::gated(&self.reads, self.inner.get_all_fields(key))
    }

    fn set_fields(&self, key: &str, fields: FieldMap) -> StoreFuture<()> {
        Self::gated(&self.writes, self.inner.set_fields(key, fields))
    }

    fn remove_field(&self, key: &str, field: &str) -> StoreFuture<()> {
        Self::gated(&self.writes, self.inner.remove_field(key, field))
    }

    fn remove_key(&self, key: &str) -> StoreFuture<()> {
        Self::gated(&self.writes, self.inner.remove_key(key))
    }

    fn expire_key(&self, key: &str, ttl: Duration) -> StoreFuture<()> {
        Self::gated(&self.writes, self.inner.expire_key(key, ttl))
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for session values.

    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    /// Values that survive the codec unchanged.
    ///
    /// Excludes `Null` (it means "absent"), decimals (stored as a double)
    /// and NaN floats (not equal to themselves).
    pub fn arb_session_value() -> impl Strategy<Value = SessionValue> {
        prop_oneof![
            any::<bool>().prop_map(SessionValue::Bool),
            any::<i8>().prop_map(SessionValue::I8),
            any::<u8>().prop_map(SessionValue::U8),
            any::<i16>().prop_map(SessionValue::I16),
            any::<u16>().prop_map(SessionValue::U16),
            any::<i32>().prop_map(SessionValue::I32),
            any::<u32>().prop_map(SessionValue::U32),
            any::<i64>().prop_map(SessionValue::I64),
            any::<u64>().prop_map(SessionValue::U64),
            any::<char>().prop_map(SessionValue::Char),
            (-1.0e30f32..1.0e30f32).prop_map(SessionValue::F32),
            (-1.0e300f64..1.0e300f64).prop_map(SessionValue::F64),
            arb_datetime().prop_map(SessionValue::DateTime),
            ".{0,32}".prop_map(SessionValue::Text),
            arb_opaque().prop_map(SessionValue::Opaque),
        ]
    }

    /// Timestamps on a 100ns boundary between 1970 and 2100.
    pub fn arb_datetime() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..4_102_444_800i64, 0u32..10_000_000u32).prop_map(|(secs, ticks)| {
            DateTime::from_timestamp(secs, ticks * 100).unwrap_or(DateTime::UNIX_EPOCH)
        })
    }

    /// Small JSON objects.
    pub fn arb_opaque() -> impl Strategy<Value = serde_json::Value> {
        prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..4).prop_map(|entries| {
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            )
        })
    }

    /// Field names.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    /// A session's worth of fields.
    pub fn arb_fields() -> impl Strategy<Value = Vec<(String, SessionValue)>> {
        prop::collection::btree_map(arb_field_name(), arb_session_value(), 0..8)
            .prop_map(|fields| fields.into_iter().collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores, records, and hosts.

    use super::*;
    use rsession_store::FnConnector;

    /// Session id used by single-session fixtures.
    pub const SESSION_ID: &str = "fixture-session";

    /// Config with a short write wait.
    pub fn test_config() -> SessionConfig {
        SessionConfig::new().with_write_wait(Duration::from_millis(250))
    }

    /// Encode `(field, value)` pairs as stored fields.
    pub fn field_map<'a>(pairs: impl IntoIterator<Item = (&'a str, SessionValue)>) -> FieldMap {
        pairs
            .into_iter()
            .map(|(field, value)| (field.to_string(), codec::encode(&value)))
            .collect()
    }

    /// In-memory store holding one session with `pairs`.
    pub fn seeded_store<'a>(
        session_id: &str,
        pairs: impl IntoIterator<Item = (&'a str, SessionValue)>,
    ) -> Arc<InMemoryHashStore> {
        let store = InMemoryHashStore::shared();
        store.seed(&record_key(session_id), field_map(pairs));
        store
    }

    /// Record for `session_id` over any store, with the default timeout.
    pub fn open_record(session_id: &str, store: Arc<dyn HashStore>) -> SessionRecord {
        SessionRecord::new(session_id, store, test_config().session_timeout)
    }

    /// Host whose connector always hands out `store`.
    pub fn host_over(store: Arc<dyn HashStore>) -> SessionHost {
        let connector = FnConnector(move |_: &SessionConfig| -> StoreResult<Arc<dyn HashStore>> {
            Ok(Arc::clone(&store))
        });
        match SessionHost::new(test_config(), Arc::new(connector)) {
            Ok(host) => host,
            Err(e) => panic!("test config rejected: {}", e),
        }
    }

    /// Decoded fields of a session as the store currently holds them.
    pub fn stored_values(store: &InMemoryHashStore, session_id: &str) -> Vec<(String, SessionValue)> {
        let mut values: Vec<(String, SessionValue)> = store
            .snapshot(&record_key(session_id))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(field, bytes)| codec::decode(&bytes).ok().map(|v| (field, v)))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the store's operation log.

    use super::*;

    /// Operations applied to `session_id`, in order.
    pub fn operations_on(store: &InMemoryHashStore, session_id: &str) -> Vec<OperationKind> {
        let key = record_key(session_id);
        store
            .operations()
            .into_iter()
            .filter(|op| op.key == key)
            .map(|op| op.kind)
            .collect()
    }

    /// Assert the exact operation sequence applied to `session_id`.
    pub fn assert_operations(store: &InMemoryHashStore, session_id: &str, expected: &[OperationKind]) {
        assert_eq!(
            operations_on(store, session_id),
            expected,
            "unexpected operation sequence for session {}",
            session_id
        );
    }

    /// Assert that no operation touched an individual field.
    pub fn assert_no_field_writes(store: &InMemoryHashStore, session_id: &str) {
        let writes: Vec<OperationKind> = operations_on(store, session_id)
            .into_iter()
            .filter(OperationKind::is_field_operation)
            .collect();
        assert!(writes.is_empty(), "expected no field writes, found {:?}", writes);
    }

    /// Shorthand for a multi-field write.
    pub fn set_fields(fields: &[&str]) -> OperationKind {
        let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        fields.sort();
        OperationKind::SetFields { fields }
    }

    pub fn remove_field(field: &str) -> OperationKind {
        OperationKind::RemoveField {
            field: field.to_string(),
        }
    }

    pub fn expire(timeout: Duration) -> OperationKind {
        OperationKind::ExpireKey {
            seconds: timeout.as_secs(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_faulty_store_rejects_selected_operations() {
        let memory = InMemoryHashStore::shared();
        let faulty = FaultyStore::new(Arc::clone(&memory) as Arc<dyn HashStore>);
        faulty.fail("remove_key");

        assert!(faulty.remove_key("SID:x").await.is_err());
        assert!(faulty.expire_key("SID:x", Duration::from_secs(1)).await.is_ok());
        assert_eq!(memory.operations().len(), 1);

        faulty.heal("remove_key");
        assert!(faulty.remove_key("SID:x").await.is_ok());
    }

    #[tokio::test]
    async fn test_gated_store_issues_before_release() {
        let memory = InMemoryHashStore::shared();
        let gated = GatedStore::new(Arc::clone(&memory) as Arc<dyn HashStore>);
        gated.hold_writes();

        let ack = gated.remove_key("SID:x");
        assert_eq!(memory.operations().len(), 1);

        gated.release_writes();
        assert!(ack.await.is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_generated_values_survive_codec(value in generators::arb_session_value()) {
            let decoded = codec::decode(&codec::encode(&value)).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
