//! Remote hash store contract.
//!
//! The record cache is a client of a hash-oriented key-value store. Every
//! operation is *issued* when the method is called and acknowledged when the
//! returned future resolves, so the order of calls is the order the store
//! sees. Implementations that talk to an async connection get this for free
//! by fronting it with a [`CommandPipeline`](crate::pipeline::CommandPipeline).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rsession_core::StoreResult;

/// Field name to encoded value.
pub type FieldMap = HashMap<String, Vec<u8>>;

/// Acknowledgement of an issued store command.
pub type StoreFuture<T> = BoxFuture<'static, StoreResult<T>>;

/// Client side of a hash-oriented key-value store.
///
/// Implementations must be thread-safe: a single client is shared by every
/// record that is active at the same time. Returned futures must not borrow
/// from `self`, and dropping one must not cancel the command it stands for.
pub trait HashStore: Send + Sync {
    /// Read every field of `key`. A missing key reads as an empty map.
    fn get_all_fields(&self, key: &str) -> StoreFuture<FieldMap>;

    /// Write `fields` into `key` in a single command.
    fn set_fields(&self, key: &str, fields: FieldMap) -> StoreFuture<()>;

    /// Remove one field of `key`.
    fn remove_field(&self, key: &str, field: &str) -> StoreFuture<()>;

    /// Remove `key` with all of its fields.
    fn remove_key(&self, key: &str) -> StoreFuture<()>;

    /// Set the time-to-live of `key`.
    fn expire_key(&self, key: &str, ttl: Duration) -> StoreFuture<()>;

    /// Whether the client can still issue commands.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Description of an issued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Multi-field write. Field names are sorted.
    SetFields { fields: Vec<String> },
    RemoveField { field: String },
    RemoveKey,
    ExpireKey { seconds: u64 },
}

impl OperationKind {
    pub fn set_fields(fields: &FieldMap) -> Self {
        let mut names: Vec<String> = fields.keys().cloned().collect();
        names.sort();
        OperationKind::SetFields { fields: names }
    }

    /// Short command name, used as the `operation` field in logs.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::SetFields { .. } => "set_fields",
            OperationKind::RemoveField { .. } => "remove_field",
            OperationKind::RemoveKey => "remove_key",
            OperationKind::ExpireKey { .. } => "expire_key",
        }
    }

    /// True for operations that touch individual fields.
    pub fn is_field_operation(&self) -> bool {
        matches!(
            self,
            OperationKind::SetFields { .. } | OperationKind::RemoveField { .. }
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::SetFields { fields } => write!(f, "set_fields[{}]", fields.join(",")),
            OperationKind::RemoveField { field } => write!(f, "remove_field[{}]", field),
            OperationKind::RemoveKey => f.write_str("remove_key"),
            OperationKind::ExpireKey { seconds } => write!(f, "expire_key[{}s]", seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_fields_kind_sorts_names() {
        let mut fields = FieldMap::new();
        fields.insert("zeta".to_string(), vec![0]);
        fields.insert("alpha".to_string(), vec![0]);
        assert_eq!(
            OperationKind::set_fields(&fields),
            OperationKind::SetFields {
                fields: vec!["alpha".to_string(), "zeta".to_string()]
            }
        );
    }

    #[test]
    fn test_display_and_classification() {
        let expire = OperationKind::ExpireKey { seconds: 1800 };
        assert_eq!(expire.to_string(), "expire_key[1800s]");
        assert!(!expire.is_field_operation());
        assert!(OperationKind::RemoveField {
            field: "a".to_string()
        }
        .is_field_operation());
        assert_eq!(OperationKind::RemoveKey.name(), "remove_key");
    }
}
