//! Error types for rsession operations

use thiserror::Error;

/// Codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported type: {type_name}")]
    UnsupportedType { type_name: String },

    #[error("Malformed encoding for tag {tag}: expected {expected} payload bytes, got {actual}")]
    MalformedEncoding {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid payload for tag {tag}: {reason}")]
    InvalidPayload { tag: u8, reason: String },
}

impl CodecError {
    pub(crate) fn unsupported(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }

    pub(crate) fn invalid(tag: u8, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            tag,
            reason: reason.into(),
        }
    }

    /// True for errors caused by stored bytes rather than by the value type.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedEncoding { .. } | Self::InvalidPayload { .. }
        )
    }
}

/// Remote store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{operation} on {key} failed: {reason}")]
    OperationFailed {
        operation: String,
        key: String,
        reason: String,
    },

    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Store connection closed")]
    Disconnected,
}

impl StoreError {
    pub fn operation_failed(
        operation: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid connection string {value:?}: {reason}")]
    InvalidConnectionString { value: String, reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all rsession errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{failed} of {total} remote operations failed: {first}")]
    RemoteOperationFailed {
        failed: usize,
        total: usize,
        first: StoreError,
    },

    #[error("Teardown timed out with {outstanding} of {total} operations outstanding")]
    TeardownTimeout { outstanding: usize, total: usize },
}

/// Result type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for rsession operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_display_malformed() {
        let err = CodecError::MalformedEncoding {
            tag: 9,
            expected: 4,
            actual: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("tag 9"));
        assert!(msg.contains("expected 4"));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_unsupported_type_is_not_malformed() {
        let err = CodecError::unsupported("tag 17");
        assert!(!err.is_malformed());
        assert!(format!("{}", err).contains("tag 17"));
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::operation_failed("HSET", "SID:abc", "broken pipe");
        assert_eq!(format!("{}", err), "HSET on SID:abc failed: broken pipe");
    }

    #[test]
    fn test_session_error_from_conversions() {
        let codec: SessionError = CodecError::unsupported("x").into();
        assert!(matches!(codec, SessionError::Codec(_)));

        let store: SessionError = StoreError::Disconnected.into();
        assert!(matches!(store, SessionError::Store(StoreError::Disconnected)));

        let config: SessionError = ConfigError::InvalidValue {
            field: "port".to_string(),
            value: "0".to_string(),
            reason: "must be non-zero".to_string(),
        }
        .into();
        assert!(matches!(config, SessionError::Config(_)));
    }

    #[test]
    fn test_teardown_timeout_display() {
        let err = SessionError::TeardownTimeout {
            outstanding: 2,
            total: 5,
        };
        assert_eq!(
            format!("{}", err),
            "Teardown timed out with 2 of 5 operations outstanding"
        );
    }
}
