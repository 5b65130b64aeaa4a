//! rsession Core - Values, Codec, Errors, Configuration
//!
//! Pure data and encoding with no I/O. The store crate builds the
//! write-back record cache on top of these types.

pub mod codec;
pub mod config;
pub mod error;
pub mod value;

pub use codec::{decode, encode, TypeTag};
pub use config::{parse_connection_string, SessionConfig};
pub use error::{
    CodecError, CodecResult, ConfigError, SessionError, SessionResult, StoreError, StoreResult,
};
pub use value::SessionValue;

/// Namespace prefix for session records in the shared store.
pub const SESSION_KEY_PREFIX: &str = "SID:";

/// Store key of the record holding a session's fields.
pub fn record_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}
