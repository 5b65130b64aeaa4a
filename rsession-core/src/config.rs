//! Session store configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! point at a store on the loopback interface.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, SessionResult};

/// Default store host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default store port.
pub const DEFAULT_PORT: u16 = 5757;

/// Default session lifetime in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;

/// Default bound on the end-of-request wait for outstanding writes.
pub const DEFAULT_WRITE_WAIT_MS: u64 = 1888;

/// Prefix of the recognized connection string format `tcp=<host>:<port>`.
const CONNECTION_SCHEME: &str = "tcp=";

/// Session store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Store host name or address.
    pub host: String,

    /// Store port.
    pub port: u16,

    /// Idle lifetime of a session record; refreshed on every request.
    pub session_timeout: Duration,

    /// Upper bound on the teardown wait for in-flight writes.
    pub write_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            session_timeout: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60),
            write_wait: Duration::from_millis(DEFAULT_WRITE_WAIT_MS),
        }
    }
}

impl SessionConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create SessionConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `RSESSION_CONNECTION`: `tcp=<host>:<port>` (default: tcp=localhost:5757)
    /// - `RSESSION_TIMEOUT_MINUTES`: Session lifetime in minutes (default: 30)
    /// - `RSESSION_WRITE_WAIT_MS`: Teardown wait bound in milliseconds (default: 1888)
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("RSESSION_CONNECTION") {
            match parse_connection_string(&raw) {
                Ok((host, port)) => {
                    config.host = host;
                    config.port = port;
                }
                Err(e) => tracing::warn!(error = %e, "ignoring RSESSION_CONNECTION"),
            }
        }

        if let Ok(raw) = std::env::var("RSESSION_TIMEOUT_MINUTES") {
            match timeout_from_minutes(&raw) {
                Some(timeout) => config.session_timeout = timeout,
                None => tracing::warn!(value = %raw, "ignoring RSESSION_TIMEOUT_MINUTES"),
            }
        }

        if let Some(ms) = std::env::var("RSESSION_WRITE_WAIT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.write_wait = Duration::from_millis(ms);
        }

        config
    }

    /// Apply a `tcp=<host>:<port>` connection string.
    pub fn with_connection_string(mut self, connection: &str) -> SessionResult<Self> {
        let (host, port) = parse_connection_string(connection)?;
        self.host = host;
        self.port = port;
        Ok(self)
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the session timeout in minutes. Saturates at `u64::MAX` seconds.
    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.session_timeout = Duration::from_secs(minutes.saturating_mul(60));
        self
    }

    /// Set the teardown wait bound.
    pub fn with_write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// `host:port` of the store.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Session timeout as whole seconds, the unit of the expire command.
    pub fn ttl_seconds(&self) -> u64 {
        self.session_timeout.as_secs()
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - host is not empty
    /// - port is non-zero
    /// - session timeout is at least one second
    pub fn validate(&self) -> SessionResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host".to_string(),
                value: self.host.clone(),
                reason: "host must not be empty".to_string(),
            }
            .into());
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: "0".to_string(),
                reason: "port must be non-zero".to_string(),
            }
            .into());
        }
        if self.session_timeout.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session_timeout".to_string(),
                value: format!("{:?}", self.session_timeout),
                reason: "timeout must be at least one second".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Parse a positive minute count whose length in seconds fits a `u64`.
fn timeout_from_minutes(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|minutes| *minutes > 0)
        .and_then(|minutes| minutes.checked_mul(60))
        .map(Duration::from_secs)
}

/// Parse `tcp=<host>:<port>` into its parts.
pub fn parse_connection_string(connection: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidConnectionString {
        value: connection.to_string(),
        reason: reason.to_string(),
    };

    let rest = connection
        .strip_prefix(CONNECTION_SCHEME)
        .ok_or_else(|| invalid("expected tcp=<host>:<port>"))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid("port must be an integer in 1..=65535"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5757);
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
        assert_eq!(config.write_wait, Duration::from_millis(1888));
        assert_eq!(config.ttl_seconds(), 1800);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_connection_string() {
        assert_eq!(
            parse_connection_string("tcp=cache.internal:6379").unwrap(),
            ("cache.internal".to_string(), 6379)
        );
    }

    #[test]
    fn test_parse_connection_string_rejects_malformed() {
        for bad in ["cache:6379", "tcp=cache", "tcp=:6379", "tcp=cache:http", "tcp=cache:0"] {
            assert!(
                matches!(
                    parse_connection_string(bad),
                    Err(ConfigError::InvalidConnectionString { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_builder_chain() {
        let config = SessionConfig::new()
            .with_connection_string("tcp=10.0.0.5:7000")
            .unwrap()
            .with_timeout_minutes(5)
            .with_write_wait(Duration::from_millis(250));
        assert_eq!(config.endpoint(), "10.0.0.5:7000");
        assert_eq!(config.ttl_seconds(), 300);
        assert_eq!(config.write_wait, Duration::from_millis(250));
    }

    #[test]
    fn test_timeout_minutes_saturates() {
        let config = SessionConfig::new().with_timeout_minutes(u64::MAX / 30);
        assert_eq!(config.ttl_seconds(), u64::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_from_minutes() {
        assert_eq!(timeout_from_minutes("45"), Some(Duration::from_secs(2700)));
        assert_eq!(timeout_from_minutes(" 1 "), Some(Duration::from_secs(60)));
        assert_eq!(timeout_from_minutes("0"), None);
        assert_eq!(timeout_from_minutes("soon"), None);
        assert_eq!(timeout_from_minutes(&(u64::MAX / 30).to_string()), None);
    }

    #[test]
    fn test_from_env_ignores_overflowing_timeout() {
        // The only test that touches this variable.
        std::env::set_var("RSESSION_TIMEOUT_MINUTES", (u64::MAX / 30).to_string());
        let config = SessionConfig::from_env();
        std::env::remove_var("RSESSION_TIMEOUT_MINUTES");
        assert_eq!(config.session_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = SessionConfig::new().with_timeout_minutes(0);
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
        let config = SessionConfig::new().with_port(0);
        assert!(config.validate().is_err());
        let config = SessionConfig::new().with_host("  ");
        assert!(config.validate().is_err());
    }
}
