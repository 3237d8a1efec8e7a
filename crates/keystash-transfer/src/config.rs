//! Remote store configuration

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// File-transfer protocol spoken by the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// SSH file transfer protocol.
    #[default]
    Sftp,
    /// Plain FTP.
    Ftp,
}

impl Protocol {
    /// Well-known port used when none is configured.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp => 21,
        }
    }
}

/// Identity of a remote target. Pools are keyed by `host`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Protocol spoken by the server.
    pub protocol: Protocol,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Login secret.
    pub password: String,
}

impl Endpoint {
    /// Creates an endpoint on the protocol's default port.
    pub fn new(
        protocol: Protocol,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            host: host.into(),
            port: protocol.default_port(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Sets the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Pool timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on how long `acquire` waits for a free slot (default: 2 minutes).
    pub acquire_timeout: Duration,
    /// Fallback re-check interval while waiting for a slot (default: 1 second).
    pub poll_interval: Duration,
    /// Idle clients older than this are disconnected (default: 10 seconds).
    pub linger: Duration,
    /// Reclaimer tick (default: 1 second).
    pub reclaim_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            linger: Duration::from_secs(10),
            reclaim_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Rejects zero durations.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("acquire_timeout", self.acquire_timeout),
            ("poll_interval", self.poll_interval),
            ("linger", self.linger),
            ("reclaim_interval", self.reclaim_interval),
        ];
        for (name, value) in fields {
            if value.is_zero() {
                return Err(StoreError::config(format!("pool.{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 5).
    pub max_attempts: u32,
    /// Delay before the first retry (default: 2 seconds).
    pub initial_backoff: Duration,
    /// Multiplier applied per retry (default: 2.0).
    pub backoff_multiplier: f64,
    /// Cap on a single delay (default: 60 seconds).
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Rejects configurations that could never make an attempt or would shrink delays.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(StoreError::config("retry.max_attempts must be at least 1"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(StoreError::config(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

/// Configuration of one SFTP/FTP-backed store.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    /// Protocol spoken by the server.
    #[serde(default)]
    pub protocol: Protocol,
    /// Host name or address.
    pub host: String,
    /// Port; the protocol default when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Login name.
    pub username: String,
    /// Login secret.
    pub password: String,
    /// Remove directories left empty by a delete (default: true).
    #[serde(default = "default_delete_empty_folders")]
    pub delete_empty_folders: bool,
    /// Pool capacity; 0 means unlimited (default: 10).
    #[serde(default = "default_max_connections")]
    pub max_concurrent_connections: usize,
    /// Retry policy for remote calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_delete_empty_folders() -> bool {
    true
}

fn default_max_connections() -> usize {
    10
}

impl RemoteStoreConfig {
    /// Creates a config with defaults for everything but the credentials.
    pub fn new(
        protocol: Protocol,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            host: host.into(),
            port: None,
            username: username.into(),
            password: password.into(),
            delete_empty_folders: default_delete_empty_folders(),
            max_concurrent_connections: default_max_connections(),
            retry: RetryConfig::default(),
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StoreError::config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Fails fast on anything that would only surface later as a connect error.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(StoreError::config("host is required"));
        }
        if self.username.is_empty() {
            return Err(StoreError::config("username is required"));
        }
        if self.password.is_empty() {
            return Err(StoreError::config("password is required"));
        }
        if self.port == Some(0) {
            return Err(StoreError::config("port must be between 1 and 65535"));
        }
        self.retry.validate()
    }

    /// Endpoint with the port resolved.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            protocol: self.protocol,
            host: self.host.clone(),
            port: self.port.unwrap_or_else(|| self.protocol.default_port()),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for RemoteStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStoreConfig")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("delete_empty_folders", &self.delete_empty_folders)
            .field("max_concurrent_connections", &self.max_concurrent_connections)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RemoteStoreConfig {
        RemoteStoreConfig::new(Protocol::Sftp, "files.example.com", "svc", "hunter2")
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert!(config.delete_empty_folders);
        assert_eq!(config.max_concurrent_connections, 10);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_default_ports() {
        assert_eq!(valid().endpoint().port, 22);

        let mut ftp = valid();
        ftp.protocol = Protocol::Ftp;
        assert_eq!(ftp.endpoint().port, 21);

        ftp.port = Some(2121);
        assert_eq!(ftp.endpoint().port, 2121);
        assert_eq!(ftp.endpoint().address(), "files.example.com:2121");
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut config = valid();
        config.host = "  ".to_string();
        assert!(matches!(config.validate(), Err(StoreError::Config { .. })));

        let mut config = valid();
        config.username.clear();
        assert!(matches!(config.validate(), Err(StoreError::Config { .. })));

        let mut config = valid();
        config.password.clear();
        assert!(matches!(config.validate(), Err(StoreError::Config { .. })));
    }

    #[test]
    fn test_validate_port_and_retry() {
        let mut config = valid();
        config.port = Some(0);
        assert!(config.validate().is_err());

        let mut config = valid();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_config_validate() {
        let config = PoolConfig::default();
        assert_eq!(config.acquire_timeout, Duration::from_secs(120));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.linger, Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let config = PoolConfig {
            linger: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config { .. })));
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = RemoteStoreConfig::from_json(
            r#"{"protocol":"ftp","host":"ftp.example.com","username":"u","password":"p"}"#,
        )
        .unwrap();
        assert_eq!(config.protocol, Protocol::Ftp);
        assert_eq!(config.endpoint().port, 21);
        assert!(config.delete_empty_folders);
        assert_eq!(config.max_concurrent_connections, 10);
    }

    #[test]
    fn test_from_json_rejects_missing_password() {
        let err = RemoteStoreConfig::from_json(
            r#"{"host":"ftp.example.com","username":"u","password":""}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("password"));

        assert!(RemoteStoreConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?} {:?}", valid(), valid().endpoint());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
