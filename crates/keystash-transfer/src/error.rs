use thiserror::Error;

/// Category of a failed remote call, as reported by a protocol client adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    /// Path does not exist on the server.
    NotFound,
    /// Path already exists (typically a racing mkdir).
    AlreadyExists,
    /// Server refused access to the path.
    PermissionDenied,
    /// Directory still has entries.
    NotEmpty,
    /// Session dropped mid-call.
    ConnectionLost,
    /// Server temporarily unavailable or throttling.
    Unavailable,
    /// Call timed out.
    Timeout,
    /// Anything else; treated as fatal.
    Other,
}

impl ProtocolErrorKind {
    /// Returns true if a call failing with this kind may succeed when repeated.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ProtocolErrorKind::ConnectionLost
                | ProtocolErrorKind::Unavailable
                | ProtocolErrorKind::Timeout
        )
    }
}

/// Error returned by a [`ProtocolClient`](crate::client::ProtocolClient) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ProtocolError {
    /// Classified category.
    pub kind: ProtocolErrorKind,
    /// Server or library message.
    pub message: String,
}

impl ProtocolError {
    /// Creates an error of the given kind.
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a raw server/library message.
    ///
    /// Adapters over libraries that only report text (SFTP status strings,
    /// FTP reply lines) use this so that every backend shares one
    /// transient/fatal boundary.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let reply_code = lower.get(..3).filter(|c| c.bytes().all(|b| b.is_ascii_digit()));

        let kind = if lower.contains("already exists") || lower.contains("file exists") {
            ProtocolErrorKind::AlreadyExists
        } else if lower.contains("not empty") {
            ProtocolErrorKind::NotEmpty
        } else if lower.contains("no such file")
            || lower.contains("not found")
            || lower.contains("does not exist")
        {
            ProtocolErrorKind::NotFound
        } else if lower.contains("permission denied") || lower.contains("access denied") {
            ProtocolErrorKind::PermissionDenied
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ProtocolErrorKind::Timeout
        } else if lower.contains("connection reset")
            || lower.contains("broken pipe")
            || lower.contains("connection lost")
            || lower.contains("not connected")
        {
            ProtocolErrorKind::ConnectionLost
        } else if lower.contains("service not available")
            || lower.contains("temporarily unavailable")
            || lower.contains("too many connections")
            || matches!(reply_code, Some("421") | Some("450") | Some("451"))
        {
            ProtocolErrorKind::Unavailable
        } else {
            ProtocolErrorKind::Other
        };

        Self { kind, message }
    }

    /// Returns true if the retry executor should repeat the failed call.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Errors surfaced by the pool and the file store operation layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A remote call failed (after any retries).
    #[error("remote operation {operation} failed on {path} after {attempts} attempt(s): {source}")]
    Remote {
        /// Operation name, e.g. `create_directory`.
        operation: &'static str,
        /// Remote path the operation targeted.
        path: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last protocol error.
        #[source]
        source: ProtocolError,
    },

    /// Establishing a new pooled session failed.
    #[error("failed to connect to {host}: {source}")]
    Connect {
        /// Remote host.
        host: String,
        /// Underlying protocol error.
        #[source]
        source: ProtocolError,
    },

    /// The pool stayed saturated for the whole acquire timeout.
    #[error("timed out after {waited_ms}ms waiting for a connection to {host}")]
    PoolTimeout {
        /// Remote host.
        host: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Invalid configuration, detected before any connection attempt.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },

    /// The owning registry has been shut down.
    #[error("connection pool for {host} has been shut down")]
    Shutdown {
        /// Remote host.
        host: String,
    },

    /// A pool was requested outside a tokio runtime, so its reclaimer cannot start.
    #[error("no tokio runtime available to start the connection pool for {host}")]
    NoRuntime {
        /// Remote host.
        host: String,
    },

    /// Local I/O failure (stream variants).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns true if the wrapped remote failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Remote { source, .. } => source.is_retryable(),
            StoreError::Connect { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for the pool saturation timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, StoreError::PoolTimeout { .. })
    }

    /// Kind of the wrapped protocol error, if any.
    pub fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            StoreError::Remote { source, .. } | StoreError::Connect { source, .. } => {
                Some(source.kind)
            }
            _ => None,
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        StoreError::Config {
            reason: reason.into(),
        }
    }
}

/// Result type alias using StoreError as the error type.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(ProtocolErrorKind::ConnectionLost.is_transient());
        assert!(ProtocolErrorKind::Unavailable.is_transient());
        assert!(ProtocolErrorKind::Timeout.is_transient());
        assert!(!ProtocolErrorKind::NotFound.is_transient());
        assert!(!ProtocolErrorKind::AlreadyExists.is_transient());
        assert!(!ProtocolErrorKind::PermissionDenied.is_transient());
        assert!(!ProtocolErrorKind::NotEmpty.is_transient());
        assert!(!ProtocolErrorKind::Other.is_transient());
    }

    #[test]
    fn test_from_message_sftp_texts() {
        assert_eq!(
            ProtocolError::from_message("Cannot create directory: Already exists").kind,
            ProtocolErrorKind::AlreadyExists
        );
        assert_eq!(
            ProtocolError::from_message("No such file").kind,
            ProtocolErrorKind::NotFound
        );
        assert_eq!(
            ProtocolError::from_message("Permission denied").kind,
            ProtocolErrorKind::PermissionDenied
        );
        assert_eq!(
            ProtocolError::from_message("Directory not empty").kind,
            ProtocolErrorKind::NotEmpty
        );
        assert_eq!(
            ProtocolError::from_message("Connection reset by peer").kind,
            ProtocolErrorKind::ConnectionLost
        );
        assert_eq!(
            ProtocolError::from_message("Operation timed out").kind,
            ProtocolErrorKind::Timeout
        );
    }

    #[test]
    fn test_from_message_ftp_reply_codes() {
        let err = ProtocolError::from_message("421 Service not available, closing control connection");
        assert_eq!(err.kind, ProtocolErrorKind::Unavailable);
        assert!(err.is_retryable());

        let err = ProtocolError::from_message("450 Requested file action not taken");
        assert_eq!(err.kind, ProtocolErrorKind::Unavailable);

        let err = ProtocolError::from_message("550 Failed to open file");
        assert_eq!(err.kind, ProtocolErrorKind::Other);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Remote {
            operation: "upload",
            path: "a/b.txt".to_string(),
            attempts: 5,
            source: ProtocolError::new(ProtocolErrorKind::Timeout, "read timed out"),
        };
        assert_eq!(
            err.to_string(),
            "remote operation upload failed on a/b.txt after 5 attempt(s): Timeout: read timed out"
        );
        assert!(err.is_retryable());
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::Timeout));
    }

    #[test]
    fn test_pool_timeout_is_distinct() {
        let err = StoreError::PoolTimeout {
            host: "sftp.example.com".to_string(),
            waited_ms: 120_000,
        };
        assert!(err.is_pool_timeout());
        assert!(!err.is_retryable());
        assert_eq!(err.protocol_kind(), None);
    }
}
