#![warn(missing_docs)]

//! Keystash transfer subsystem: pooled SFTP/FTP sessions with leases, retry, and remote directory materialization/pruning

pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod memory;
pub mod paths;
pub mod pool;
pub mod retry;
pub mod store;

pub use client::{ClientFactory, ProtocolClient, RemoteEntry};
pub use config::{Endpoint, PoolConfig, Protocol, RemoteStoreConfig, RetryConfig};
pub use error::{ProtocolError, ProtocolErrorKind, Result, StoreError};
pub use lease::ConnectionLease;
pub use pool::{ConnectionPool, PoolRegistry, PoolStats};
pub use retry::{RetryExecutor, RetryOutcome};
pub use store::RemoteFileStore;
