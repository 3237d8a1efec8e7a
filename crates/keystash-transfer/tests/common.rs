//! Common test utilities and fixtures for integration tests.

use std::sync::Arc;

use keystash_transfer::memory::MemoryRemote;
use keystash_transfer::{PoolConfig, PoolRegistry, Protocol, RemoteFileStore, RemoteStoreConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const HOST: &str = "files.example.com";

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

/// A simulated server with a registry of pools against it
pub struct Fixture {
    pub remote: MemoryRemote,
    pub registry: PoolRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_pool_config(PoolConfig::default())
    }

    pub fn with_pool_config(config: PoolConfig) -> Self {
        init_tracing();
        let remote = MemoryRemote::new();
        let registry = PoolRegistry::new(Arc::new(remote.clone()), config).unwrap();
        Self { remote, registry }
    }

    pub fn store_config(&self, capacity: usize) -> RemoteStoreConfig {
        let mut config = RemoteStoreConfig::new(Protocol::Sftp, HOST, "svc", "secret");
        config.max_concurrent_connections = capacity;
        config
    }

    /// Opens a store on [`HOST`] with the given pool capacity.
    pub fn store(&self, capacity: usize) -> RemoteFileStore {
        RemoteFileStore::open(&self.registry, self.store_config(capacity)).unwrap()
    }
}
