//! File store operations over a pooled SFTP/FTP endpoint.
//!
//! Every operation leases a session, runs its remote calls under the retry
//! executor and returns the session to the pool when the lease goes out of
//! scope, whichever way the operation ends.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::RemoteStoreConfig;
use crate::error::{ProtocolErrorKind, Result, StoreError};
use crate::paths::{join, parent_directory, PathMaterializer, PathPruner};
use crate::pool::{ConnectionPool, PoolRegistry};
use crate::retry::{RetryExecutor, RetryOutcome};

/// CRUD-style access to files on one remote endpoint.
pub struct RemoteFileStore {
    config: RemoteStoreConfig,
    pool: Arc<ConnectionPool>,
    retry: RetryExecutor,
}

impl RemoteFileStore {
    /// Validates `config` and attaches to (or creates) the pool for its host.
    ///
    /// Creating the host's first pool needs a tokio runtime; outside one this
    /// fails with [`StoreError::NoRuntime`].
    pub fn open(registry: &PoolRegistry, config: RemoteStoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = registry.get_or_create(&config.endpoint(), config.max_concurrent_connections)?;
        let retry = RetryExecutor::new(config.retry.clone());
        Ok(Self {
            config,
            pool,
            retry,
        })
    }

    /// Store configuration.
    pub fn config(&self) -> &RemoteStoreConfig {
        &self.config
    }

    /// Pool shared by every store on this host.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Whether a file or directory exists at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let lease = self.pool.acquire().await?;
        self.retry
            .run("exists", path, || lease.exists(path))
            .await
    }

    /// Reads the whole file at `path`.
    pub async fn read_all(&self, path: &str) -> Result<Bytes> {
        let lease = self.pool.acquire().await?;
        self.retry
            .run("download", path, || lease.download(path))
            .await
    }

    /// Writes `data` to `path`, creating missing parent directories first.
    pub async fn write_all(&self, path: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let lease = self.pool.acquire().await?;

        if let Some(parent) = parent_directory(path) {
            PathMaterializer::new(lease.client(), &self.retry)
                .ensure_directory(&parent)
                .await?;
        }
        self.retry
            .run("upload", path, || lease.upload(path, data.clone()))
            .await?;
        debug!(path, bytes = data.len(), "wrote remote file");
        Ok(())
    }

    /// Deletes the file at `path`, then prunes parent directories left empty
    /// when `delete_empty_folders` is set.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let lease = self.pool.acquire().await?;
        self.retry
            .run("delete_file", path, || lease.delete_file(path))
            .await?;

        if self.config.delete_empty_folders {
            if let Some(parent) = parent_directory(path) {
                let removed = PathPruner::new(lease.client(), &self.retry)
                    .prune_if_empty(&parent)
                    .await?;
                debug!(path, removed, "deleted remote file");
            }
        }
        Ok(())
    }

    /// Files below `prefix` (recursively) whose name ends with `extension`.
    ///
    /// An empty extension matches every file. A missing prefix directory
    /// yields an empty list. Paths are `/`-joined and sorted.
    pub async fn list_files(&self, prefix: &str, extension: &str) -> Result<Vec<String>> {
        let lease = self.pool.acquire().await?;
        let mut files = Vec::new();
        let mut pending = vec![prefix.trim_end_matches(['/', '\\']).to_string()];
        if pending[0].is_empty() && prefix.starts_with(['/', '\\']) {
            pending[0] = "/".to_string();
        }

        while let Some(directory) = pending.pop() {
            let outcome = self
                .retry
                .execute(|| lease.list_entries(&directory))
                .await;
            let entries = match outcome {
                RetryOutcome::Success(entries) => entries,
                RetryOutcome::Exhausted { last_error, .. }
                    if last_error.kind == ProtocolErrorKind::NotFound =>
                {
                    continue
                }
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => {
                    return Err(StoreError::Remote {
                        operation: "list_entries",
                        path: directory,
                        attempts,
                        source: last_error,
                    })
                }
            };

            for entry in entries.into_iter().filter(|entry| !entry.is_pseudo()) {
                let full = join(&directory, &entry.name);
                if entry.is_directory {
                    pending.push(full);
                } else if entry.name.ends_with(extension) {
                    files.push(full);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Streams the file at `path` into `writer`. Returns the byte count.
    pub async fn read_to<W>(&self, path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let data = self.read_all(path).await?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(data.len() as u64)
    }

    /// Uploads everything `reader` yields to `path`. Returns the byte count.
    ///
    /// The input is buffered so a retried upload can replay it.
    pub async fn write_from<R>(&self, path: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        let len = buffer.len() as u64;
        self.write_all(path, buffer).await?;
        Ok(len)
    }
}
