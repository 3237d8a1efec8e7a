//! Protocol client boundary.
//!
//! This module defines the capabilities the pool and the path utilities need
//! from an SFTP or FTP session. Concrete sessions live behind these traits so
//! the pool never depends on a particular wire library.

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Endpoint;
use crate::error::ProtocolError;

/// Result of a single protocol call.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Entry name, without the directory prefix.
    pub name: String,
    /// True for directories.
    pub is_directory: bool,
}

impl RemoteEntry {
    /// A file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
        }
    }

    /// A directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
        }
    }

    /// True for the `.` and `..` entries some servers include in listings.
    pub fn is_pseudo(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// A stateful, authenticated session with a remote file server.
///
/// Implementations classify every failure into a [`ProtocolError`] so that
/// retry decisions are made in one place. A session is only ever used by the
/// lease holder that borrowed it.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open and authenticate the session.
    async fn connect(&self) -> ProtocolResult<()>;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;

    /// Close the session. Never fails; errors are the implementation's to log.
    async fn disconnect(&self);

    /// Whether `path` exists (file or directory).
    async fn exists(&self, path: &str) -> ProtocolResult<bool>;

    /// Entries of the directory at `path`.
    async fn list_entries(&self, path: &str) -> ProtocolResult<Vec<RemoteEntry>>;

    /// Write `data` to the file at `path`, replacing it.
    async fn upload(&self, path: &str, data: Bytes) -> ProtocolResult<()>;

    /// Read the whole file at `path`.
    async fn download(&self, path: &str) -> ProtocolResult<Bytes>;

    /// Remove the file at `path`.
    async fn delete_file(&self, path: &str) -> ProtocolResult<()>;

    /// Create a single directory level.
    async fn create_directory(&self, path: &str) -> ProtocolResult<()>;

    /// Remove an empty directory.
    async fn delete_directory(&self, path: &str) -> ProtocolResult<()>;
}

/// Builds unconnected sessions for an endpoint; the pool calls `connect`.
pub trait ClientFactory: Send + Sync + 'static {
    /// Create a new, not yet connected session.
    fn create(&self, endpoint: &Endpoint) -> Box<dyn ProtocolClient>;
}
