//! In-process simulation of a remote file server.
//!
//! This module provides a software stand-in for an SFTP/FTP server so the
//! pool, the path utilities and the store can be exercised without a network.
//! All sessions created from one [`MemoryRemote`] share a single directory
//! tree. Faults can be scripted per operation and an artificial latency makes
//! concurrent callers interleave the way they would against a real server.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::{ClientFactory, ProtocolClient, ProtocolResult, RemoteEntry};
use crate::config::Endpoint;
use crate::error::{ProtocolError, ProtocolErrorKind};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Operations of the simulated server, used to script faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// Session login.
    Connect,
    /// Existence check.
    Exists,
    /// Directory listing.
    List,
    /// File upload.
    Upload,
    /// File download.
    Download,
    /// File removal.
    DeleteFile,
    /// Directory creation.
    CreateDirectory,
    /// Directory removal.
    DeleteDirectory,
}

#[derive(Debug, Clone)]
enum Node {
    File(Bytes),
    Directory,
}

#[derive(Default)]
struct RemoteInner {
    tree: Mutex<BTreeMap<String, Node>>,
    faults: Mutex<HashMap<RemoteOp, VecDeque<ProtocolError>>>,
    calls: Mutex<HashMap<RemoteOp, u64>>,
    sessions: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    mkdir_races: AtomicU64,
    reject_logins: AtomicBool,
    latency: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Normalizes a path to `/`-joined segments; the root is the empty string.
fn normalize(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
}

fn not_found(path: &str) -> ProtocolError {
    ProtocolError::new(ProtocolErrorKind::NotFound, format!("No such file: {path}"))
}

/// A simulated remote server shared by all sessions it creates.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<RemoteInner>,
}

impl MemoryRemote {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation sleep for `latency` before acting.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.inner.latency) = latency;
    }

    /// Makes logins fail with a permission error.
    pub fn reject_logins(&self, reject: bool) {
        self.inner.reject_logins.store(reject, Ordering::SeqCst);
    }

    /// Queues `error` to be returned by the next call of `op`.
    pub fn inject_fault(&self, op: RemoteOp, error: ProtocolError) {
        lock(&self.inner.faults).entry(op).or_default().push_back(error);
    }

    /// Queues `count` copies of a transient failure for `op`.
    pub fn inject_transient(&self, op: RemoteOp, count: usize) {
        for _ in 0..count {
            self.inject_fault(
                op,
                ProtocolError::new(ProtocolErrorKind::Unavailable, "421 Service not available"),
            );
        }
    }

    /// The next `create_directory` call creates the directory and then reports
    /// that it already existed, as if another client won the race.
    pub fn race_next_create_directory(&self) {
        self.inner.mkdir_races.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of calls made for `op`, including failed ones.
    pub fn calls(&self, op: RemoteOp) -> u64 {
        lock(&self.inner.calls).get(&op).copied().unwrap_or(0)
    }

    /// Number of sessions currently connected.
    pub fn live_connections(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Severs every session, as a server restart would.
    pub fn drop_all_connections(&self) {
        for (_, connected) in lock(&self.inner.sessions).drain() {
            connected.store(false, Ordering::SeqCst);
        }
    }

    /// Creates a directory and its ancestors directly.
    pub fn create_dir_all(&self, path: &str) {
        let path = normalize(path);
        let mut tree = lock(&self.inner.tree);
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            tree.entry(prefix.clone()).or_insert(Node::Directory);
        }
    }

    /// Writes a file directly, creating its ancestors.
    pub fn put_file(&self, path: &str, data: impl Into<Bytes>) {
        let path = normalize(path);
        self.create_dir_all(parent_of(&path));
        lock(&self.inner.tree).insert(path, Node::File(data.into()));
    }

    /// Whether a file or directory exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        let path = normalize(path);
        path.is_empty() || lock(&self.inner.tree).contains_key(&path)
    }

    /// Whether a directory exists at `path`.
    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize(path);
        path.is_empty() || matches!(lock(&self.inner.tree).get(&path), Some(Node::Directory))
    }

    /// Contents of the file at `path`.
    pub fn file(&self, path: &str) -> Option<Bytes> {
        match lock(&self.inner.tree).get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Every path in the tree, sorted.
    pub fn paths(&self) -> Vec<String> {
        lock(&self.inner.tree).keys().cloned().collect()
    }
}

impl ClientFactory for MemoryRemote {
    fn create(&self, _endpoint: &Endpoint) -> Box<dyn ProtocolClient> {
        Box::new(MemorySession {
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            remote: Arc::clone(&self.inner),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// One session against a [`MemoryRemote`].
pub struct MemorySession {
    id: u64,
    remote: Arc<RemoteInner>,
    connected: Arc<AtomicBool>,
}

impl MemorySession {
    /// Counts the call, applies latency, checks the session and pops a scripted fault.
    async fn begin(&self, op: RemoteOp) -> ProtocolResult<()> {
        *lock(&self.remote.calls).entry(op).or_default() += 1;

        let latency = *lock(&self.remote.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if op != RemoteOp::Connect && !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::new(
                ProtocolErrorKind::ConnectionLost,
                "not connected",
            ));
        }
        if let Some(fault) = lock(&self.remote.faults)
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            return Err(fault);
        }
        Ok(())
    }

    fn tree(&self) -> MutexGuard<'_, BTreeMap<String, Node>> {
        lock(&self.remote.tree)
    }
}

fn is_dir(tree: &BTreeMap<String, Node>, path: &str) -> bool {
    path.is_empty() || matches!(tree.get(path), Some(Node::Directory))
}

#[async_trait]
impl ProtocolClient for MemorySession {
    async fn connect(&self) -> ProtocolResult<()> {
        self.begin(RemoteOp::Connect).await?;
        if self.remote.reject_logins.load(Ordering::SeqCst) {
            return Err(ProtocolError::new(
                ProtocolErrorKind::PermissionDenied,
                "530 Login incorrect",
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        lock(&self.remote.sessions).insert(self.id, Arc::clone(&self.connected));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.remote.sessions).remove(&self.id);
    }

    async fn exists(&self, path: &str) -> ProtocolResult<bool> {
        self.begin(RemoteOp::Exists).await?;
        let path = normalize(path);
        Ok(path.is_empty() || self.tree().contains_key(&path))
    }

    async fn list_entries(&self, path: &str) -> ProtocolResult<Vec<RemoteEntry>> {
        self.begin(RemoteOp::List).await?;
        let dir = normalize(path);
        let tree = self.tree();
        if !is_dir(&tree, &dir) {
            return Err(not_found(&dir));
        }

        let mut entries = vec![RemoteEntry::directory("."), RemoteEntry::directory("..")];
        for (child, node) in tree.iter() {
            if child.is_empty() || parent_of(child) != dir {
                continue;
            }
            let name = child.rsplit('/').next().unwrap_or(child);
            entries.push(match node {
                Node::Directory => RemoteEntry::directory(name),
                Node::File(_) => RemoteEntry::file(name),
            });
        }
        Ok(entries)
    }

    async fn upload(&self, path: &str, data: Bytes) -> ProtocolResult<()> {
        self.begin(RemoteOp::Upload).await?;
        let path = normalize(path);
        let mut tree = self.tree();
        if !is_dir(&tree, parent_of(&path)) {
            return Err(not_found(parent_of(&path)));
        }
        if is_dir(&tree, &path) {
            return Err(ProtocolError::new(
                ProtocolErrorKind::Other,
                format!("{path} is a directory"),
            ));
        }
        tree.insert(path, Node::File(data));
        Ok(())
    }

    async fn download(&self, path: &str) -> ProtocolResult<Bytes> {
        self.begin(RemoteOp::Download).await?;
        let path = normalize(path);
        match self.tree().get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            _ => Err(not_found(&path)),
        }
    }

    async fn delete_file(&self, path: &str) -> ProtocolResult<()> {
        self.begin(RemoteOp::DeleteFile).await?;
        let path = normalize(path);
        let mut tree = self.tree();
        match tree.get(&path) {
            Some(Node::File(_)) => {
                tree.remove(&path);
                Ok(())
            }
            _ => Err(not_found(&path)),
        }
    }

    async fn create_directory(&self, path: &str) -> ProtocolResult<()> {
        self.begin(RemoteOp::CreateDirectory).await?;
        let path = normalize(path);
        let mut tree = self.tree();
        if !is_dir(&tree, parent_of(&path)) {
            return Err(not_found(parent_of(&path)));
        }
        let raced = self
            .remote
            .mkdir_races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            tree.insert(path.clone(), Node::Directory);
        }
        if path.is_empty() || tree.contains_key(&path) {
            return Err(ProtocolError::new(
                ProtocolErrorKind::AlreadyExists,
                format!("Cannot create directory {path}: already exists"),
            ));
        }
        tree.insert(path, Node::Directory);
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> ProtocolResult<()> {
        self.begin(RemoteOp::DeleteDirectory).await?;
        let path = normalize(path);
        let mut tree = self.tree();
        if path.is_empty() || !is_dir(&tree, &path) {
            return Err(not_found(&path));
        }
        let prefix = format!("{path}/");
        if tree.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)) {
            return Err(ProtocolError::new(
                ProtocolErrorKind::NotEmpty,
                format!("Directory not empty: {path}"),
            ));
        }
        tree.remove(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn session(remote: &MemoryRemote) -> Box<dyn ProtocolClient> {
        remote.create(&Endpoint::new(Protocol::Sftp, "mem", "u", "p"))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a//b\\c/"), "a/b/c");
        assert_eq!(normalize("/"), "");
        assert_eq!(parent_of("a/b/c"), "a/b");
        assert_eq!(parent_of("a"), "");
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let remote = MemoryRemote::new();
        let client = session(&remote);
        let err = client.exists("a").await.unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::ConnectionLost);

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(remote.live_connections(), 1);

        client.disconnect().await;
        assert_eq!(remote.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_directory_semantics() {
        let remote = MemoryRemote::new();
        let client = session(&remote);
        client.connect().await.unwrap();

        assert_eq!(
            client.create_directory("a/b").await.unwrap_err().kind,
            ProtocolErrorKind::NotFound
        );
        client.create_directory("a").await.unwrap();
        client.create_directory("a/b").await.unwrap();
        assert_eq!(
            client.create_directory("a").await.unwrap_err().kind,
            ProtocolErrorKind::AlreadyExists
        );

        client.upload("a/b/f.txt", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(
            client.delete_directory("a/b").await.unwrap_err().kind,
            ProtocolErrorKind::NotEmpty
        );

        let names: Vec<_> = client
            .list_entries("a/b")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| !e.is_pseudo())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["f.txt"]);

        client.delete_file("a/b/f.txt").await.unwrap();
        client.delete_directory("a/b").await.unwrap();
        assert!(!remote.contains("a/b"));
        assert!(remote.is_dir("a"));
    }

    #[tokio::test]
    async fn test_sibling_prefix_is_not_a_child() {
        let remote = MemoryRemote::new();
        remote.create_dir_all("a/b");
        remote.put_file("a/b2/f", "x");
        let client = session(&remote);
        client.connect().await.unwrap();

        client.delete_directory("a/b").await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let remote = MemoryRemote::new();
        let client = session(&remote);
        client.connect().await.unwrap();

        remote.inject_transient(RemoteOp::Download, 1);
        remote.put_file("f", "data");
        assert!(client.download("f").await.unwrap_err().is_retryable());
        assert_eq!(client.download("f").await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(remote.calls(RemoteOp::Download), 2);

        remote.race_next_create_directory();
        let err = client.create_directory("raced").await.unwrap_err();
        assert_eq!(err.kind, ProtocolErrorKind::AlreadyExists);
        assert!(remote.is_dir("raced"));
    }
}
