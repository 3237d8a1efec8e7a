//! Remote directory materialization and pruning.
//!
//! Both walks tolerate other clients creating or removing the same
//! directories concurrently: the races they can lose are recognized by the
//! protocol error kind and treated as the outcome they were racing for.

use tracing::debug;

use crate::client::ProtocolClient;
use crate::error::{ProtocolErrorKind, Result, StoreError};
use crate::retry::{RetryExecutor, RetryOutcome};

/// Splits a path on `/` and `\`, dropping empty segments.
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Cumulative prefixes of `path`, shortest first: `a/b/c` gives `a`, `a/b`, `a/b/c`.
///
/// A leading separator is kept so absolute paths stay absolute.
pub fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefix = String::new();
    if path.starts_with(['/', '\\']) {
        prefix.push('/');
    }
    let root_len = prefix.len();

    split_segments(path)
        .into_iter()
        .map(|segment| {
            if prefix.len() > root_len {
                prefix.push('/');
            }
            prefix.push_str(segment);
            prefix.clone()
        })
        .collect()
}

/// Directory containing `path`, or `None` when the file sits at the root.
pub fn parent_directory(path: &str) -> Option<String> {
    let mut prefixes = path_prefixes(path);
    prefixes.pop();
    prefixes.pop()
}

/// Joins a directory and an entry name with `/`.
pub fn join(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    }
}

fn remote_error(
    operation: &'static str,
    path: &str,
    attempts: u32,
    source: crate::error::ProtocolError,
) -> StoreError {
    StoreError::Remote {
        operation,
        path: path.to_string(),
        attempts,
        source,
    }
}

/// Creates every missing directory along a path.
pub struct PathMaterializer<'a> {
    client: &'a dyn ProtocolClient,
    retry: &'a RetryExecutor,
}

impl<'a> PathMaterializer<'a> {
    /// Materializer issuing calls on `client`, each under `retry`.
    pub fn new(client: &'a dyn ProtocolClient, retry: &'a RetryExecutor) -> Self {
        Self { client, retry }
    }

    /// Ensures `path` and all of its ancestors exist as directories.
    ///
    /// A create that fails because another client created the directory in
    /// the meantime counts as success.
    pub async fn ensure_directory(&self, path: &str) -> Result<()> {
        for prefix in path_prefixes(path) {
            let exists = self
                .retry
                .run("exists", &prefix, || self.client.exists(&prefix))
                .await?;
            if exists {
                continue;
            }

            match self
                .retry
                .execute(|| self.client.create_directory(&prefix))
                .await
            {
                RetryOutcome::Success(()) => debug!(path = %prefix, "created remote directory"),
                RetryOutcome::Exhausted { last_error, .. }
                    if last_error.kind == ProtocolErrorKind::AlreadyExists =>
                {
                    debug!(path = %prefix, "remote directory created concurrently");
                }
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => return Err(remote_error("create_directory", &prefix, attempts, last_error)),
            }
        }
        Ok(())
    }
}

/// Removes directories left empty, walking from a leaf toward the root.
pub struct PathPruner<'a> {
    client: &'a dyn ProtocolClient,
    retry: &'a RetryExecutor,
}

impl<'a> PathPruner<'a> {
    /// Pruner issuing calls on `client`, each under `retry`.
    pub fn new(client: &'a dyn ProtocolClient, retry: &'a RetryExecutor) -> Self {
        Self { client, retry }
    }

    /// Deletes `directory` and each ancestor that has no entries left.
    ///
    /// Every level is checked on its own, so a non-empty level simply stays
    /// and the walk moves on to its parent. Returns how many directories were
    /// removed.
    pub async fn prune_if_empty(&self, directory: &str) -> Result<usize> {
        let mut removed = 0;

        for level in path_prefixes(directory).iter().rev() {
            match self.retry.execute(|| self.client.exists(level)).await {
                RetryOutcome::Success(true) => {}
                RetryOutcome::Success(false) => continue,
                RetryOutcome::Exhausted { last_error, .. } if is_gone(last_error.kind) => continue,
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => return Err(remote_error("exists", level, attempts, last_error)),
            }

            let entries = match self.retry.execute(|| self.client.list_entries(level)).await {
                RetryOutcome::Success(entries) => entries,
                RetryOutcome::Exhausted { last_error, .. } if is_gone(last_error.kind) => continue,
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => return Err(remote_error("list_entries", level, attempts, last_error)),
            };
            if entries.iter().any(|entry| !entry.is_pseudo()) {
                continue;
            }

            match self
                .retry
                .execute(|| self.client.delete_directory(level))
                .await
            {
                RetryOutcome::Success(()) => {
                    removed += 1;
                    debug!(path = %level, "pruned empty remote directory");
                }
                RetryOutcome::Exhausted { last_error, .. }
                    if matches!(
                        last_error.kind,
                        ProtocolErrorKind::NotFound | ProtocolErrorKind::NotEmpty
                    ) =>
                {
                    debug!(path = %level, error = %last_error, "directory changed while pruning");
                }
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => return Err(remote_error("delete_directory", level, attempts, last_error)),
            }
        }

        Ok(removed)
    }
}

/// Errors meaning "nothing to prune here" during the upward walk.
fn is_gone(kind: ProtocolErrorKind) -> bool {
    matches!(
        kind,
        ProtocolErrorKind::NotFound | ProtocolErrorKind::PermissionDenied
    )
}
