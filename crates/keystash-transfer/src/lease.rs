//! Scoped, exclusive borrow of one pooled session.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::client::ProtocolClient;
use crate::pool::{ConnectionPool, PooledSession};

/// A session borrowed from a [`ConnectionPool`].
///
/// The session goes back to the pool's idle queue when the lease is released
/// or dropped, so every exit path of the borrowing operation returns it.
pub struct ConnectionLease {
    session: Option<PooledSession>,
    pool: Arc<ConnectionPool>,
    leased_at: Instant,
    connecting: bool,
}

impl ConnectionLease {
    pub(crate) fn new(pool: Arc<ConnectionPool>, session: PooledSession) -> Self {
        Self {
            session: Some(session),
            pool,
            leased_at: Instant::now(),
            connecting: false,
        }
    }

    /// A lease over a session whose `connect` has not completed yet.
    ///
    /// Dropping it before [`ConnectionLease::mark_connected`] discards the
    /// session instead of queueing it as idle.
    pub(crate) fn connecting(pool: Arc<ConnectionPool>, session: PooledSession) -> Self {
        Self {
            session: Some(session),
            pool,
            leased_at: Instant::now(),
            connecting: true,
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connecting = false;
    }

    fn session(&self) -> &PooledSession {
        // Only `release`, `discard` and `drop` take the session, and all of
        // them consume the lease.
        self.session
            .as_ref()
            .expect("lease used after its session was returned")
    }

    /// The borrowed session.
    pub fn client(&self) -> &(dyn ProtocolClient + 'static) {
        self.session().client.as_ref()
    }

    /// Pool-assigned identity of the borrowed session.
    ///
    /// Unique within the pool for the pool's lifetime; a session keeps its id
    /// across every lease of it.
    pub fn connection_id(&self) -> u64 {
        self.session().id
    }

    /// How long the session has been held.
    pub fn held_for(&self) -> Duration {
        self.leased_at.elapsed()
    }

    /// Host of the pool the session belongs to.
    pub fn host(&self) -> &str {
        &self.pool.endpoint().host
    }

    /// Returns the session to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Drops a session known to be broken instead of recycling it.
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            debug!(host = %self.pool.endpoint().host, id = session.id, "discarding leased connection");
            self.pool.discard(session);
        }
    }
}

impl Deref for ConnectionLease {
    type Target = dyn ProtocolClient;

    fn deref(&self) -> &Self::Target {
        self.client()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.connecting {
                self.pool.discard(session);
            } else {
                self.pool.release(session);
            }
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("host", &self.pool.endpoint().host)
            .field("id", &self.session.as_ref().map(|session| session.id))
            .field("held_for", &self.held_for())
            .finish()
    }
}
