//! Connection pool module for leased SFTP/FTP sessions, one pool per remote host.
//!
//! A pool hands out at most `capacity` sessions (leased plus idle). Returned
//! sessions wait in a FIFO idle queue and are reused by later acquirers. A
//! background reclaimer per pool disconnects idle sessions that outlived the
//! linger threshold and trims the queue after the capacity was lowered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, ProtocolClient};
use crate::config::{Endpoint, PoolConfig};
use crate::error::{Result, StoreError};
use crate::lease::ConnectionLease;

/// Statistics about a connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Effective capacity; `usize::MAX` when unlimited.
    pub capacity: usize,
    /// Sessions currently leased.
    pub leased: usize,
    /// Sessions waiting in the idle queue.
    pub idle: usize,
    /// Sessions connected by this pool.
    pub created: u64,
    /// Acquisitions served from the idle queue.
    pub reused: u64,
    /// Idle sessions dropped for lingering or for having lost their connection.
    pub evicted_idle: u64,
    /// Idle sessions dropped because the capacity shrank.
    pub evicted_capacity: u64,
    /// Acquisitions that gave up waiting.
    pub timeouts: u64,
}

/// A session together with the id its pool assigned when creating it.
pub(crate) struct PooledSession {
    pub(crate) id: u64,
    pub(crate) client: Box<dyn ProtocolClient>,
}

/// An idle session with the time it was returned.
struct IdleSession {
    session: PooledSession,
    since: Instant,
}

/// Mutable pool bookkeeping, guarded by the pool's own lock.
struct PoolState {
    capacity: usize,
    leased: usize,
    idle: VecDeque<IdleSession>,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted_idle: AtomicU64,
    evicted_capacity: AtomicU64,
    timeouts: AtomicU64,
}

/// What a single pass over the pool state produced for an acquirer.
enum Reservation {
    Idle(PooledSession),
    NewSlot,
    Saturated,
}

/// Maps a requested capacity to the stored one; 0 means unlimited.
fn effective_capacity(requested: usize) -> usize {
    if requested == 0 {
        usize::MAX
    } else {
        requested
    }
}

/// Bounded pool of sessions to a single host.
pub struct ConnectionPool {
    endpoint: Endpoint,
    factory: Arc<dyn ClientFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
    counters: PoolCounters,
    next_session_id: AtomicU64,
}

impl ConnectionPool {
    fn new(
        endpoint: Endpoint,
        capacity: usize,
        factory: Arc<dyn ClientFactory>,
        config: PoolConfig,
    ) -> Self {
        Self {
            endpoint,
            factory,
            config,
            state: Mutex::new(PoolState {
                capacity: effective_capacity(capacity),
                leased: 0,
                idle: VecDeque::new(),
                closed: false,
            }),
            released: Notify::new(),
            counters: PoolCounters::default(),
            next_session_id: AtomicU64::new(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Endpoint the pool was first registered with.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Effective capacity; `usize::MAX` when unlimited.
    pub fn capacity(&self) -> usize {
        self.lock_state().capacity
    }

    /// Lowers the capacity to `requested` if that is smaller. Zero is ignored.
    ///
    /// Never raises the capacity. Excess idle sessions are trimmed by the
    /// reclaimer on its next tick rather than here.
    pub fn ratchet_capacity(&self, requested: usize) {
        if requested == 0 {
            return;
        }
        let mut state = self.lock_state();
        if requested < state.capacity {
            debug!(
                host = %self.endpoint.host,
                from = state.capacity,
                to = requested,
                "lowering pool capacity"
            );
            state.capacity = requested;
        }
    }

    /// Gets a snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            capacity: state.capacity,
            leased: state.leased,
            idle: state.idle.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            evicted_idle: self.counters.evicted_idle.load(Ordering::Relaxed),
            evicted_capacity: self.counters.evicted_capacity.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Leases a session, reusing an idle one when possible.
    ///
    /// Waits while the pool is saturated, waking on every release and at
    /// least every `poll_interval`. Fails with [`StoreError::PoolTimeout`]
    /// once `acquire_timeout` has elapsed, and with [`StoreError::Connect`]
    /// if a new session cannot be established.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConnectionLease> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;

        loop {
            // Registered before inspecting the state so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.reserve()? {
                Reservation::Idle(session) => {
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    debug!(host = %self.endpoint.host, id = session.id, "reusing idle connection");
                    return Ok(ConnectionLease::new(Arc::clone(self), session));
                }
                Reservation::NewSlot => return self.connect_new().await,
                Reservation::Saturated => {}
            }

            let now = Instant::now();
            if now >= deadline {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let waited_ms = now.duration_since(started).as_millis() as u64;
                warn!(host = %self.endpoint.host, waited_ms, "connection pool saturated");
                return Err(StoreError::PoolTimeout {
                    host: self.endpoint.host.clone(),
                    waited_ms,
                });
            }
            let wait = (deadline - now).min(self.config.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// One pass over the state: take an idle session, claim a new slot, or report saturation.
    fn reserve(&self) -> Result<Reservation> {
        let mut stale = Vec::new();
        let reservation = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(StoreError::Shutdown {
                    host: self.endpoint.host.clone(),
                });
            }

            let mut reservation = Reservation::Saturated;
            while state.leased < state.capacity {
                match state.idle.pop_front() {
                    Some(entry) if entry.session.client.is_connected() => {
                        state.leased += 1;
                        reservation = Reservation::Idle(entry.session);
                        break;
                    }
                    Some(entry) => stale.push(entry.session),
                    None => {
                        if state.leased + state.idle.len() < state.capacity {
                            state.leased += 1;
                            reservation = Reservation::NewSlot;
                        }
                        break;
                    }
                }
            }
            reservation
        };

        if !stale.is_empty() {
            self.counters
                .evicted_idle
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            debug!(
                host = %self.endpoint.host,
                count = stale.len(),
                "dropped disconnected idle connections"
            );
        }
        Ok(reservation)
    }

    /// Connects a session into an already reserved slot.
    ///
    /// The session is held by a connecting lease while `connect` runs, so an
    /// acquirer cancelled mid-connect discards it and frees the slot.
    async fn connect_new(self: &Arc<Self>) -> Result<ConnectionLease> {
        let session = PooledSession {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            client: self.factory.create(&self.endpoint),
        };
        let mut lease = ConnectionLease::connecting(Arc::clone(self), session);

        let connected = lease.client().connect().await;
        match connected {
            Ok(()) => {
                lease.mark_connected();
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(host = %self.endpoint.host, id = lease.connection_id(), "opened new connection");
                Ok(lease)
            }
            Err(source) => {
                warn!(host = %self.endpoint.host, error = %source, "connect failed");
                lease.discard();
                Err(StoreError::Connect {
                    host: self.endpoint.host.clone(),
                    source,
                })
            }
        }
    }

    /// Returns a session to the idle queue. Called by the lease; never fails.
    pub(crate) fn release(&self, session: PooledSession) {
        let rejected = {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
            if state.closed {
                Some(session)
            } else {
                state.idle.push_back(IdleSession {
                    session,
                    since: Instant::now(),
                });
                None
            }
        };
        self.released.notify_waiters();
        if let Some(session) = rejected {
            if session.client.is_connected() {
                disconnect_detached(session.client);
            }
        }
    }

    /// Frees the slot of a session that must not be reused and disconnects it.
    ///
    /// The disconnect is unconditional: a session whose connect was abandoned
    /// may hold resources without reporting itself connected.
    pub(crate) fn discard(&self, session: PooledSession) {
        {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
        }
        self.released.notify_waiters();
        disconnect_detached(session.client);
    }

    /// Runs both reclaimer passes once and disconnects what they removed.
    ///
    /// First trims the oldest idle sessions while `leased + idle` exceeds the
    /// capacity, then drops idle sessions older than the linger threshold.
    /// Leased sessions are never touched.
    pub async fn reclaim(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = self.lock_state();
            while state.leased + state.idle.len() > state.capacity {
                match state.idle.pop_front() {
                    Some(entry) => {
                        self.counters.evicted_capacity.fetch_add(1, Ordering::Relaxed);
                        evicted.push(entry.session.client);
                    }
                    None => break,
                }
            }
            while state
                .idle
                .front()
                .is_some_and(|entry| entry.since.elapsed() > self.config.linger)
            {
                if let Some(entry) = state.idle.pop_front() {
                    self.counters.evicted_idle.fetch_add(1, Ordering::Relaxed);
                    evicted.push(entry.session.client);
                }
            }
        }

        if evicted.is_empty() {
            return;
        }
        debug!(host = %self.endpoint.host, count = evicted.len(), "reclaiming idle connections");
        for client in evicted {
            if client.is_connected() {
                client.disconnect().await;
            }
        }
        self.released.notify_waiters();
    }

    /// Marks the pool closed and disconnects every idle session.
    async fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.lock_state();
            state.closed = true;
            state.idle.drain(..).map(|entry| entry.session.client).collect()
        };
        self.released.notify_waiters();
        for client in drained {
            if client.is_connected() {
                client.disconnect().await;
            }
        }
    }
}

/// Disconnects a session that is no longer tracked by any pool.
fn disconnect_detached(client: Box<dyn ProtocolClient>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { client.disconnect().await });
        }
        Err(_) => warn!("no runtime available, dropping connection without disconnect"),
    }
}

async fn run_reclaimer(
    pool: Weak<ConnectionPool>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            // Only `true` is ever sent; a dropped sender means the registry is gone.
            _ = shutdown.changed() => break,
        }
        let Some(pool) = pool.upgrade() else { break };
        pool.reclaim().await;
    }
    debug!("reclaimer stopped");
}

/// Registry of connection pools keyed by host.
///
/// The registry owns the reclaimer tasks of its pools: they stop when
/// [`PoolRegistry::shutdown`] is called or the registry is dropped.
pub struct PoolRegistry {
    factory: Arc<dyn ClientFactory>,
    config: PoolConfig,
    pools: DashMap<String, Arc<ConnectionPool>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolRegistry {
    /// Creates an empty registry whose pools build sessions with `factory`.
    pub fn new(factory: Arc<dyn ClientFactory>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            factory,
            config,
            pools: DashMap::new(),
            shutdown_tx,
        })
    }

    /// Returns the pool for `endpoint.host`, creating it on first use.
    ///
    /// The first registration fixes the endpoint and starts the pool's
    /// reclaimer. Later calls only lower the capacity (see
    /// [`ConnectionPool::ratchet_capacity`]). Creating a pool needs a tokio
    /// runtime for its reclaimer and fails with [`StoreError::NoRuntime`]
    /// outside one.
    pub fn get_or_create(
        &self,
        endpoint: &Endpoint,
        requested_capacity: usize,
    ) -> Result<Arc<ConnectionPool>> {
        if *self.shutdown_tx.borrow() {
            return Err(StoreError::Shutdown {
                host: endpoint.host.clone(),
            });
        }

        match self.pools.entry(endpoint.host.clone()) {
            Entry::Occupied(entry) => {
                let pool = entry.get();
                pool.ratchet_capacity(requested_capacity);
                Ok(Arc::clone(pool))
            }
            Entry::Vacant(entry) => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    StoreError::NoRuntime {
                        host: endpoint.host.clone(),
                    }
                })?;
                let pool = Arc::new(ConnectionPool::new(
                    endpoint.clone(),
                    requested_capacity,
                    Arc::clone(&self.factory),
                    self.config.clone(),
                ));
                runtime.spawn(run_reclaimer(
                    Arc::downgrade(&pool),
                    self.config.reclaim_interval,
                    self.shutdown_tx.subscribe(),
                ));
                info!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    capacity = requested_capacity,
                    "created connection pool"
                );
                entry.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    /// Looks up an existing pool.
    pub fn get(&self, host: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(host).map(|pool| Arc::clone(pool.value()))
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// True if no pool has been created yet.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Stops every reclaimer, closes every pool and disconnects idle sessions.
    ///
    /// Leases still outstanding are disconnected when they are released.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let pools: Vec<_> = self
            .pools
            .iter()
            .map(|pool| Arc::clone(pool.value()))
            .collect();
        for pool in &pools {
            pool.close().await;
        }
        info!(pools = pools.len(), "connection pool registry shut down");
    }
}
