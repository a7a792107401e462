//! Provides a bounded, thread-safe connection pool.
//!
//! `ConnectionPool` hands out `Pooled` leases. A lease holds only a weak
//! reference back to its pool; dropping it (or passing it to
//! `ConnectionPool::put`) gives the capacity back, so a forgotten release on an
//! error path never leaks a slot.
mod reuse;
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    io::{self, Read, Write},
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
pub use reuse::{Reuse, ReuseConnector};
use serde::Deserialize;

use crate::connectors::Connector;

pub(crate) const DEFAULT_MAX_SIZE: usize = 10;

/// Block until a connection is available.
pub const WAIT_FOREVER: Option<Duration> = None;
/// Return immediately when the pool is exhausted.
pub const NEVER_WAIT: Option<Duration> = Some(Duration::ZERO);

pub trait Poolable {
    fn is_connected(&self) -> bool;

    /// Try to bring a disconnected connection back. Returning `false` makes
    /// the pool discard it.
    fn reconnect(&mut self) -> bool {
        false
    }

    /// Called before the connection is parked as idle.
    fn reset(&mut self) {}
}

type SharedPool<T> = Arc<PoolInner<T>>;
type WeakPool<T> = Weak<PoolInner<T>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    min_idle: usize,
    max_size: usize,
    #[serde(deserialize_with = "crate::secs::deserialize_opt")]
    idle_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Number of released connections kept for reuse.
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Upper bound of idle plus leased connections, at least 1.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Idle connections older than this are dropped instead of reused.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.min_idle = self.min_idle.min(self.max_size);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout: None,
        }
    }
}

/// A point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

// Partly borrow from hyper-util. All rights reserved.
pub struct Pooled<T: Poolable> {
    value: Option<T>,
    is_reused: bool,
    reusable: bool,
    pool: WeakPool<T>,
}

impl<T: Poolable> Pooled<T> {
    #[inline]
    pub(crate) fn new(value: T, is_reused: bool, pool: WeakPool<T>) -> Self {
        Self {
            value: Some(value),
            is_reused,
            reusable: true,
            pool,
        }
    }

    /// Whether this connection came from the idle list.
    #[inline]
    pub fn is_reused(&self) -> bool {
        self.is_reused
    }

    /// A non reusable connection is dropped on release instead of parked.
    #[inline]
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Give the connection back to its pool.
    #[inline]
    pub fn release(self) {
        drop(self)
    }

    /// Drop the connection after an unrecoverable failure, returning only
    /// its capacity to the pool.
    #[inline]
    pub fn discard(mut self) {
        self.reusable = false;
    }

    #[inline]
    fn as_ref(&self) -> &T {
        self.value.as_ref().expect("not dropped")
    }

    #[inline]
    fn as_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("not dropped")
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.as_mut()
    }
}

impl<T: Poolable + Read> Read for Pooled<T> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.as_mut().read(buf)
    }
}

impl<T: Poolable + Write> Write for Pooled<T> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.as_mut().write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.as_mut().flush()
    }
}

impl<T: Poolable + Debug> Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("value", &self.value)
            .field("is_reused", &self.is_reused)
            .finish()
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut value) = self.value.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        // A lost connection is still parked; `get` reconnects or replaces it.
        if self.reusable && pool.reserve_idle() {
            value.reset();
            pool.park(value);
        } else {
            drop(value);
            pool.release();
        }
    }
}

pub(crate) struct Idle<T> {
    pub(crate) conn: T,
    idle_at: Instant,
}

impl<T> Idle<T> {
    #[inline]
    pub(crate) fn new(conn: T) -> Self {
        Self {
            conn,
            idle_at: Instant::now(),
        }
    }

    #[inline]
    pub(crate) fn expired_opt(&self, max_elapsed: Option<Duration>) -> bool {
        match max_elapsed {
            Some(e) => self.idle_at.elapsed() > e,
            None => false,
        }
    }
}

struct PoolState<T> {
    idle: VecDeque<Idle<T>>,
    // Leased connections plus slots reserved for connections being built.
    in_use: usize,
    // Idle slots reserved for released connections still being reset.
    parking: usize,
}

pub(crate) struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
    config: PoolConfig,
}

impl<T> PoolInner<T> {
    fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.min_idle),
                in_use: 0,
                parking: 0,
            }),
            available: Condvar::new(),
            config,
        }
    }

    /// Reserve an idle slot for a connection on its way back, while below
    /// `min_idle`. The connection stays counted as in use until `park`.
    fn reserve_idle(&self) -> bool {
        let mut state = self.state.lock();
        if state.idle.len() + state.parking < self.config.min_idle {
            state.parking += 1;
            true
        } else {
            false
        }
    }

    /// Move a connection with a reserved slot from in use to idle.
    fn park(&self, conn: T) {
        let mut state = self.state.lock();
        state.parking -= 1;
        state.in_use = state.in_use.saturating_sub(1);
        state.idle.push_back(Idle::new(conn));
        drop(state);
        self.available.notify_one();
    }

    /// Return a leased slot without keeping its connection.
    fn release(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

pub struct ConnectionPool<C: Connector> {
    shared: SharedPool<C::Connection>,
    connector: Arc<C>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            connector: self.connector.clone(),
        }
    }
}

impl<C: Connector> ConnectionPool<C>
where
    C::Connection: Poolable,
{
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolInner::new(config.normalized())),
            connector: Arc::new(connector),
        }
    }

    #[inline]
    pub fn with_connector(connector: C) -> Self {
        Self::new(connector, PoolConfig::default())
    }

    #[inline]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire a connection.
    ///
    /// Idle connections are handed out first (oldest release first), after
    /// checking they are still connected or can reconnect. Otherwise a new
    /// connection is built while below `max_size`. When the pool is
    /// exhausted the call waits up to `timeout` (`WAIT_FOREVER` blocks,
    /// `NEVER_WAIT` returns at once) and yields `Ok(None)` if nothing became
    /// available. Errors come only from the connector.
    pub fn get(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<Pooled<C::Connection>>, C::Error> {
        // An overflowing timeout waits forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.shared.state.lock();

        loop {
            if let Some(idle) = state.idle.pop_front() {
                state.in_use += 1;
                if idle.expired_opt(self.shared.config.idle_timeout) {
                    state.in_use -= 1;
                    MutexGuard::unlocked(&mut state, || drop(idle));
                    #[cfg(feature = "logging")]
                    tracing::debug!("idle connection expired, dropped");
                    continue;
                }

                let mut conn = idle.conn;
                let ready =
                    MutexGuard::unlocked(&mut state, || conn.is_connected() || conn.reconnect());
                if ready {
                    drop(state);
                    #[cfg(feature = "logging")]
                    tracing::debug!("connection got from pool");
                    return Ok(Some(Pooled::new(
                        conn,
                        true,
                        Arc::downgrade(&self.shared),
                    )));
                }
                state.in_use -= 1;
                MutexGuard::unlocked(&mut state, || drop(conn));
                #[cfg(feature = "logging")]
                tracing::debug!("idle connection lost and reconnect failed, discarded");
                continue;
            }

            if state.in_use < self.shared.config.max_size {
                state.in_use += 1;
                drop(state);
                return match self.connector.connect() {
                    Ok(conn) => {
                        #[cfg(feature = "logging")]
                        tracing::debug!("linked new connection to the pool");
                        Ok(Some(Pooled::new(
                            conn,
                            false,
                            Arc::downgrade(&self.shared),
                        )))
                    }
                    Err(e) => {
                        self.shared.release();
                        Err(e)
                    }
                };
            }

            match deadline {
                None => self.shared.available.wait(&mut state),
                Some(deadline) if Instant::now() < deadline => {
                    // Waking up, timed out or not, always earns one more try.
                    let _ = self.shared.available.wait_until(&mut state, deadline);
                }
                Some(_) => return Ok(None),
            }
        }
    }

    /// `get(NEVER_WAIT)`.
    #[inline]
    pub fn try_get(&self) -> Result<Option<Pooled<C::Connection>>, C::Error> {
        self.get(NEVER_WAIT)
    }

    /// Release a connection. Equivalent to dropping the lease.
    #[inline]
    pub fn put(&self, conn: Pooled<C::Connection>) {
        conn.release()
    }

    /// Build connections until `min_idle` of them are idle or the pool is
    /// full. Returns how many were created.
    pub fn fill(&self) -> Result<usize, C::Error> {
        let mut created = 0;
        loop {
            {
                let mut state = self.shared.state.lock();
                let config = &self.shared.config;
                if state.idle.len() + state.parking >= config.min_idle
                    || state.idle.len() + state.in_use >= config.max_size
                {
                    return Ok(created);
                }
                state.in_use += 1;
            }

            let conn = match self.connector.connect() {
                Ok(conn) => conn,
                Err(e) => {
                    self.shared.release();
                    return Err(e);
                }
            };
            let mut state = self.shared.state.lock();
            state.in_use -= 1;
            state.idle.push_back(Idle::new(conn));
            drop(state);
            self.shared.available.notify_one();
            created += 1;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use,
            max_size: self.shared.config.max_size,
        }
    }

    /// Idle plus leased connections.
    #[inline]
    pub fn len(&self) -> usize {
        let status = self.status();
        status.idle + status.in_use
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `try_get` could succeed without waiting.
    #[inline]
    pub fn has_capacity(&self) -> bool {
        let status = self.status();
        status.idle > 0 || status.in_use < status.max_size
    }

    #[inline]
    pub fn get_idle_connection_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }
}

impl<C: Connector> Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ConnectionPool")
            .field("idle", &state.idle.len())
            .field("in_use", &state.in_use)
            .field("max_size", &self.shared.config.max_size)
            .finish()
    }
}
