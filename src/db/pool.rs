//! Connection pool management.
//!
//! The pool hands out physical connections keyed by an opaque session key.
//! A key maps to at most one checked-out connection; returned connections go
//! to a bounded free list. All bookkeeping sits behind one mutex that is
//! never held across backend I/O: connects and closes happen outside it,
//! with a slot reserved while a connect is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PoolOptions;
use crate::db::classify::classify;
use crate::db::connection::{Connection, ConnectionHandle};
use crate::db::driver::Driver;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;

type Handle<D> = ConnectionHandle<<D as Driver>::Connection>;

struct PoolState<D: Driver> {
    idle: Vec<Handle<D>>,
    checked_out: HashMap<String, Handle<D>>,
    /// Connects in flight; they count against `max_total`.
    pending: usize,
    closed: bool,
}

impl<D: Driver> PoolState<D> {
    fn live(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.pending
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub pending: usize,
    pub closed: bool,
}

impl PoolStats {
    pub fn live(&self) -> usize {
        self.idle + self.checked_out + self.pending
    }
}

pub struct ConnectionPool<D: Driver> {
    driver: D,
    options: PoolOptions,
    state: Mutex<PoolState<D>>,
    next_id: AtomicU64,
}

impl<D: Driver> ConnectionPool<D> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(driver: D, options: PoolOptions) -> DbResult<Self> {
        options.validate().map_err(DbError::configuration)?;
        info!(
            db_type = %driver.database_type(),
            min_idle = options.min_idle_or_default(),
            max_total = options.max_total_or_default(),
            "Created connection pool"
        );
        Ok(Self {
            driver,
            options,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                checked_out: HashMap::new(),
                pending: 0,
                closed: false,
            }),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn database_type(&self) -> DatabaseType {
        self.driver.database_type()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Check out the connection for `key`.
    ///
    /// Returns the connection already held under `key` if there is one,
    /// otherwise an idle connection, otherwise a new one.
    pub async fn get(&self, key: &str) -> DbResult<Handle<D>> {
        let max_total = self.options.max_total_or_default();
        let recycled = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            if let Some(handle) = state.checked_out.get(key) {
                return Ok(handle.clone());
            }
            match state.idle.pop() {
                Some(handle) => {
                    state.checked_out.insert(key.to_string(), handle.clone());
                    Some(handle)
                }
                None => {
                    if state.live() >= max_total as usize {
                        return Err(DbError::pool_exhausted(max_total));
                    }
                    state.pending += 1;
                    None
                }
            }
        };

        if let Some(handle) = recycled {
            let mut conn = handle.lock().await;
            conn.set_owner(Some(key.to_string()));
            debug!(key = %key, connection = conn.id(), "Reusing idle connection");
            drop(conn);
            return Ok(handle);
        }

        let connected = self.connect_with_retry().await;

        let mut state = self.state.lock().await;
        state.pending -= 1;
        let raw = connected?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = Connection::new(id, raw);
        conn.set_owner(Some(key.to_string()));
        let handle: Handle<D> = Arc::new(Mutex::new(conn));

        if state.closed {
            drop(state);
            handle.lock().await.close().await;
            return Err(DbError::PoolClosed);
        }

        // Another caller registered the key while we were connecting.
        if let Some(existing) = state.checked_out.get(key).cloned() {
            let keep = state.idle.len() < self.options.min_idle_or_default();
            if keep {
                state.idle.push(handle.clone());
            }
            drop(state);
            let mut conn = handle.lock().await;
            conn.set_owner(None);
            if !keep {
                conn.close().await;
            }
            return Ok(existing);
        }

        state.checked_out.insert(key.to_string(), handle.clone());
        debug!(key = %key, connection = id, "Opened new connection");
        Ok(handle)
    }

    async fn connect_with_retry(&self) -> DbResult<D::Connection> {
        let retries = self.options.connect_retries_or_default();
        let mut attempt = 0u32;
        loop {
            match self.driver.connect().await {
                Ok(raw) => return Ok(raw),
                Err(e) => {
                    if !classify(&e).is_connection_level() {
                        return Err(e);
                    }
                    attempt += 1;
                    if attempt > retries {
                        return Err(DbError::server_unavailable(format!(
                            "could not connect after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    let delay = self.options.backoff_for(attempt);
                    warn!(
                        attempt,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Return a connection checked out under `key`.
    ///
    /// The key is always released. The connection goes back to the free list
    /// only if it is reusable, `close` is false, the pool is open and the free
    /// list is below `min_idle`; otherwise it is closed.
    ///
    /// The caller must not hold the connection's lock.
    pub async fn put(&self, handle: Handle<D>, key: &str, close: bool) {
        let (reusable, id) = {
            let conn = handle.lock().await;
            (conn.is_reusable(), conn.id())
        };

        let recycle = {
            let mut state = self.state.lock().await;
            if state
                .checked_out
                .get(key)
                .is_some_and(|held| Arc::ptr_eq(held, &handle))
            {
                state.checked_out.remove(key);
            }
            let already_idle = state.idle.iter().any(|h| Arc::ptr_eq(h, &handle));
            let recycle = !close
                && !state.closed
                && reusable
                && !already_idle
                && state.idle.len() < self.options.min_idle_or_default();
            if recycle {
                state.idle.push(handle.clone());
            }
            recycle || already_idle
        };

        let mut conn = handle.lock().await;
        if recycle {
            conn.set_owner(None);
            debug!(key = %key, connection = id, "Connection returned to pool");
        } else {
            debug!(key = %key, connection = id, close, reusable, "Closing returned connection");
            conn.close().await;
        }
    }

    /// Force-close connections.
    ///
    /// With a key, closes the connection checked out under it. Without one,
    /// closes every connection and marks the pool closed.
    pub async fn evict_all(&self, key: Option<&str>) {
        let victims: Vec<Handle<D>> = {
            let mut state = self.state.lock().await;
            match key {
                Some(key) => state.checked_out.remove(key).into_iter().collect(),
                None => {
                    state.closed = true;
                    let mut all: Vec<Handle<D>> = state.idle.drain(..).collect();
                    all.extend(state.checked_out.drain().map(|(_, h)| h));
                    all
                }
            }
        };

        if key.is_none() {
            info!(count = victims.len(), "Closing connection pool");
        }
        for handle in victims {
            let mut conn = handle.lock().await;
            conn.mark_broken();
            conn.close().await;
        }
    }

    /// Close every idle connection, leaving the pool open.
    pub async fn purge_idle(&self) {
        let idle: Vec<Handle<D>> = {
            let mut state = self.state.lock().await;
            state.idle.drain(..).collect()
        };
        if !idle.is_empty() {
            info!(count = idle.len(), "Purging idle connections");
        }
        for handle in idle {
            handle.lock().await.close().await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            pending: state.pending,
            closed: state.closed,
        }
    }

    /// Whether `handle` is currently checked out under `key`.
    pub async fn holds(&self, key: &str, handle: &Handle<D>) -> bool {
        let state = self.state.lock().await;
        state
            .checked_out
            .get(key)
            .is_some_and(|held| Arc::ptr_eq(held, handle))
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_type", &self.driver.database_type())
            .field("options", &self.options)
            .finish()
    }
}
