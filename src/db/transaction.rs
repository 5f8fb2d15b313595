//! Transaction coordination.
//!
//! A [`TransactionCoordinator`] drives one logical transaction through
//! `Idle -> Active -> {Preparing -> Committed | RolledBack}` on behalf of an
//! external transaction manager, holding the transaction's connection and
//! its taint flag.
//!
//! Once tainted, a transaction refuses further queries and can only be
//! rolled back; [`TransactionCoordinator::abort`] is the only way to clear
//! the taint.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tracing::{debug, error, info, warn};

use crate::db::classify::{ErrorClass, classify, is_nothing_to_roll_back};
use crate::db::connection::ConnectionHandle;
use crate::db::driver::Driver;
use crate::db::initializer::ConnectionInitializer;
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::models::{SessionSettings, TransactionState};

/// Format marker of the transaction ids we generate.
pub const XID_FORMAT_ID: u32 = 1;

/// Two-phase transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xid {
    pub format_id: u32,
    /// Global transaction id (the session key).
    pub gtrid: String,
    /// Branch qualifier (the physical path).
    pub bqual: String,
}

impl Xid {
    pub fn new(gtrid: impl Into<String>, bqual: impl Into<String>) -> Self {
        Self {
            format_id: XID_FORMAT_ID,
            gtrid: gtrid.into(),
            bqual: bqual.into(),
        }
    }

    /// Backend transaction name: `<format>_<base64 gtrid>_<base64 bqual>`.
    pub fn gid(&self) -> String {
        format!(
            "{}_{}_{}",
            self.format_id,
            STANDARD.encode(self.gtrid.as_bytes()),
            STANDARD.encode(self.bqual.as_bytes())
        )
    }
}

type Handle<D> = ConnectionHandle<<D as Driver>::Connection>;

pub struct TransactionCoordinator<D: Driver> {
    pool: Arc<ConnectionPool<D>>,
    settings: SessionSettings,
    key: String,
    connection: Option<Handle<D>>,
    state: TransactionState,
    xid: Option<Xid>,
    /// Gid of a branch that went through phase one and is not resolved yet.
    prepared: Option<String>,
    tainted: bool,
    calls: u64,
    failures: u64,
}

impl<D: Driver> TransactionCoordinator<D> {
    pub fn new(pool: Arc<ConnectionPool<D>>, settings: SessionSettings, key: impl Into<String>) -> Self {
        Self {
            pool,
            settings,
            key: key.into(),
            connection: None,
            state: TransactionState::Idle,
            xid: None,
            prepared: None,
            tainted: false,
            calls: 0,
            failures: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D>> {
        &self.pool
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    pub fn prepared_gid(&self) -> Option<&str> {
        self.prepared.as_deref()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub(crate) fn record_call(&mut self) {
        self.calls += 1;
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub(crate) fn reset_failures(&mut self) {
        self.failures = 0;
    }

    /// The connection currently held by this transaction.
    pub(crate) fn connection(&self) -> DbResult<Handle<D>> {
        self.connection
            .clone()
            .ok_or_else(|| DbError::transaction("no connection checked out", self.key.clone()))
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Start the transaction. Idempotent while active.
    ///
    /// Checks out and initializes the connection; the backend `BEGIN` goes
    /// out lazily with the first statement.
    pub async fn begin(&mut self) -> DbResult<()> {
        if self.state.is_active() {
            return Ok(());
        }
        if self.tainted {
            return Err(DbError::tainted_transaction(self.key.clone()));
        }

        self.xid = self
            .settings
            .two_phase
            .then(|| Xid::new(self.key.clone(), self.settings.physical_path.clone()));
        self.prepared = None;

        if self.connection.is_none() {
            self.acquire().await?;
        }
        self.state = TransactionState::Active;
        debug!(key = %self.key, two_phase = self.settings.two_phase, "Transaction started");
        Ok(())
    }

    /// Phase one. Prepares the branch in two-phase mode; no-op otherwise.
    ///
    /// Does nothing on a tainted transaction; `finish` rolls it back.
    pub async fn commit(&mut self) -> DbResult<()> {
        if self.tainted {
            debug!(key = %self.key, "Skipping prepare on tainted transaction");
            return Ok(());
        }
        if !self.settings.two_phase || self.state != TransactionState::Active {
            return Ok(());
        }
        let Some(gid) = self.xid.as_ref().map(Xid::gid) else {
            return Ok(());
        };
        let Some(handle) = self.connection.clone() else {
            self.state = TransactionState::Preparing;
            return Ok(());
        };

        let result = {
            let mut conn = handle.lock().await;
            if conn.in_transaction() {
                conn.prepare(&gid).await.map(|_| true)
            } else {
                Ok(false)
            }
        };

        match result {
            Ok(prepared) => {
                if prepared {
                    debug!(key = %self.key, gid = %gid, "Transaction prepared");
                    self.prepared = Some(gid);
                }
                self.state = TransactionState::Preparing;
                Ok(())
            }
            Err(e) => {
                let class = classify(&e);
                warn!(key = %self.key, error = %e, "Prepare failed");
                self.taint(class).await;
                Err(class.escalate(e))
            }
        }
    }

    /// Phase two. Commits, or rolls back when the transaction is tainted.
    ///
    /// Returns the state the transaction ended in.
    pub async fn finish(&mut self) -> DbResult<TransactionState> {
        if self.tainted {
            info!(key = %self.key, "Rolling back tainted transaction instead of committing");
            self.abort().await;
            return Ok(TransactionState::RolledBack);
        }
        if !self.state.is_active() {
            return Ok(self.state);
        }

        let result = match self.connection.clone() {
            Some(handle) => {
                let mut conn = handle.lock().await;
                if conn.prepared_gid().is_some() {
                    conn.commit_prepared().await
                } else {
                    conn.commit().await
                }
            }
            None if self.prepared.is_some() => self.resolve_prepared(true).await,
            None => Ok(()),
        };

        let result = match result {
            Err(e) if self.prepared.is_some() && classify(&e) == ErrorClass::ConnectionLost => {
                warn!(key = %self.key, error = %e, "Connection lost during COMMIT PREPARED, retrying on a fresh connection");
                self.discard_connection().await;
                self.resolve_prepared(true).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.prepared = None;
                self.release(false).await;
                self.state = TransactionState::Committed;
                info!(key = %self.key, "Transaction committed");
                Ok(TransactionState::Committed)
            }
            Err(e) => {
                let class = classify(&e);
                error!(key = %self.key, error = %e, "Commit failed");
                self.taint(class).await;
                self.abort().await;
                Err(class.escalate(e))
            }
        }
    }

    /// Roll back. Best effort: failures are logged, never returned.
    ///
    /// The connection's taint is cleared only once the rollback went through
    /// (or failed because there was nothing to roll back); a connection that
    /// is still tainted or dead is closed by the pool instead of recycled.
    pub async fn abort(&mut self) {
        if let Some(handle) = self.connection.clone() {
            let mut lost = false;
            {
                let mut conn = handle.lock().await;
                let result = if conn.prepared_gid().is_some() {
                    conn.rollback_prepared().await
                } else {
                    conn.rollback().await
                };
                match result {
                    Ok(()) => {
                        conn.clear_taint();
                        self.prepared = None;
                    }
                    Err(e) if is_nothing_to_roll_back(&e) => {
                        debug!(key = %self.key, error = %e, "Nothing to roll back");
                        conn.forget_prepared();
                        conn.clear_taint();
                        self.prepared = None;
                    }
                    Err(e) => {
                        error!(key = %self.key, error = %e, "Rollback failed");
                        if classify(&e).is_connection_level() {
                            conn.mark_broken();
                            lost = true;
                        }
                    }
                }
            }
            self.release(false).await;
            if lost && self.prepared.is_some() {
                if let Err(e) = self.resolve_prepared(false).await {
                    error!(key = %self.key, error = %e, "Could not roll back prepared transaction");
                }
                self.release(false).await;
            }
        } else if self.prepared.is_some() {
            if let Err(e) = self.resolve_prepared(false).await {
                error!(key = %self.key, error = %e, "Could not roll back prepared transaction");
            }
            self.release(false).await;
        }

        if self.state != TransactionState::Idle || self.tainted {
            info!(key = %self.key, "Transaction rolled back");
        }
        self.prepared = None;
        self.tainted = false;
        self.state = TransactionState::RolledBack;
    }

    /// Mark the transaction unusable after a failure of class `class`.
    ///
    /// Connection-level failures discard the connection; a server that is
    /// unavailable also invalidates every idle connection in the pool.
    pub(crate) async fn taint(&mut self, class: ErrorClass) {
        self.tainted = true;
        if let Some(handle) = self.connection.clone() {
            let mut conn = handle.lock().await;
            conn.taint();
            if class.is_connection_level() {
                conn.mark_broken();
            }
        }
        if class.is_connection_level() {
            self.discard_connection().await;
            if class == ErrorClass::ServerUnavailable {
                self.pool.purge_idle().await;
            }
        }
        debug!(key = %self.key, class = ?class, "Transaction tainted");
    }

    /// Replace the current connection with a fresh one.
    pub(crate) async fn reconnect(&mut self) -> DbResult<Handle<D>> {
        if let Some(handle) = self.connection.clone() {
            handle.lock().await.mark_broken();
        }
        self.discard_connection().await;
        self.acquire().await
    }

    /// Check a connection out to prove the data source is reachable.
    pub async fn ping(&mut self) -> DbResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        self.acquire().await?;
        self.release(false).await;
        Ok(())
    }

    async fn acquire(&mut self) -> DbResult<Handle<D>> {
        let handle = self.pool.get(&self.key).await?;
        let init = {
            let mut conn = handle.lock().await;
            ConnectionInitializer::initialize(&mut conn, &self.settings).await
        };
        if let Err(e) = init {
            warn!(key = %self.key, error = %e, "Connection initialization failed");
            self.pool.put(handle, &self.key, true).await;
            return Err(crate::db::classify::escalate(e));
        }
        self.connection = Some(handle.clone());
        Ok(handle)
    }

    async fn release(&mut self, close: bool) {
        if let Some(handle) = self.connection.take() {
            self.pool.put(handle, &self.key, close).await;
        }
    }

    async fn discard_connection(&mut self) {
        self.release(true).await;
    }

    /// Finish the prepared branch from a fresh connection.
    async fn resolve_prepared(&mut self, commit: bool) -> DbResult<()> {
        let Some(gid) = self.prepared.clone() else {
            return Ok(());
        };
        let handle = match &self.connection {
            Some(handle) => handle.clone(),
            None => self.acquire().await?,
        };
        let mut conn = handle.lock().await;
        conn.adopt_prepared(gid.clone());
        let result = if commit {
            conn.commit_prepared().await
        } else {
            conn.rollback_prepared().await
        };
        match &result {
            Ok(()) => {
                self.prepared = None;
                info!(key = %self.key, gid = %gid, commit, "Resolved prepared transaction");
            }
            Err(_) => conn.forget_prepared(),
        }
        result
    }
}

impl<D: Driver> std::fmt::Debug for TransactionCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("xid", &self.xid)
            .field("prepared", &self.prepared)
            .field("tainted", &self.tainted)
            .field("calls", &self.calls)
            .field("failures", &self.failures)
            .finish()
    }
}
