//! Pooled connection wrapper.
//!
//! [`Connection`] owns one physical backend session and the bookkeeping the
//! pool and coordinator need: the session settings applied to it, installed
//! type decoders, whether a backend transaction is open, and the taint flag.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::driver::{BackendConnection, StatementOutput};
use crate::db::types::DecoderRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, SessionFingerprint};

/// Shared handle to a checked-out connection.
///
/// The pool keeps one clone in its bookkeeping; the owning transaction locks
/// it to run statements, so statement execution never holds the pool lock.
pub type ConnectionHandle<C> = Arc<Mutex<Connection<C>>>;

pub struct Connection<C: BackendConnection> {
    id: u64,
    raw: Option<C>,
    owner: Option<String>,
    applied: Option<SessionFingerprint>,
    decoders: DecoderRegistry,
    tainted: bool,
    broken: bool,
    transaction_open: bool,
    statements_in_transaction: usize,
    prepared: Option<String>,
}

impl<C: BackendConnection> Connection<C> {
    pub fn new(id: u64, raw: C) -> Self {
        Self {
            id,
            raw: Some(raw),
            owner: None,
            applied: None,
            decoders: DecoderRegistry::new(),
            tainted: false,
            broken: false,
            transaction_open: false,
            statements_in_transaction: 0,
            prepared: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub(crate) fn set_owner(&mut self, key: Option<String>) {
        self.owner = key;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    pub fn taint(&mut self) {
        if !self.tainted {
            debug!(connection = self.id, "Connection tainted");
        }
        self.tainted = true;
    }

    pub(crate) fn clear_taint(&mut self) {
        self.tainted = false;
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    /// The session is known to be unusable and must not go back to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// A backend transaction is open or a prepared branch is pending.
    pub fn in_transaction(&self) -> bool {
        self.transaction_open || self.prepared.is_some()
    }

    pub fn statements_in_transaction(&self) -> usize {
        self.statements_in_transaction
    }

    pub fn prepared_gid(&self) -> Option<&str> {
        self.prepared.as_deref()
    }

    /// Safe to hand to another transaction.
    pub fn is_reusable(&self) -> bool {
        self.raw.is_some() && !self.tainted && !self.broken && !self.in_transaction()
    }

    pub fn needs_init(&self, wanted: &SessionFingerprint) -> bool {
        self.applied.as_ref() != Some(wanted)
    }

    pub(crate) fn set_applied(&mut self, applied: Option<SessionFingerprint>) {
        self.applied = applied;
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    pub(crate) fn decoders_mut(&mut self) -> &mut DecoderRegistry {
        &mut self.decoders
    }

    pub(crate) fn raw_mut(&mut self) -> DbResult<&mut C> {
        self.raw
            .as_mut()
            .ok_or_else(|| DbError::connection_lost("connection already closed"))
    }

    /// Run one statement.
    ///
    /// Outside autocommit the backend transaction is opened lazily before the
    /// first statement; in autocommit mode no BEGIN is sent and the backend
    /// commits every statement on its own. A tainted connection refuses to
    /// execute.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: Option<usize>,
        autocommit: bool,
    ) -> DbResult<StatementOutput> {
        if self.tainted {
            return Err(DbError::tainted_transaction(
                self.owner
                    .clone()
                    .unwrap_or_else(|| format!("connection {}", self.id)),
            ));
        }
        if self.prepared.is_some() {
            return Err(DbError::transaction(
                "cannot execute statements after the transaction was prepared",
                self.prepared.clone().unwrap_or_default(),
            ));
        }

        if !autocommit && !self.transaction_open {
            self.raw_mut()?.begin().await?;
            self.transaction_open = true;
            self.statements_in_transaction = 0;
        }

        let output = self.raw_mut()?.execute(sql, params, fetch_limit).await?;
        self.statements_in_transaction += 1;
        Ok(output)
    }

    /// Commit the open backend transaction, if any.
    pub async fn commit(&mut self) -> DbResult<()> {
        if !self.transaction_open {
            return Ok(());
        }
        let result = self.raw_mut()?.commit().await;
        self.transaction_open = false;
        self.statements_in_transaction = 0;
        result
    }

    /// Roll back the open backend transaction, if any.
    ///
    /// The transaction counts as finished even when the rollback fails: a
    /// failed ROLLBACK means the session is gone, and the server discards
    /// its transaction with it.
    pub async fn rollback(&mut self) -> DbResult<()> {
        if !self.transaction_open {
            return Ok(());
        }
        let result = self.raw_mut()?.rollback().await;
        self.transaction_open = false;
        self.statements_in_transaction = 0;
        result
    }

    /// Phase one: turn the open transaction into a prepared branch.
    pub async fn prepare(&mut self, gid: &str) -> DbResult<()> {
        self.raw_mut()?.prepare_transaction(gid).await?;
        self.transaction_open = false;
        self.statements_in_transaction = 0;
        self.prepared = Some(gid.to_string());
        Ok(())
    }

    pub async fn commit_prepared(&mut self) -> DbResult<()> {
        let Some(gid) = self.prepared.clone() else {
            return Ok(());
        };
        self.raw_mut()?.commit_prepared(&gid).await?;
        self.prepared = None;
        Ok(())
    }

    pub async fn rollback_prepared(&mut self) -> DbResult<()> {
        let Some(gid) = self.prepared.clone() else {
            return Ok(());
        };
        self.raw_mut()?.rollback_prepared(&gid).await?;
        self.prepared = None;
        Ok(())
    }

    /// Forget a prepared branch that has been resolved elsewhere.
    pub(crate) fn forget_prepared(&mut self) {
        self.prepared = None;
    }

    /// Take over a branch prepared on another (lost) session so it can be
    /// resolved from this one.
    pub(crate) fn adopt_prepared(&mut self, gid: impl Into<String>) {
        self.prepared = Some(gid.into());
    }

    /// Close the physical session. Further use fails with `ConnectionLost`.
    pub async fn close(&mut self) {
        let Some(raw) = self.raw.take() else {
            return;
        };
        self.transaction_open = false;
        self.applied = None;
        if let Err(e) = raw.close().await {
            warn!(connection = self.id, error = %e, "Error while closing connection");
        } else {
            debug!(connection = self.id, "Connection closed");
        }
    }
}

impl<C: BackendConnection> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("closed", &self.raw.is_none())
            .field("tainted", &self.tainted)
            .field("broken", &self.broken)
            .field("transaction_open", &self.transaction_open)
            .field("prepared", &self.prepared)
            .finish()
    }
}
