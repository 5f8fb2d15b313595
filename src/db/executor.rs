//! Batch execution.
//!
//! [`QueryExecutor`] runs a [`QueryRequest`] on the transaction's connection,
//! statement by statement, and turns the batch into one [`QueryResult`].

use std::time::Instant;

use tracing::{debug, warn};

use crate::config::RowLimitPolicy;
use crate::db::classify::{ErrorClass, classify};
use crate::db::connection::Connection;
use crate::db::driver::{BackendConnection, Driver, StatementOutput};
use crate::db::transaction::TransactionCoordinator;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, QueryParam, QueryRequest, QueryResult};

/// Executes statement batches inside a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutor {
    row_limit_policy: RowLimitPolicy,
}

impl QueryExecutor {
    pub fn new(row_limit_policy: RowLimitPolicy) -> Self {
        Self { row_limit_policy }
    }

    pub fn row_limit_policy(&self) -> RowLimitPolicy {
        self.row_limit_policy
    }

    /// Run a batch and return the rows of its last result set.
    ///
    /// Every result set in the batch must have the same shape. A failure
    /// rolls the backend transaction back, taints the transaction and is
    /// returned after classification.
    pub async fn query<D: Driver>(
        &self,
        txn: &mut TransactionCoordinator<D>,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let start = Instant::now();
        txn.record_call();

        if txn.is_tainted() {
            return Err(DbError::tainted_transaction(txn.key()));
        }
        if request.is_empty() {
            return Err(DbError::invalid_input("empty statement batch"));
        }
        if !txn.state().is_active() {
            if let Err(e) = txn.begin().await {
                txn.record_failure();
                return Err(e);
            }
        }

        let max_rows = request.effective_max_rows();
        let fetch_limit = max_rows.map(|m| usize::try_from(m).unwrap_or(usize::MAX).saturating_add(1));

        let mut columns: Option<Vec<ColumnMetadata>> = None;
        let mut rows = Vec::new();
        let mut truncated = false;

        for (index, sql) in request.statements.iter().enumerate() {
            let output = match self
                .run_statement(txn, sql, &request.params, fetch_limit, index == 0)
                .await
            {
                Ok(output) => output,
                Err(e) => return Err(self.fail(txn, e).await),
            };

            let Some(statement_columns) = output.columns else {
                debug!(
                    key = %txn.key(),
                    statement = index,
                    rows_affected = output.rows_affected,
                    "Statement executed"
                );
                continue;
            };

            if let Some(previous) = &columns {
                if !ColumnMetadata::same_shape(previous, &statement_columns) {
                    let err = DbError::result_shape_conflict(format!(
                        "statement {} returns columns ({}) but an earlier statement returned ({})",
                        index + 1,
                        describe_shape(&statement_columns),
                        describe_shape(previous)
                    ));
                    return Err(self.fail(txn, err).await);
                }
            }

            let mut statement_rows = output.rows;
            let mut statement_truncated = false;
            if let Some(limit) = max_rows {
                if statement_rows.len() as u64 > limit {
                    match self.row_limit_policy {
                        RowLimitPolicy::Error => {
                            return Err(self.fail(txn, DbError::row_limit_exceeded(limit)).await);
                        }
                        RowLimitPolicy::Warn => {
                            warn!(
                                key = %txn.key(),
                                max_rows = limit,
                                "Result has more rows than max_rows, truncating"
                            );
                            statement_rows.truncate(limit as usize);
                            statement_truncated = true;
                        }
                    }
                }
            }

            columns = Some(statement_columns);
            rows = statement_rows;
            truncated = statement_truncated;
        }

        txn.reset_failures();
        let execution_time_ms = start.elapsed().as_millis() as u64;
        debug!(
            key = %txn.key(),
            statements = request.statements.len(),
            rows = rows.len(),
            execution_time_ms,
            "Batch executed"
        );

        Ok(QueryResult {
            columns: columns.unwrap_or_default(),
            rows,
            truncated,
            execution_time_ms,
        })
    }

    /// Execute one statement and apply the connection's decoders.
    ///
    /// The first statement of a batch that loses its connection before the
    /// backend transaction has done anything is retried once on a fresh
    /// connection. Autocommit statements are never retried: the lost one may
    /// already be committed.
    async fn run_statement<D: Driver>(
        &self,
        txn: &mut TransactionCoordinator<D>,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: Option<usize>,
        first: bool,
    ) -> DbResult<StatementOutput> {
        let autocommit = txn.settings().autocommit;
        let handle = txn.connection()?;
        let (result, fresh) = {
            let mut conn = handle.lock().await;
            let fresh = !conn.in_transaction();
            let result = conn.execute(sql, params, fetch_limit, autocommit).await;
            (result.map(|output| decode(&conn, output)), fresh)
        };

        match result {
            Err(e) if first && fresh && !autocommit && classify(&e) == ErrorClass::ConnectionLost => {
                warn!(key = %txn.key(), error = %e, "Connection lost on first statement, reconnecting");
                let handle = txn.reconnect().await?;
                let mut conn = handle.lock().await;
                let output = conn.execute(sql, params, fetch_limit, autocommit).await?;
                Ok(decode(&conn, output))
            }
            other => other,
        }
    }

    /// Roll back, taint, count the failure and classify `err`.
    async fn fail<D: Driver>(&self, txn: &mut TransactionCoordinator<D>, err: DbError) -> DbError {
        let class = classify(&err);
        warn!(key = %txn.key(), error = %err, class = ?class, "Batch failed");

        if !class.is_connection_level() {
            if let Ok(handle) = txn.connection() {
                let mut conn = handle.lock().await;
                if let Err(e) = conn.rollback().await {
                    warn!(key = %txn.key(), error = %e, "Rollback after failed statement failed");
                    if classify(&e).is_connection_level() {
                        conn.mark_broken();
                    }
                }
            }
        }

        txn.taint(class).await;
        txn.record_failure();
        class.escalate(err)
    }
}

fn decode<C: BackendConnection>(conn: &Connection<C>, mut output: StatementOutput) -> StatementOutput {
    if let Some(columns) = &output.columns {
        conn.decoders().decode_rows(columns, &mut output.rows);
    }
    output
}

fn describe_shape(columns: &[ColumnMetadata]) -> String {
    columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.type_name))
        .collect::<Vec<_>>()
        .join(", ")
}
