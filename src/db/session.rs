//! Caller-facing database handle.
//!
//! A [`Session`] is what an external transaction manager talks to: it owns a
//! [`TransactionCoordinator`] for one session key, runs queries through a
//! [`QueryExecutor`] and exposes the lifecycle hooks.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::config::RowLimitPolicy;
use crate::db::driver::{Driver, quote_identifier};
use crate::db::executor::QueryExecutor;
use crate::db::pool::ConnectionPool;
use crate::db::transaction::TransactionCoordinator;
use crate::db::types::parse_type_modifiers;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, QueryParam, QueryRequest, QueryResult, SessionSettings, TableInfo, TableType,
    TransactionState,
};

/// Generate a session key.
pub fn generate_session_key() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

pub struct Session<D: Driver> {
    txn: TransactionCoordinator<D>,
    executor: QueryExecutor,
}

impl<D: Driver> Session<D> {
    /// Create a session on `pool`.
    ///
    /// Fails when the settings ask for something the backend cannot do. A
    /// random key is generated when `key` is `None`.
    pub fn new(
        pool: Arc<ConnectionPool<D>>,
        settings: SessionSettings,
        key: Option<String>,
    ) -> DbResult<Self> {
        settings.validate(
            pool.database_type(),
            pool.driver().supports_two_phase_commit(),
        )?;
        let key = match key {
            Some(key) if key.trim().is_empty() => {
                return Err(DbError::invalid_input("session key must not be empty"));
            }
            Some(key) => key,
            None => generate_session_key(),
        };
        Ok(Self {
            txn: TransactionCoordinator::new(pool, settings, key),
            executor: QueryExecutor::default(),
        })
    }

    pub fn with_row_limit_policy(mut self, policy: RowLimitPolicy) -> Self {
        self.executor = QueryExecutor::new(policy);
        self
    }

    pub fn key(&self) -> &str {
        self.txn.key()
    }

    pub fn state(&self) -> TransactionState {
        self.txn.state()
    }

    pub fn is_tainted(&self) -> bool {
        self.txn.is_tainted()
    }

    pub fn calls(&self) -> u64 {
        self.txn.calls()
    }

    pub fn failures(&self) -> u64 {
        self.txn.failures()
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<D> {
        &self.txn
    }

    /// Verify the data source is reachable.
    pub async fn open(&mut self) -> DbResult<()> {
        self.txn.ping().await?;
        info!(key = %self.key(), db_type = %self.txn.pool().database_type(), "Session opened");
        Ok(())
    }

    /// Roll back whatever is open and release the session's connection.
    pub async fn close(&mut self) {
        if self.txn.state().is_active() || self.txn.is_tainted() || self.txn.has_connection() {
            self.txn.abort().await;
        }
        self.txn.pool().evict_all(Some(self.txn.key())).await;
        info!(key = %self.key(), "Session closed");
    }

    pub async fn query(&mut self, request: &QueryRequest) -> DbResult<QueryResult> {
        self.executor.query(&mut self.txn, request).await
    }

    /// Run NUL-separated statements.
    pub async fn query_batch(&mut self, sql: &str, max_rows: u64) -> DbResult<QueryResult> {
        let request = QueryRequest::from_batch(sql).with_max_rows(max_rows);
        self.query(&request).await
    }

    /// Run a batch with parameters bound to every statement.
    pub async fn query_with_params(
        &mut self,
        sql: &str,
        params: Vec<QueryParam>,
        max_rows: u64,
    ) -> DbResult<QueryResult> {
        let mut request = QueryRequest::from_batch(sql).with_max_rows(max_rows);
        request.params = params;
        self.query(&request).await
    }

    /// List tables and views. `None` returns user tables and views.
    pub async fn tables(&mut self, types: Option<&[TableType]>) -> DbResult<Vec<TableInfo>> {
        let wanted = types.unwrap_or(TableType::user_visible());
        let sql = self.txn.pool().driver().tables_sql();
        let result = self.query(&QueryRequest::new(sql)).await?;

        let tables: Vec<TableInfo> = result
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.first()?.as_str()?;
                let table_type = TableType::parse(row.get(1).and_then(JsonValue::as_str).unwrap_or("TABLE"));
                wanted
                    .contains(&table_type)
                    .then(|| TableInfo::new(name, table_type))
            })
            .collect();
        debug!(key = %self.key(), count = tables.len(), "Listed tables");
        Ok(tables)
    }

    /// Describe the columns of `table`.
    ///
    /// Names and types come from an empty select; nullability and size
    /// modifiers from the catalog.
    pub async fn columns(&mut self, table: &str) -> DbResult<Vec<ColumnMetadata>> {
        if table.trim().is_empty() {
            return Err(DbError::invalid_input("table name must not be empty"));
        }
        let shape_sql = format!("SELECT * FROM {} WHERE 1=0", quote_identifier(table));
        let mut columns = self.query(&QueryRequest::new(shape_sql)).await?.columns;

        let details_sql = self.txn.pool().driver().column_details_sql();
        let details = self
            .query(&QueryRequest::new(details_sql).with_param(QueryParam::String(table.to_string())))
            .await?;

        let db_type = self.txn.pool().database_type();
        for row in &details.rows {
            let Some(name) = row.first().and_then(JsonValue::as_str) else {
                continue;
            };
            let Some(column) = columns.iter_mut().find(|c| c.name == name) else {
                continue;
            };
            let declared = row.get(1).and_then(JsonValue::as_str).unwrap_or("");
            let not_null = match row.get(2) {
                Some(JsonValue::Bool(b)) => Some(*b),
                Some(JsonValue::Number(n)) => n.as_i64().map(|v| v != 0),
                _ => None,
            };
            if let Some(not_null) = not_null {
                column.nullable = Some(!not_null);
            }
            (column.width, column.precision, column.scale) = parse_type_modifiers(declared, db_type);
        }

        if columns.is_empty() {
            return Err(DbError::schema("table has no columns", table));
        }
        Ok(columns)
    }

    pub async fn begin(&mut self) -> DbResult<()> {
        self.txn.begin().await
    }

    /// Phase one of two-phase commit.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.txn.commit().await
    }

    /// Phase two: commit, or roll back a tainted transaction.
    pub async fn finish(&mut self) -> DbResult<TransactionState> {
        self.txn.finish().await
    }

    pub async fn abort(&mut self) {
        self.txn.abort().await
    }
}

impl<D: Driver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("txn", &self.txn)
            .field("executor", &self.executor)
            .finish()
    }
}
