//! Backend seam.
//!
//! A [`Driver`] opens physical connections; a [`BackendConnection`] is one
//! physical session. Everything above this module (pool, initializer,
//! coordinator, executor) is written against these two traits, so any
//! backend that can run statements and transaction control commands can sit
//! underneath.

use async_trait::async_trait;
use futures_util::{Stream, TryStreamExt};
use serde_json::Value as JsonValue;
use sqlx::Either;

use crate::error::DbResult;
use crate::models::{ColumnMetadata, DatabaseType, IsolationLevel, QueryParam};

/// What one statement produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutput {
    /// `Some` when the statement returns a result set (even an empty one).
    pub columns: Option<Vec<ColumnMetadata>>,
    pub rows: Vec<Vec<JsonValue>>,
    pub rows_affected: u64,
}

impl StatementOutput {
    /// Output of a statement without a result set.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            columns: None,
            rows: Vec::new(),
            rows_affected,
        }
    }

    pub fn result_set(columns: Vec<ColumnMetadata>, rows: Vec<Vec<JsonValue>>) -> Self {
        Self {
            columns: Some(columns),
            rows,
            rows_affected: 0,
        }
    }

    pub fn has_result_set(&self) -> bool {
        self.columns.is_some()
    }
}

/// One physical session to the backend.
#[async_trait]
pub trait BackendConnection: Send + Sized + 'static {
    /// Set isolation level and access mode in a single round trip.
    async fn configure_session(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> DbResult<()>;

    async fn set_client_encoding(&mut self, encoding: &str) -> DbResult<()>;

    /// Run one statement, reading at most `fetch_limit` rows.
    async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: Option<usize>,
    ) -> DbResult<StatementOutput>;

    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Phase one of two-phase commit for the open transaction.
    async fn prepare_transaction(&mut self, gid: &str) -> DbResult<()>;

    async fn commit_prepared(&mut self, gid: &str) -> DbResult<()>;

    async fn rollback_prepared(&mut self, gid: &str) -> DbResult<()>;

    async fn close(self) -> DbResult<()>;
}

/// Factory for physical connections to one data source.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    type Connection: BackendConnection;

    fn database_type(&self) -> DatabaseType;

    fn supports_two_phase_commit(&self) -> bool;

    /// Catalog query returning `(name, type)` rows for tables and views.
    fn tables_sql(&self) -> &'static str;

    /// Catalog query taking the table name as its only parameter and
    /// returning `(name, declared type, not null)` rows in column order.
    fn column_details_sql(&self) -> &'static str;

    async fn connect(&self) -> DbResult<Self::Connection>;
}

/// What the backend sent back for one statement before we stopped reading.
#[derive(Debug)]
pub(crate) struct Fetched<R> {
    pub rows: Vec<R>,
    /// Completed statements reported by the backend.
    pub results: usize,
    pub rows_affected: u64,
}

impl<R> Fetched<R> {
    /// No rows arrived and the text was a single statement, so only its
    /// description can tell an empty result set from a plain command.
    pub fn needs_describe(&self) -> bool {
        self.rows.is_empty() && self.results <= 1
    }
}

/// Drain a `fetch_many` stream, keeping at most `limit` rows.
///
/// Row counts are summed over every statement in the text; reading stops
/// once `limit` rows have arrived.
pub(crate) async fn fetch_statement<R, S>(mut stream: S, limit: usize) -> DbResult<Fetched<R>>
where
    S: Stream<Item = Result<Either<u64, R>, sqlx::Error>> + Unpin,
{
    let mut fetched = Fetched {
        rows: Vec::new(),
        results: 0,
        rows_affected: 0,
    };
    while fetched.rows.len() < limit {
        match stream.try_next().await? {
            Some(Either::Left(affected)) => {
                fetched.results += 1;
                fetched.rows_affected += affected;
            }
            Some(Either::Right(row)) => fetched.rows.push(row),
            None => break,
        }
    }
    Ok(fetched)
}

/// Quote an identifier for use in generated SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for statements that cannot take bind parameters.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
