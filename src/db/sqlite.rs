//! SQLite backend.
//!
//! Isolation maps onto SQLite's own knobs: `read_uncommitted` for the lowest
//! level and `BEGIN IMMEDIATE` for serializable transactions. Two-phase
//! commit is not available.

use std::str::FromStr;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection as _, Executor, TypeInfo};
use tracing::debug;

use crate::db::driver::{BackendConnection, Driver, Fetched, StatementOutput, fetch_statement};
use crate::db::params::bind_sqlite_params;
use crate::db::types::{RowToJson, type_tag};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, DatabaseType, IsolationLevel, QueryParam};

const TABLES_SQL: &str = "\
SELECT name, \
       CASE WHEN name LIKE 'sqlite\\_%' ESCAPE '\\' THEN 'SYSTEM TABLE' \
            WHEN type = 'view' THEN 'VIEW' ELSE 'TABLE' END AS type \
FROM sqlite_master WHERE type IN ('table', 'view') \
ORDER BY name";

const COLUMN_DETAILS_SQL: &str =
    "SELECT name, type, \"notnull\" FROM pragma_table_info(?1) ORDER BY cid";

/// Opens [`SqliteConnection`]s to one database file.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    options: SqliteConnectOptions,
}

impl SqliteDriver {
    pub fn new(connection_string: &str) -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|e| DbError::configuration(format!("Invalid SQLite connection string: {}", e)))?
            .create_if_missing(true);
        Ok(Self { options })
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    type Connection = SqliteBackend;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn supports_two_phase_commit(&self) -> bool {
        false
    }

    fn tables_sql(&self) -> &'static str {
        TABLES_SQL
    }

    fn column_details_sql(&self) -> &'static str {
        COLUMN_DETAILS_SQL
    }

    async fn connect(&self) -> DbResult<SqliteBackend> {
        let conn = SqliteConnection::connect_with(&self.options).await?;
        Ok(SqliteBackend {
            conn,
            begin_sql: "BEGIN",
        })
    }
}

pub struct SqliteBackend {
    conn: SqliteConnection,
    begin_sql: &'static str,
}

impl SqliteBackend {
    async fn run(&mut self, sql: &str) -> DbResult<()> {
        self.conn.execute(sql).await?;
        Ok(())
    }

    async fn describe_columns(&mut self, sql: &str) -> DbResult<Vec<ColumnMetadata>> {
        let describe = self.conn.describe(sql).await?;
        Ok(describe
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                ColumnMetadata::new(
                    col.name(),
                    type_name,
                    type_tag(type_name, DatabaseType::SQLite),
                    describe.nullable(idx),
                )
            })
            .collect())
    }

    fn unsupported(gid: &str) -> DbError {
        DbError::transaction("SQLite does not support two-phase commit", gid)
    }
}

/// Canonical `PRAGMA encoding` value for `encoding`, if SQLite knows it.
fn sqlite_encoding(encoding: &str) -> Option<&'static str> {
    let normalized: String = encoding
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "utf8" | "unicode" => Some("UTF-8"),
        "utf16" => Some("UTF-16"),
        "utf16le" => Some("UTF-16le"),
        "utf16be" => Some("UTF-16be"),
        _ => None,
    }
}

#[async_trait]
impl BackendConnection for SqliteBackend {
    async fn configure_session(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> DbResult<()> {
        let read_uncommitted = isolation == IsolationLevel::ReadUncommitted;
        let sql = format!(
            "PRAGMA read_uncommitted = {}; PRAGMA query_only = {}",
            u8::from(read_uncommitted),
            u8::from(read_only)
        );
        self.run(&sql).await?;
        self.begin_sql = if isolation == IsolationLevel::Serializable && !read_only {
            "BEGIN IMMEDIATE"
        } else {
            "BEGIN"
        };
        Ok(())
    }

    async fn set_client_encoding(&mut self, encoding: &str) -> DbResult<()> {
        let Some(canonical) = sqlite_encoding(encoding) else {
            return Err(DbError::configuration(format!(
                "Unsupported SQLite encoding '{}'",
                encoding
            )));
        };
        // Only takes effect before the database file is created.
        self.run(&format!("PRAGMA encoding = '{}'", canonical)).await
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: Option<usize>,
    ) -> DbResult<StatementOutput> {
        let limit = fetch_limit.unwrap_or(usize::MAX);
        let fetched: Fetched<SqliteRow> = if params.is_empty() {
            let stream = self
                .conn
                .fetch_many(sql)
                .map_ok(|step| step.map_left(|done| done.rows_affected()));
            fetch_statement(stream, limit).await?
        } else {
            let query = bind_sqlite_params(sqlx::query(sql), params);
            let stream = self
                .conn
                .fetch_many(query)
                .map_ok(|step| step.map_left(|done| done.rows_affected()));
            fetch_statement(stream, limit).await?
        };

        if let Some(row) = fetched.rows.first() {
            let columns = row.column_metadata();
            let values = fetched.rows.iter().map(RowToJson::to_json_values).collect();
            return Ok(StatementOutput::result_set(columns, values));
        }
        if !fetched.needs_describe() {
            return Ok(StatementOutput::affected(fetched.rows_affected));
        }

        // A statement that already dropped or created its object cannot be prepared again.
        let columns = match self.describe_columns(sql).await {
            Ok(columns) => columns,
            Err(e) => {
                debug!(error = %e, "Statement cannot be described, treating it as a command");
                Vec::new()
            }
        };
        if columns.is_empty() {
            return Ok(StatementOutput::affected(fetched.rows_affected));
        }
        Ok(StatementOutput::result_set(columns, Vec::new()))
    }

    async fn begin(&mut self) -> DbResult<()> {
        let sql = self.begin_sql;
        self.run(sql).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.run("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.run("ROLLBACK").await
    }

    async fn prepare_transaction(&mut self, gid: &str) -> DbResult<()> {
        Err(Self::unsupported(gid))
    }

    async fn commit_prepared(&mut self, gid: &str) -> DbResult<()> {
        Err(Self::unsupported(gid))
    }

    async fn rollback_prepared(&mut self, gid: &str) -> DbResult<()> {
        Err(Self::unsupported(gid))
    }

    async fn close(self) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}
