//! PostgreSQL backend.
//!
//! Statements without parameters use the simple query protocol; bound
//! parameters go through an unnamed prepared statement. Two-phase commit
//! maps onto `PREPARE TRANSACTION` / `COMMIT PREPARED` / `ROLLBACK PREPARED`.

use std::str::FromStr;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, Connection as _, Executor, TypeInfo};

use crate::db::driver::{
    BackendConnection, Driver, Fetched, StatementOutput, fetch_statement, quote_literal,
};
use crate::db::params::bind_postgres_params;
use crate::db::types::{RowToJson, type_tag};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, DatabaseType, IsolationLevel, QueryParam};

const TABLES_SQL: &str = "\
SELECT tablename::text AS name, \
       CASE WHEN schemaname = 'pg_catalog' THEN 'SYSTEM TABLE' ELSE 'TABLE' END AS type \
FROM pg_catalog.pg_tables WHERE schemaname <> 'information_schema' \
UNION ALL \
SELECT viewname::text, 'VIEW' \
FROM pg_catalog.pg_views WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
ORDER BY 1";

const COLUMN_DETAILS_SQL: &str = "\
SELECT a.attname::text AS name, \
       format_type(a.atttypid, a.atttypmod) AS declared_type, \
       a.attnotnull AS not_null \
FROM pg_catalog.pg_attribute a \
WHERE a.attrelid = to_regclass(quote_ident($1)) AND a.attnum > 0 AND NOT a.attisdropped \
ORDER BY a.attnum";

/// Opens [`PostgresConnection`]s to one server.
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    options: PgConnectOptions,
}

impl PostgresDriver {
    pub fn new(connection_string: &str) -> DbResult<Self> {
        let options = PgConnectOptions::from_str(connection_string).map_err(|e| {
            DbError::configuration(format!("Invalid PostgreSQL connection string: {}", e))
        })?;
        Ok(Self { options })
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    type Connection = PostgresConnection;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn supports_two_phase_commit(&self) -> bool {
        true
    }

    fn tables_sql(&self) -> &'static str {
        TABLES_SQL
    }

    fn column_details_sql(&self) -> &'static str {
        COLUMN_DETAILS_SQL
    }

    async fn connect(&self) -> DbResult<PostgresConnection> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(PostgresConnection { conn })
    }
}

pub struct PostgresConnection {
    conn: PgConnection,
}

impl PostgresConnection {
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
                    type_tag(type_name, DatabaseType::PostgreSQL),
                    describe.nullable(idx),
                )
            })
            .collect())
    }
}

/// Whether `encoding` names UTF-8 in any of the spellings PostgreSQL accepts.
fn is_utf8_alias(encoding: &str) -> bool {
    let normalized: String = encoding
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    normalized == "utf8" || normalized == "unicode"
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    async fn configure_session(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> DbResult<()> {
        let sql = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}, {}",
            isolation.as_sql(),
            if read_only { "READ ONLY" } else { "READ WRITE" }
        );
        self.run(&sql).await
    }

    async fn set_client_encoding(&mut self, encoding: &str) -> DbResult<()> {
        if !is_utf8_alias(encoding) {
            return Err(DbError::configuration(format!(
                "Unsupported client encoding '{}': PostgreSQL sessions must use UTF-8",
                encoding
            )));
        }
        self.run("SET client_encoding TO 'UTF8'").await
    }

    async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        fetch_limit: Option<usize>,
    ) -> DbResult<StatementOutput> {
        let limit = fetch_limit.unwrap_or(usize::MAX);
        let fetched: Fetched<PgRow> = if params.is_empty() {
            let stream = self
                .conn
                .fetch_many(sql)
                .map_ok(|step| step.map_left(|done| done.rows_affected()));
            fetch_statement(stream, limit).await?
        } else {
            let query = bind_postgres_params(sqlx::query(sql), params);
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
        // A command that touched rows cannot be a row-returning statement.
        if !fetched.needs_describe() || fetched.rows_affected > 0 {
            return Ok(StatementOutput::affected(fetched.rows_affected));
        }

        let columns = self.describe_columns(sql).await?;
        if columns.is_empty() {
            return Ok(StatementOutput::affected(fetched.rows_affected));
        }
        Ok(StatementOutput::result_set(columns, Vec::new()))
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.run("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.run("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.run("ROLLBACK").await
    }

    async fn prepare_transaction(&mut self, gid: &str) -> DbResult<()> {
        self.run(&format!("PREPARE TRANSACTION {}", quote_literal(gid)))
            .await
    }

    async fn commit_prepared(&mut self, gid: &str) -> DbResult<()> {
        self.run(&format!("COMMIT PREPARED {}", quote_literal(gid)))
            .await
    }

    async fn rollback_prepared(&mut self, gid: &str) -> DbResult<()> {
        self.run(&format!("ROLLBACK PREPARED {}", quote_literal(gid)))
            .await
    }

    async fn close(self) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}
