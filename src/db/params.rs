//! Parameter binding utilities for database queries.
//!
//! The same parameter list is bound to every statement of a batch.

use crate::models::QueryParam;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Postgres, Sqlite};

/// Bind all parameters to a PostgreSQL query.
pub(crate) fn bind_postgres_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            QueryParam::Json(v) => query.bind(Json(v)),
        };
    }
    query
}

/// Bind all parameters to a SQLite query.
pub(crate) fn bind_sqlite_params<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Int(v) => query.bind(*v),
            QueryParam::Float(v) => query.bind(*v),
            QueryParam::String(v) => query.bind(v.as_str()),
            // SQLite doesn't have native JSON type, store as string
            QueryParam::Json(v) => query.bind(v.to_string()),
        };
    }
    query
}
