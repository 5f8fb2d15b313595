//! Error types for the transactional connection manager.
//!
//! Every failure a caller can observe is a [`DbError`]. Backend errors are
//! converted from `sqlx::Error` keeping their SQLSTATE code and I/O error
//! kind so that [`crate::db::classify`] can sort them into retry classes.

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;

/// Delay suggested to callers when the server is temporarily unreachable.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("I/O error: {message}")]
    Io { message: String, kind: ErrorKind },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Connection pool exhausted: all {max_total} connections are in use")]
    PoolExhausted { max_total: u32 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Database server unavailable: {message}")]
    ServerUnavailable { message: String },

    #[error("Serialization conflict: {message}")]
    SerializationConflict {
        message: String,
        sql_state: Option<String>,
    },

    #[error("Query on tainted transaction '{key}': abort the transaction before issuing new queries")]
    TaintedTransaction { key: String },

    #[error("Result shape conflict: {message}")]
    ResultShapeConflict { message: String },

    #[error("Row limit exceeded: query returned more than {max_rows} rows")]
    RowLimitExceeded { max_rows: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// How a caller should replay a failed transaction.
///
/// The core never replays a transaction itself; only the caller knows how to
/// re-run its logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// The transaction lost an optimistic-concurrency race. Retry right away.
    Immediately,
    /// The server is restarting or unreachable. Retry after the given delay.
    AfterDelay(Duration),
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn pool_exhausted(max_total: u32) -> Self {
        Self::PoolExhausted { max_total }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn server_unavailable(message: impl Into<String>) -> Self {
        Self::ServerUnavailable {
            message: message.into(),
        }
    }

    pub fn serialization_conflict(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::SerializationConflict {
            message: message.into(),
            sql_state,
        }
    }

    pub fn tainted_transaction(key: impl Into<String>) -> Self {
        Self::TaintedTransaction { key: key.into() }
    }

    pub fn result_shape_conflict(message: impl Into<String>) -> Self {
        Self::ResultShapeConflict {
            message: message.into(),
        }
    }

    pub fn row_limit_exceeded(max_rows: u64) -> Self {
        Self::RowLimitExceeded { max_rows }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// SQLSTATE code reported by the backend, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } | Self::SerializationConflict { sql_state, .. } => {
                sql_state.as_deref()
            }
            _ => None,
        }
    }

    /// The retry signal a caller should act on, if the error is transient.
    pub fn retry_hint(&self) -> Option<RetryHint> {
        match self {
            Self::SerializationConflict { .. } => Some(RetryHint::Immediately),
            Self::ServerUnavailable { .. } => Some(RetryHint::AfterDelay(DEFAULT_RETRY_DELAY)),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::server_unavailable("connection acquire timed out"),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::Io {
                message: io_err.to_string(),
                kind: io_err.kind(),
            },
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => DbError::schema(
                format!("Type not found: {}", type_name),
                type_name.to_string(),
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::schema(format!("Column not found: {}", col), col.to_string())
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection_lost("database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
