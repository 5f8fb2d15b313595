//! Data models for the transactional connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    DEFAULT_ENCODING, DatabaseType, IsolationLevel, SessionFingerprint, SessionSettings,
    TransactionState, mask_connection_string,
};
pub use query::{
    ColumnMetadata, QueryParam, QueryRequest, QueryResult, STATEMENT_SEPARATOR, TypeTag,
};
pub use schema::{TableInfo, TableType};
