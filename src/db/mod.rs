//! Database layer.
//!
//! - `driver`: the backend seam (`Driver`, `BackendConnection`)
//! - `postgres`, `sqlite`: sqlx-backed implementations
//! - `pool`: keyed connection pool
//! - `initializer`: per-connection session setup
//! - `classify`: failure classification
//! - `transaction`: two-phase transaction state machine and taint tracking
//! - `executor`: batch execution
//! - `session`: the caller-facing handle

pub mod classify;
pub mod connection;
pub mod driver;
pub mod executor;
pub mod initializer;
pub mod params;
pub mod pool;
pub mod postgres;
pub mod session;
pub mod sqlite;
pub mod transaction;
pub mod types;

pub use classify::{ErrorClass, classify};
pub use connection::{Connection, ConnectionHandle};
pub use driver::{BackendConnection, Driver, StatementOutput};
pub use executor::QueryExecutor;
pub use initializer::ConnectionInitializer;
pub use pool::{ConnectionPool, PoolStats};
pub use postgres::{PostgresConnection, PostgresDriver};
pub use session::Session;
pub use sqlite::{SqliteBackend, SqliteDriver};
pub use transaction::{TransactionCoordinator, Xid};
pub use types::{DecoderRegistry, TypeDecoder};
