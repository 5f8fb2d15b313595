//! Transactional database connection manager.
//!
//! Hands out connections keyed by session, runs statement batches inside a
//! transaction, classifies backend failures into retry classes and never lets
//! a tainted connection commit. PostgreSQL sessions can take part in
//! two-phase commit driven by an external transaction manager.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{ConnectionPool, Session};
pub use error::{DbError, DbResult};
