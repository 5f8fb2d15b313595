//! Failure classification.
//!
//! [`classify`] sorts any [`DbError`] into one of four classes that decide
//! what the coordinator does next. It looks at the most structured signal
//! available first: SQLSTATE codes, then I/O error kinds, then variants that
//! are already classified, and finally message text.

use std::io::ErrorKind;

use crate::error::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Optimistic-concurrency conflict. The caller replays the whole transaction.
    Serialization,
    /// The session is gone. Close it; the statement may be retried once on a
    /// fresh connection.
    ConnectionLost,
    /// The server is transiently unreachable. Retry after a delay.
    ServerUnavailable,
    Other,
}

const SERIALIZATION_MESSAGES: &[&str] = &[
    "could not serialize access",
    "deadlock detected",
    "database is locked",
];

const CONNECTION_LOST_MESSAGES: &[&str] = &[
    "server closed the connection",
    "connection already closed",
    "terminating connection due to administrator command",
    "connection reset by peer",
    "closed by peer",
    "broken pipe",
    "unexpected eof",
];

const SERVER_UNAVAILABLE_MESSAGES: &[&str] = &[
    "could not connect",
    "connection refused",
    "the database system is shutting down",
    "the database system is starting up",
    "the database system is in recovery mode",
    "no route to host",
];

/// SQLite result codes SQLITE_BUSY, SQLITE_LOCKED and SQLITE_BUSY_SNAPSHOT.
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "517"];

/// Classify a failure. Pure: the same error always yields the same class.
pub fn classify(err: &DbError) -> ErrorClass {
    if let Some(code) = err.sql_state() {
        if let Some(class) = classify_sql_state(code) {
            return class;
        }
    }

    match err {
        DbError::Io { kind, .. } => {
            if let Some(class) = classify_io_kind(*kind) {
                return class;
            }
        }
        DbError::SerializationConflict { .. } => return ErrorClass::Serialization,
        DbError::ConnectionLost { .. } => return ErrorClass::ConnectionLost,
        DbError::ServerUnavailable { .. } => return ErrorClass::ServerUnavailable,
        _ => {}
    }

    classify_message(&err.to_string())
}

fn classify_sql_state(code: &str) -> Option<ErrorClass> {
    if code.starts_with("40") {
        return Some(ErrorClass::Serialization);
    }
    if SQLITE_BUSY_CODES.contains(&code) {
        return Some(ErrorClass::Serialization);
    }
    match code {
        // admin_shutdown, crash_shutdown
        "57P01" | "57P02" => Some(ErrorClass::ConnectionLost),
        // cannot_connect_now
        "57P03" => Some(ErrorClass::ServerUnavailable),
        // unable to establish / server rejected establishment
        "08001" | "08004" => Some(ErrorClass::ServerUnavailable),
        c if c.starts_with("08") => Some(ErrorClass::ConnectionLost),
        _ => None,
    }
}

fn classify_io_kind(kind: ErrorKind) -> Option<ErrorClass> {
    match kind {
        ErrorKind::ConnectionRefused
        | ErrorKind::TimedOut
        | ErrorKind::NotFound
        | ErrorKind::AddrNotAvailable => Some(ErrorClass::ServerUnavailable),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => Some(ErrorClass::ConnectionLost),
        _ => None,
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if contains_any(SERIALIZATION_MESSAGES) {
        ErrorClass::Serialization
    } else if contains_any(CONNECTION_LOST_MESSAGES) {
        ErrorClass::ConnectionLost
    } else if contains_any(SERVER_UNAVAILABLE_MESSAGES) {
        ErrorClass::ServerUnavailable
    } else {
        ErrorClass::Other
    }
}

impl ErrorClass {
    /// Turn a raw error into the variant callers match on.
    ///
    /// Already-escalated errors come back unchanged.
    pub fn escalate(self, err: DbError) -> DbError {
        match (self, err) {
            (_, err @ DbError::TaintedTransaction { .. }) => err,
            (Self::Serialization, err @ DbError::SerializationConflict { .. }) => err,
            (Self::Serialization, err) => {
                let sql_state = err.sql_state().map(str::to_string);
                DbError::serialization_conflict(err.to_string(), sql_state)
            }
            (Self::ConnectionLost, err @ DbError::ConnectionLost { .. }) => err,
            (Self::ConnectionLost, err) => DbError::connection_lost(err.to_string()),
            (Self::ServerUnavailable, err @ DbError::ServerUnavailable { .. }) => err,
            (Self::ServerUnavailable, err) => DbError::server_unavailable(err.to_string()),
            (Self::Other, err) => err,
        }
    }

    /// Whether the physical connection must be discarded.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::ServerUnavailable)
    }
}

/// Classify and escalate in one step.
pub fn escalate(err: DbError) -> DbError {
    classify(&err).escalate(err)
}

/// A rollback that failed only because there was nothing to roll back.
pub fn is_nothing_to_roll_back(err: &DbError) -> bool {
    // no_active_sql_transaction, undefined_object (unknown prepared gid)
    if matches!(err.sql_state(), Some("25P01") | Some("42704")) {
        return true;
    }
    let lower = err.to_string().to_lowercase();
    lower.contains("no transaction is active")
        || lower.contains("there is no transaction in progress")
}
