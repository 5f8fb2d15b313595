//! Integration tests for the transaction state machine: taint tracking,
//! two-phase commit and the first-statement reconnect.

mod common;

use common::{MockDriver, connection_lost, mock_pool, single_value, test_options};
use db_tx_adapter::db::{Session, StatementOutput, Xid};
use db_tx_adapter::error::{DbError, RetryHint};
use db_tx_adapter::models::{
    ColumnMetadata, QueryRequest, SessionSettings, TransactionState, TypeTag,
};
use serde_json::json;

fn session(driver: &MockDriver, settings: SessionSettings) -> Session<MockDriver> {
    let pool = mock_pool(driver, test_options());
    Session::new(pool, settings, Some("tx_test".to_string())).unwrap()
}

fn statement_error() -> DbError {
    DbError::database("division by zero", Some("22012".into()), "")
}

#[tokio::test]
async fn test_query_commit_lifecycle() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    let result = session.query_batch("SELECT 1", 0).await.unwrap();
    assert_eq!(result.rows, vec![vec![json!(1)]]);
    assert_eq!(session.state(), TransactionState::Active);

    session.commit().await.unwrap();
    let state = session.finish().await.unwrap();
    assert_eq!(state, TransactionState::Committed);
    assert_eq!(
        driver.ops(),
        vec![
            "connect#1",
            "configure#1:2/false",
            "encoding#1:UTF-8",
            "begin#1",
            "execute#1:SELECT 1",
            "commit#1",
        ]
    );
}

#[tokio::test]
async fn test_tainted_transaction_fails_fast() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    session.query_batch("SELECT 1", 0).await.unwrap();
    driver.fail_next("execute", statement_error());

    let err = session.query_batch("SELECT 1/0", 0).await.unwrap_err();
    assert_eq!(err.sql_state(), Some("22012"));
    assert!(session.is_tainted());
    assert_eq!(session.failures(), 1);

    let executed = driver.count("execute");
    for _ in 0..3 {
        let err = session.query_batch("SELECT 1", 0).await.unwrap_err();
        assert!(matches!(err, DbError::TaintedTransaction { ref key } if key == "tx_test"));
    }
    assert_eq!(driver.count("execute"), executed);
    assert_eq!(session.calls(), 5);

    session.abort().await;
    assert!(!session.is_tainted());
    assert_eq!(session.state(), TransactionState::RolledBack);

    session.query_batch("SELECT 1", 0).await.unwrap();
    assert_eq!(session.failures(), 0);
}

#[tokio::test]
async fn test_failed_batch_rolls_back_backend_transaction() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    driver.fail_next("execute", statement_error());
    session.query_batch("SELECT 1/0", 0).await.unwrap_err();

    assert!(driver.has_op("rollback#1"));
    // Statement errors keep the session; the connection is only tainted.
    assert_eq!(driver.count("close"), 0);
}

#[tokio::test]
async fn test_tainted_transaction_never_commits() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    driver.fail_next("execute", statement_error());
    session.query_batch("SELECT 1/0", 0).await.unwrap_err();

    session.commit().await.unwrap();
    let state = session.finish().await.unwrap();

    assert_eq!(state, TransactionState::RolledBack);
    assert_eq!(session.state(), TransactionState::RolledBack);
    assert_eq!(driver.count("commit"), 0);
    assert!(!session.is_tainted());
}

#[tokio::test]
async fn test_abort_returns_clean_connection_to_pool() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    session.query_batch("SELECT 1", 0).await.unwrap();
    session.abort().await;

    assert!(driver.has_op("rollback#1"));
    let stats = session.coordinator().pool().stats().await;
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.checked_out, 0);
}

#[tokio::test]
async fn test_abort_tolerates_nothing_to_roll_back() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    session.query_batch("SELECT 1", 0).await.unwrap();
    driver.fail_next(
        "rollback",
        DbError::database("there is no transaction in progress", Some("25P01".into()), ""),
    );
    session.abort().await;

    assert_eq!(session.state(), TransactionState::RolledBack);
    assert_eq!(session.coordinator().pool().stats().await.idle, 1);
}

#[tokio::test]
async fn test_abort_discards_dead_connection() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    session.query_batch("SELECT 1", 0).await.unwrap();
    driver.fail_next("rollback", connection_lost());
    session.abort().await;

    assert_eq!(session.state(), TransactionState::RolledBack);
    assert!(driver.has_op("close#1"));
    assert_eq!(session.coordinator().pool().stats().await.live(), 0);
}

#[tokio::test]
async fn test_two_phase_commit_sequence() {
    let driver = MockDriver::with_two_phase();
    let settings = SessionSettings::new().with_two_phase(true, "/app/db");
    let mut session = session(&driver, settings);
    let gid = Xid::new("tx_test", "/app/db").gid();

    session.begin().await.unwrap();
    assert_eq!(session.coordinator().xid().map(Xid::gid), Some(gid.clone()));

    session.query_batch("INSERT INTO t VALUES (1)", 0).await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(session.state(), TransactionState::Preparing);
    assert_eq!(session.coordinator().prepared_gid(), Some(gid.as_str()));

    let state = session.finish().await.unwrap();
    assert_eq!(state, TransactionState::Committed);

    let ops = driver.ops();
    let prepare = format!("prepare#1:{}", gid);
    let commit = format!("commit_prepared#1:{}", gid);
    let prepare_at = ops.iter().position(|o| *o == prepare).unwrap();
    let commit_at = ops.iter().position(|o| *o == commit).unwrap();
    assert!(prepare_at < commit_at);
    assert_eq!(driver.count("commit"), 0);
}

#[tokio::test]
async fn test_two_phase_prepare_skipped_when_tainted() {
    let driver = MockDriver::with_two_phase();
    let settings = SessionSettings::new().with_two_phase(true, "");
    let mut session = session(&driver, settings);

    driver.fail_next("execute", statement_error());
    session.query_batch("UPDATE t SET x = 1/0", 0).await.unwrap_err();

    session.commit().await.unwrap();
    assert_eq!(driver.count("prepare"), 0);
    assert_eq!(session.finish().await.unwrap(), TransactionState::RolledBack);
    assert_eq!(driver.count("commit_prepared"), 0);
}

#[tokio::test]
async fn test_two_phase_abort_after_prepare() {
    let driver = MockDriver::with_two_phase();
    let settings = SessionSettings::new().with_two_phase(true, "node1");
    let mut session = session(&driver, settings);
    let gid = Xid::new("tx_test", "node1").gid();

    session.query_batch("INSERT INTO t VALUES (1)", 0).await.unwrap();
    session.commit().await.unwrap();
    session.abort().await;

    assert!(driver.has_op(&format!("rollback_prepared#1:{}", gid)));
    assert_eq!(session.state(), TransactionState::RolledBack);
}

#[tokio::test]
async fn test_commit_prepared_retried_on_fresh_connection() {
    let driver = MockDriver::with_two_phase();
    let settings = SessionSettings::new().with_two_phase(true, "node1");
    let mut session = session(&driver, settings);
    let gid = Xid::new("tx_test", "node1").gid();

    session.query_batch("INSERT INTO t VALUES (1)", 0).await.unwrap();
    session.commit().await.unwrap();
    driver.fail_next("commit_prepared", connection_lost());

    let state = session.finish().await.unwrap();
    assert_eq!(state, TransactionState::Committed);
    assert!(driver.has_op("close#1"));
    assert!(driver.has_op(&format!("commit_prepared#2:{}", gid)));
}

#[tokio::test]
async fn test_prepare_failure_taints() {
    let driver = MockDriver::with_two_phase();
    let settings = SessionSettings::new().with_two_phase(true, "");
    let mut session = session(&driver, settings);

    session.query_batch("INSERT INTO t VALUES (1)", 0).await.unwrap();
    driver.fail_next(
        "prepare",
        DbError::database("could not serialize access due to read/write dependencies", Some("40001".into()), ""),
    );

    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, DbError::SerializationConflict { .. }));
    assert_eq!(err.retry_hint(), Some(RetryHint::Immediately));
    assert!(session.is_tainted());
    assert_eq!(session.finish().await.unwrap(), TransactionState::RolledBack);
}

#[tokio::test]
async fn test_two_phase_requires_backend_support() {
    let driver = MockDriver::new();
    let pool = mock_pool(&driver, test_options());
    let settings = SessionSettings::new().with_two_phase(true, "");
    let err = Session::new(pool, settings, None).unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
}

#[tokio::test]
async fn test_first_statement_reconnects_once() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    driver.fail_next("execute", connection_lost());
    let result = session.query_batch("SELECT 1", 0).await.unwrap();

    assert_eq!(result.rows, vec![vec![json!(1)]]);
    assert_eq!(driver.count("connect"), 2);
    assert!(driver.has_op("close#1"));
    assert!(driver.has_op("execute#2:SELECT 1"));
    assert!(!session.is_tainted());
    assert_eq!(session.calls(), 1);
    assert_eq!(session.failures(), 0);
}

#[tokio::test]
async fn test_second_connection_loss_propagates() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    driver.fail_next("execute", connection_lost());
    driver.fail_next("execute", connection_lost());
    let err = session.query_batch("SELECT 1", 0).await.unwrap_err();

    assert!(matches!(err, DbError::ConnectionLost { .. }));
    assert_eq!(driver.count("connect"), 2);
    assert!(session.is_tainted());
    assert_eq!(session.failures(), 1);
}

#[tokio::test]
async fn test_no_reconnect_once_transaction_is_underway() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    session.query_batch("INSERT INTO t VALUES (1)", 0).await.unwrap();
    driver.fail_next("execute", connection_lost());
    let err = session.query_batch("SELECT 1", 0).await.unwrap_err();

    assert!(matches!(err, DbError::ConnectionLost { .. }));
    assert_eq!(driver.count("connect"), 1);
    assert!(session.is_tainted());
    assert!(driver.has_op("close#1"));
}

#[tokio::test]
async fn test_no_reconnect_for_later_statements_in_batch() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    driver.fail_next("execute", connection_lost());
    driver.fail_next("execute", connection_lost());
    // First statement reconnects; its retry then fails, no further attempts.
    let request = QueryRequest::from_statements(["SELECT 1", "SELECT 1"]);
    session.query(&request).await.unwrap_err();
    assert_eq!(driver.count("connect"), 2);
}

#[tokio::test]
async fn test_serialization_failure_signals_immediate_retry() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    driver.fail_next(
        "execute",
        DbError::database("could not serialize access due to concurrent update", Some("40001".into()), ""),
    );
    let err = session.query_batch("UPDATE t SET x = 2", 0).await.unwrap_err();

    assert!(matches!(err, DbError::SerializationConflict { .. }));
    assert_eq!(err.retry_hint(), Some(RetryHint::Immediately));
    assert!(session.is_tainted());
}

#[tokio::test]
async fn test_server_unavailable_signals_delayed_retry() {
    let driver = MockDriver::new();
    let pool = mock_pool(&driver, test_options());

    let mut session = Session::new(pool.clone(), SessionSettings::new(), None).unwrap();
    session.query_batch("SELECT 1", 0).await.unwrap();

    // Park an idle connection so the purge has something to close.
    let spare = pool.get("spare").await.unwrap();
    pool.put(spare, "spare", false).await;
    assert_eq!(pool.stats().await.idle, 1);

    driver.fail_next(
        "execute",
        DbError::database("the database system is shutting down", Some("57P03".into()), ""),
    );
    let err = session.query_batch("SELECT 1", 0).await.unwrap_err();

    assert!(matches!(err, DbError::ServerUnavailable { .. }));
    assert!(matches!(err.retry_hint(), Some(RetryHint::AfterDelay(_))));
    assert!(driver.has_op("close#1"));
    assert!(driver.has_op("close#2"));
    assert_eq!(pool.stats().await.live(), 0);
}

#[tokio::test]
async fn test_autocommit_sends_no_transaction_control() {
    let driver = MockDriver::new();
    let settings = SessionSettings::new().with_autocommit(true);
    let mut session = session(&driver, settings);

    session.query_batch("INSERT INTO t VALUES (1)\0SELECT 1", 0).await.unwrap();
    session.finish().await.unwrap();

    assert_eq!(driver.count("begin"), 0);
    assert_eq!(driver.count("commit"), 0);
    assert_eq!(driver.count("execute"), 2);
}

#[tokio::test]
async fn test_autocommit_write_is_not_replayed_after_connection_loss() {
    let driver = MockDriver::new();
    let settings = SessionSettings::new().with_autocommit(true);
    let mut session = session(&driver, settings);

    driver.fail_next("execute", connection_lost());
    let err = session
        .query_batch("INSERT INTO ledger VALUES (100)", 0)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::ConnectionLost { .. }));
    assert_eq!(driver.count("connect"), 1);
    assert_eq!(driver.count("execute"), 1);
    assert!(driver.has_op("execute#1:INSERT INTO ledger VALUES (100)"));
    assert!(session.is_tainted());
    assert_eq!(session.failures(), 1);
}

#[tokio::test]
async fn test_session_settings_applied_once_per_connection() {
    let driver = MockDriver::new();
    let pool = mock_pool(&driver, test_options());

    for _ in 0..3 {
        let mut session = Session::new(pool.clone(), SessionSettings::new(), None).unwrap();
        session.query_batch("SELECT 1", 0).await.unwrap();
        session.finish().await.unwrap();
    }
    assert_eq!(driver.count("connect"), 1);
    assert_eq!(driver.count("configure"), 1);

    // Different settings re-initialize the recycled connection.
    let settings = SessionSettings::new().with_read_only(true);
    let mut session = Session::new(pool.clone(), settings, None).unwrap();
    session.query_batch("SELECT 1", 0).await.unwrap();
    assert!(driver.has_op("configure#1:2/true"));
}

#[tokio::test]
async fn test_shape_conflict_in_batch() {
    let driver = MockDriver::new();
    driver.set_result("SELECT 1", single_value());
    driver.set_result(
        "SELECT 'a'",
        StatementOutput::result_set(
            vec![ColumnMetadata::new("label", "text", TypeTag::String, None)],
            vec![vec![json!("a")]],
        ),
    );
    let mut session = session(&driver, SessionSettings::new());

    let err = session
        .query_batch("SELECT 1\0SELECT 'a'", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ResultShapeConflict { .. }));
    assert!(session.is_tainted());
}

#[tokio::test]
async fn test_same_shape_batch_returns_last_result() {
    let driver = MockDriver::new();
    driver.set_result(
        "SELECT 2",
        StatementOutput::result_set(
            vec![ColumnMetadata::new("value", "int4", TypeTag::Integer, Some(false))],
            vec![vec![json!(2)]],
        ),
    );
    let mut session = session(&driver, SessionSettings::new());

    let result = session.query_batch("SELECT 1\0SELECT 2", 0).await.unwrap();
    assert_eq!(result.rows, vec![vec![json!(2)]]);
}

#[tokio::test]
async fn test_close_releases_connection() {
    let driver = MockDriver::new();
    let mut session = session(&driver, SessionSettings::new());

    session.open().await.unwrap();
    session.query_batch("SELECT 1", 0).await.unwrap();
    session.close().await;

    assert!(driver.has_op("rollback#1"));
    assert_eq!(session.coordinator().pool().stats().await.checked_out, 0);
}
