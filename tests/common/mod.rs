//! Scripted in-memory backend for fault-injection tests.
//!
//! Every backend call is recorded as `"<op>#<connection id>"` (plus `:<arg>`
//! for statements and transaction ids). Failures are queued per operation
//! and consumed by the next matching call. Statements answer with their
//! canned output, or `single_value()` for text starting with `SELECT`, or one
//! affected row.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use db_tx_adapter::config::PoolOptions;
use db_tx_adapter::db::{BackendConnection, ConnectionPool, Driver, StatementOutput};
use db_tx_adapter::error::{DbError, DbResult};
use db_tx_adapter::models::{
    ColumnMetadata, DatabaseType, IsolationLevel, QueryParam, TypeTag,
};
use serde_json::json;

#[derive(Default)]
pub struct MockState {
    pub ops: Vec<String>,
    failures: HashMap<String, VecDeque<DbError>>,
    results: HashMap<String, StatementOutput>,
    next_id: u64,
}

#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    two_phase: bool,
    connect_delay: Duration,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            two_phase: false,
            connect_delay: Duration::ZERO,
        }
    }

    pub fn with_two_phase() -> Self {
        Self {
            two_phase: true,
            ..Self::new()
        }
    }

    /// Every connect takes `delay`, keeping pool slots pending meanwhile.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..self
        }
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: &str, err: DbError) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn set_result(&self, sql: &str, output: StatementOutput) {
        let mut state = self.state.lock().unwrap();
        state.results.insert(sql.to_string(), output);
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Recorded calls of `op`, e.g. `count("begin")`.
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{}#", op);
        self.ops().iter().filter(|o| o.starts_with(&prefix)).count()
    }

    pub fn has_op(&self, op: &str) -> bool {
        self.ops().iter().any(|o| o == op)
    }

    fn record(&self, op: &str, id: u64, arg: Option<&str>) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(match arg {
            Some(arg) => format!("{}#{}:{}", op, id, arg),
            None => format!("{}#{}", op, id),
        });
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn supports_two_phase_commit(&self) -> bool {
        self.two_phase
    }

    fn tables_sql(&self) -> &'static str {
        "MOCK TABLES"
    }

    fn column_details_sql(&self) -> &'static str {
        "MOCK COLUMNS"
    }

    async fn connect(&self) -> DbResult<MockConnection> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            state.next_id
        };
        self.record("connect", id, None)?;
        Ok(MockConnection {
            id,
            driver: self.clone(),
        })
    }
}

pub struct MockConnection {
    id: u64,
    driver: MockDriver,
}

/// One `value int4` column holding `1`.
pub fn single_value() -> StatementOutput {
    StatementOutput::result_set(
        vec![ColumnMetadata::new("value", "int4", TypeTag::Integer, Some(false))],
        vec![vec![json!(1)]],
    )
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn configure_session(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> DbResult<()> {
        let arg = format!("{}/{}", isolation.code(), read_only);
        self.driver.record("configure", self.id, Some(&arg))
    }

    async fn set_client_encoding(&mut self, encoding: &str) -> DbResult<()> {
        self.driver.record("encoding", self.id, Some(encoding))
    }

    async fn execute(
        &mut self,
        sql: &str,
        _params: &[QueryParam],
        fetch_limit: Option<usize>,
    ) -> DbResult<StatementOutput> {
        self.driver.record("execute", self.id, Some(sql))?;
        let canned = self.driver.state.lock().unwrap().results.get(sql).cloned();
        let mut output = match canned {
            Some(output) => output,
            None if sql.starts_with("SELECT") => single_value(),
            None => StatementOutput::affected(1),
        };
        if let Some(limit) = fetch_limit {
            output.rows.truncate(limit);
        }
        Ok(output)
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.driver.record("begin", self.id, None)
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.driver.record("commit", self.id, None)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.driver.record("rollback", self.id, None)
    }

    async fn prepare_transaction(&mut self, gid: &str) -> DbResult<()> {
        self.driver.record("prepare", self.id, Some(gid))
    }

    async fn commit_prepared(&mut self, gid: &str) -> DbResult<()> {
        self.driver.record("commit_prepared", self.id, Some(gid))
    }

    async fn rollback_prepared(&mut self, gid: &str) -> DbResult<()> {
        self.driver.record("rollback_prepared", self.id, Some(gid))
    }

    async fn close(self) -> DbResult<()> {
        self.driver.record("close", self.id, None)
    }
}

/// Pool options that keep tests fast: no connect retries, tiny backoff.
pub fn test_options() -> PoolOptions {
    PoolOptions {
        min_idle: Some(2),
        max_total: Some(4),
        connect_retries: Some(0),
        connect_backoff_ms: Some(1),
    }
}

pub fn mock_pool(driver: &MockDriver, options: PoolOptions) -> Arc<ConnectionPool<MockDriver>> {
    Arc::new(ConnectionPool::new(driver.clone(), options).unwrap())
}

pub fn connection_lost() -> DbError {
    DbError::database("server closed the connection unexpectedly", None, "")
}
