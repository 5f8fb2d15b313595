//! db-tx-adapter - run one unit of work inside a managed transaction.
//!
//! Executes a statement batch (or lists tables / describes a table), then
//! commits through the two-phase hooks, and prints the outcome as JSON on
//! stdout. Logs go to stderr.

use std::sync::Arc;

use clap::Parser;
use db_tx_adapter::config::{Config, DataSource};
use db_tx_adapter::db::{ConnectionPool, Driver, PostgresDriver, Session, SqliteDriver};
use db_tx_adapter::error::{DbError, DbResult};
use db_tx_adapter::models::{DatabaseType, QueryRequest, TransactionState, mask_connection_string};
use serde_json::{Value as JsonValue, json};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// The statements given on the command line, each possibly NUL-separated.
fn build_request(config: &Config) -> DbResult<QueryRequest> {
    let statements: Vec<String> = config
        .statements
        .iter()
        .flat_map(|s| QueryRequest::from_batch(s).statements)
        .collect();
    let request = QueryRequest::from_statements(statements).with_max_rows(config.max_rows);
    if request.is_empty() {
        return Err(DbError::invalid_input(
            "nothing to do: pass --execute, --tables or --columns",
        ));
    }
    Ok(request)
}

async fn unit_of_work<D: Driver>(session: &mut Session<D>, config: &Config) -> DbResult<JsonValue> {
    if config.tables {
        let tables = session.tables(None).await?;
        return Ok(json!({ "tables": tables }));
    }
    if let Some(table) = &config.columns {
        let columns = session.columns(table).await?;
        return Ok(json!({ "table": table, "columns": columns }));
    }
    let request = build_request(config)?;
    let result = session.query(&request).await?;
    serde_json::to_value(result).map_err(|e| DbError::internal(e.to_string()))
}

async fn run<D: Driver>(driver: D, source: DataSource, config: &Config) -> DbResult<JsonValue> {
    let pool = Arc::new(ConnectionPool::new(driver, source.pool_options)?);
    let mut session = Session::new(
        pool.clone(),
        config.session_settings(),
        config.session_key.clone(),
    )?
    .with_row_limit_policy(config.row_limit_policy);

    session.open().await?;
    session.begin().await?;

    let outcome = tokio::select! {
        outcome = unit_of_work(&mut session, config) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, rolling back");
            Err(DbError::internal("interrupted"))
        }
    };

    let result = match outcome {
        Ok(output) if config.rollback => {
            session.abort().await;
            Ok((output, TransactionState::RolledBack))
        }
        Ok(output) => match session.commit().await {
            Ok(()) => session.finish().await.map(|state| (output, state)),
            Err(e) => {
                session.abort().await;
                Err(e)
            }
        },
        Err(e) => {
            session.abort().await;
            Err(e)
        }
    };

    let key = session.key().to_string();
    let (calls, failures) = (session.calls(), session.failures());
    session.close().await;
    pool.evict_all(None).await;

    let (output, state) = result?;
    Ok(json!({
        "key": key,
        "state": state,
        "calls": calls,
        "failures": failures,
        "result": output,
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let source = config.data_source()?;
    info!(
        db_type = %source.database_type,
        database = %mask_connection_string(&source.connection_string),
        "Starting db-tx-adapter v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = match source.database_type {
        DatabaseType::PostgreSQL => {
            let driver = PostgresDriver::new(&source.connection_string)?;
            run(driver, source, &config).await
        }
        DatabaseType::SQLite => {
            let driver = SqliteDriver::new(&source.connection_string)?;
            run(driver, source, &config).await
        }
    };

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, retry_hint = ?e.retry_hint(), "Unit of work failed");
            Err(e.into())
        }
    }
}
