// Futures executor
//
// Design Decision: The registry is built in code at startup; tasks are never
// discovered implicitly.
// Design Decision: Only the worker processes open database pools; the
// supervisor never connects.

mod tasks;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tpq_futures::cli::{self, ExecutorArgs};
use tpq_futures::telemetry::{init_tracing, TelemetryConfig};
use tpq_futures::worker::PostgresConnector;
use tpq_futures::FuturesConfig;

fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing(TelemetryConfig::from_env());

    let config = FuturesConfig::from_env();
    let args = ExecutorArgs::parse().with_config(&config);

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let registry = Arc::new(tasks::registry(args.queue_name()));
    tracing::info!(
        tasks = ?registry.task_names(),
        queue = %args.queue_name(),
        worker = args.worker,
        "futures-executor starting"
    );

    // Slot 0 (or a standalone run) applies pending migrations
    let connector = PostgresConnector::new(database_url, config.result_ttl)
        .with_max_connections(args.threads as u32 + 1)
        .with_migrations(args.worker_slot.unwrap_or(0) == 0);

    cli::run(args, registry, Arc::new(connector))
}
