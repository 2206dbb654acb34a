use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flowline_core::FlowlineConfig;
use flowline_scheduler::{
    ExecutorConfig, HttpExecutionClient, ScheduledExecutor, SqliteScheduleStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "flowline-schedulerd",
    about = "Fire scheduled workflow executions, catching up after downtime"
)]
struct Args {
    /// Config file. Falls back to FLOWLINE_CONFIG, then ~/.flowline/flowline.toml.
    #[arg(long)]
    config: Option<String>,
    /// SQLite database path, overrides `database.path`.
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowline_schedulerd=info,flowline_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // explicit --config > FLOWLINE_CONFIG env > ~/.flowline/flowline.toml
    let config_path = args.config.or_else(|| std::env::var("FLOWLINE_CONFIG").ok());
    let mut config = FlowlineConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        FlowlineConfig::default()
    });
    if let Some(db) = args.db {
        config.database.path = db;
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteScheduleStore::new(db)?);

    let client = Arc::new(HttpExecutionClient::new(
        &config.admin.base_url,
        config.admin.token.clone(),
        Duration::from_secs(config.admin.request_timeout_secs.max(1)),
    )?);
    info!(admin = %config.admin.base_url, "execution API client ready");

    let executor = ScheduledExecutor::new(
        ExecutorConfig::from_config(&config),
        store.clone(),
        store,
        client,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received, shutting down");
                    cancel.cancel();
                }
                Err(e) => error!("failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    executor.run(cancel).await?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
