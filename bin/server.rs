// Produce Ledger - Web Server
// JSON API over the same database file the terminal UI uses

use anyhow::{Context, Result};
use clap::Parser;
use produce_ledger::config::{AppConfig, DEFAULT_CONFIG_FILE};
use produce_ledger::db::setup_database;
use produce_ledger::logging::init_logging;
use produce_ledger::users::count_users;
use produce_ledger::web::{router, AppState};
use rusqlite::Connection;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ledger-server")]
#[command(about = "HTTP API for the produce ledger", version)]
struct Args {
    /// Path to config.json
    #[arg(long, env = "PRODUCE_LEDGER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Listen address, overrides server_addr from the config
    #[arg(long)]
    addr: Option<String>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, origin) = AppConfig::load_or_init(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    init_logging(&config.log_dir, true)?;
    origin.log(&args.config);

    let conn = Connection::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    setup_database(&conn).context("Failed to set up database schema")?;
    info!(db = %config.database_path.display(), "Database opened");
    if count_users(&conn)? == 0 {
        warn!("No user accounts yet, POST /api/setup to create the first admin");
    }

    let addr = args.addr.unwrap_or_else(|| config.server_addr.clone());
    let app = router(AppState::new(conn, config).with_config_path(args.config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(%addr, "🚀 Server running, press Ctrl+C to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
