//! # Audience Sync Main Entry Point
//!
//! Runs the API server with both periodic jobs, or a single job run from the
//! command line.

use std::sync::Arc;

use anyhow::Context;
use audience_sync::{
    clock::SystemClock,
    config::{AppConfig, ConfigLoader},
    db,
    http_fetcher::ReqwestFetcher,
    server::{AppState, run_server},
    telemetry::init_tracing,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(version, about = "Custom audience background fetch and scheduled updates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the API and run both jobs on their ticks (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Run one background fetch and print its statistics
    FetchOnce,
    /// Perform the due scheduled updates once and print the statistics
    UpdateOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::info!(profile = %config.profile, config = %redacted_json, "Loaded configuration");
    }

    let config = Arc::new(config);
    let db = db::init_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            db::run_migrations(&db).await?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::FetchOnce => {
            let state = build_state(config, db).await?;
            let stats = state.background_fetch.run_background_fetch().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::UpdateOnce => {
            let state = build_state(config, db).await?;
            let stats = state.scheduled_updates.update_custom_audience().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Serve => serve(config, db).await,
    }
}

async fn build_state(
    config: Arc<AppConfig>,
    db: sea_orm::DatabaseConnection,
) -> anyhow::Result<AppState> {
    db::run_migrations(&db).await?;
    let fetcher = ReqwestFetcher::new(&config.fetcher).context("Failed to build HTTP client")?;
    Ok(AppState::build(
        config,
        db,
        Arc::new(fetcher),
        Arc::new(SystemClock),
    ))
}

async fn serve(config: Arc<AppConfig>, db: sea_orm::DatabaseConnection) -> anyhow::Result<()> {
    let state = build_state(config, db).await?;
    let shutdown = CancellationToken::new();

    let background_fetch = Arc::clone(&state.background_fetch);
    let fetch_shutdown = shutdown.clone();
    let fetch_loop = tokio::spawn(async move { background_fetch.run(fetch_shutdown).await });

    let scheduled_updates = Arc::clone(&state.scheduled_updates);
    let update_shutdown = shutdown.clone();
    let update_loop = tokio::spawn(async move { scheduled_updates.run(update_shutdown).await });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
        signal_shutdown.cancel();
    });

    let served = run_server(state, shutdown.clone()).await;
    shutdown.cancel();
    let _ = tokio::join!(fetch_loop, update_loop);
    served
}
