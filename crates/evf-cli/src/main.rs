use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evf_storage::PgStore;
use evf_sync::{SyncConfig, SyncEngine};
use evf_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "evf")]
#[command(about = "Event Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle against the configured discovery API.
    Sync,
    /// Create the database schema if it is missing.
    Migrate,
    /// Serve the JSON API, with the background sync scheduler when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let report = evf_sync::run_once_from_env().await?;
            println!(
                "sync complete: fetched={} inserted={} updated={} failed={}",
                report.fetched, report.inserted, report.updated, report.failed
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.bootstrap_schema().await.context("bootstrapping schema")?;
            println!("schema ready");
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            let store = Arc::new(
                PgStore::connect(&config.database_url)
                    .await
                    .context("connecting to database")?,
            );
            store.bootstrap_schema().await.context("bootstrapping schema")?;

            let _scheduler = if config.scheduler_enabled {
                let engine = Arc::new(SyncEngine::from_config(&config, store.clone())?);
                let scheduler = evf_sync::build_scheduler(engine, &config.sync_cron).await?;
                scheduler.start().await.context("starting sync scheduler")?;
                tracing::info!(cron = %config.sync_cron, "background sync scheduled");
                Some(scheduler)
            } else {
                None
            };

            let port = std::env::var("EVF_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let state = AppState {
                events: store.clone(),
                users: store,
            };
            evf_web::serve(state, port).await?;
        }
    }

    Ok(())
}
