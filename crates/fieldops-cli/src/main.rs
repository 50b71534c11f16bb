use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fieldops_client::HttpFieldServiceClient;
use fieldops_db::PgStore;
use fieldops_sync::{build_scheduler, SyncConfig, SyncEngine};
use fieldops_web::{AppState, DenyAllSessions};

#[derive(Debug, Parser)]
#[command(name = "fieldops")]
#[command(about = "Job reconciliation and metrics sync for the ops dashboards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation now and print the summary.
    Sync,
    /// Apply pending database migrations.
    Migrate,
    /// Serve the trigger endpoint (and the cron scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let (engine, _store, _config) = build_engine().await?;
            let summary = engine.run("manual").await?;
            println!(
                "sync complete: run_id={} processed={} created={} updated={} errors={}",
                summary.run_id,
                summary.jobs_processed,
                summary.jobs_created,
                summary.jobs_updated,
                summary.errors.len()
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pool = fieldops_db::connect(&config.database_url).await?;
            fieldops_db::run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let (engine, store, config) = build_engine().await?;

            if config.scheduler_enabled {
                let scheduler = build_scheduler(engine.clone(), &config.sync_cron).await?;
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "sync scheduler started");
            }

            let state = AppState {
                sync: engine,
                runs: store,
                shared_secret: config.shared_secret.clone(),
                sessions: Arc::new(DenyAllSessions),
            };
            fieldops_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}

async fn build_engine() -> Result<(Arc<SyncEngine>, Arc<PgStore>, SyncConfig)> {
    let config = SyncConfig::from_env()?;
    let pool = fieldops_db::connect(&config.database_url).await?;
    fieldops_db::run_migrations(&pool).await?;
    let store = Arc::new(PgStore::new(pool));
    let client = Arc::new(HttpFieldServiceClient::new(config.api.clone())?);
    let engine = Arc::new(SyncEngine::new(client, store.clone(), config.engine.clone()));
    Ok((engine, store, config))
}
