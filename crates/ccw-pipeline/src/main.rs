//! CCW pipeline - Main entry point

use anyhow::{Context, Result};
use ccw_common::logging::{init_logging, LogConfig};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ccw_pipeline::{
    clock::SystemClock,
    config::{Config, DatabaseConfig},
    gateway::ObjectStoreGateway,
    loader::DryRunLoader,
    prevalidate::PreValidator,
    queue::{DataSetQueue, QueueSettings},
    reporter::TracingStatusReporter,
    runner::JobRunner,
    status::{ManifestStatus, ManifestStatusStore, PgStatusStore},
    storage::S3Storage,
    JobOutcome, LoadJobParts, LoadJobSettings, RifLoadJob,
};

#[derive(Parser)]
#[command(name = "ccw-pipeline", version, about = "Loads RIF data sets from S3")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll for data sets until interrupted
    Run,
    /// Run a single load cycle; exits 0 when a data set was loaded, 1 otherwise
    RunOnce,
    /// Show tracked manifests, newest first
    Status {
        /// Only show manifests in this status
        #[arg(long)]
        status: Option<ManifestStatus>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("ccw-pipeline")
        .filter_directives("ccw_pipeline=debug,sqlx=warn,aws_config=warn")
        .build();
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };
    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    let code = match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            1
        }
    };

    // Flush the file writer before exiting.
    drop(guard);
    process::exit(code);
}

async fn execute(command: Command) -> Result<i32> {
    let config = Config::load().context("Invalid configuration")?;
    let pool = connect(&config.database).await?;

    match command {
        Command::Migrate => {
            migrate(&pool).await?;
            Ok(0)
        }
        Command::Status { status, limit } => {
            let store = PgStatusStore::new(pool);
            for record in store.list(status, limit).await? {
                println!(
                    "{:<10} {}  started={}  completed={}",
                    record.status.as_str(),
                    record.manifest_key,
                    record.started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                    record.completed_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                );
            }
            Ok(0)
        }
        Command::RunOnce => {
            migrate(&pool).await?;
            let job = build_job(&config, pool).await?;
            let outcome = job.call().await;
            job.close();
            match outcome? {
                JobOutcome::WorkDone => Ok(0),
                JobOutcome::NoWork => Ok(1),
            }
        }
        Command::Run => {
            migrate(&pool).await?;
            let job = Arc::new(build_job(&config, pool).await?);
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    shutdown_signal().await;
                    shutdown.cancel();
                }
            });

            let summary = JobRunner::new(job, config.job.poll_interval())
                .run(shutdown)
                .await;
            info!(
                data_sets_loaded = summary.data_sets_loaded,
                "Pipeline shut down gracefully"
            );
            Ok(0)
        }
    }
}

async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await
        .context("Failed to connect to the database")?;

    info!("Database connection pool established");
    Ok(pool)
}

async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");
    Ok(())
}

async fn build_job(config: &Config, pool: PgPool) -> Result<RifLoadJob> {
    let storage = S3Storage::new(config.storage.clone()).await?;
    info!(bucket = %config.storage.bucket, "Storage client initialized");

    let gateway = Arc::new(ObjectStoreGateway::new(
        Arc::new(storage),
        config.job.transfer_concurrency,
        &config.job.download_dir,
    )?);
    let store: Arc<dyn ManifestStatusStore> = Arc::new(PgStatusStore::new(pool.clone()));
    let clock = Arc::new(SystemClock);
    let filter = config.job.filter();

    let queue = Arc::new(DataSetQueue::new(
        clock.clone(),
        store.clone(),
        gateway.clone(),
        QueueSettings {
            locations: config.job.locations(),
            filter: filter.clone(),
            claim_timeout: config.job.claim_timeout(),
            track_unrelocated: config.job.relocate_completed,
        },
    ));

    let validator = if config.job.synthetic_enabled && config.job.prevalidation_enabled {
        PreValidator::synthea(pool)
    } else {
        PreValidator::NoOp
    };
    info!(validator = validator.name(), "Pre-validator selected");

    Ok(RifLoadJob::new(
        LoadJobSettings {
            await_data_timeout: config.job.await_data_timeout(),
            await_data_poll_interval: config.job.await_data_poll_interval(),
            heartbeat_interval: config.job.heartbeat_interval(),
            relocate_completed: config.job.relocate_completed,
            filter,
        },
        LoadJobParts {
            queue,
            gateway,
            store,
            clock,
            validator,
            loader: Arc::new(DryRunLoader),
            reporter: Arc::new(TracingStatusReporter),
        },
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
