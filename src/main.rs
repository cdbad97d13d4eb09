//! jobqueue service.
//!
//! Loads configuration, prepares the database, submits the demo jobs and
//! runs the rank pools until a shutdown signal arrives.

use std::time::Duration;

use anyhow::{Context, Result};
use jobqueue::{demo, Config};
use jobqueue_core::storage::Storage;
use jobqueue_manager::Manager;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting jobqueue service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        rank_concurrency = %config.rank_concurrency,
        topic_scope = ?config.topic_scope,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    Storage::new(db_pool.clone()).migrate().await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let mut manager = Manager::postgres(db_pool.clone(), config.to_manager_config()?)
        .context("Failed to create job manager")?;
    demo::register_topics(&manager, Duration::from_secs(config.demo_processing_seconds)).await;

    for job in demo::jobs() {
        let topic = job.topic.clone();
        let job_id = manager.add(job).await.with_context(|| format!("Failed to add {topic} job"))?;
        info!(%job_id, %topic, "Job added");
    }

    let stats = manager.stats(demo::progress_filter()).await.context("Failed to read statistics")?;
    info!(
        queued = stats.queued,
        working = stats.working,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "Plan statistics"
    );

    if !demo::should_start(&stats) {
        info!("Plan jobs already in progress elsewhere, not starting workers");
        db_pool.close().await;
        return Ok(());
    }

    manager.start().await.context("Failed to start job manager")?;
    info!(workers = manager.config().total_workers(), "Workers started");

    shutdown_signal().await;
    info!("Shutdown signal received, waiting for in-flight jobs");

    if let Err(e) = manager.stop().await {
        error!(error = %e, "Graceful shutdown incomplete");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("jobqueue shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,jobqueue=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                Storage::new(pool.clone())
                    .health_check()
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
