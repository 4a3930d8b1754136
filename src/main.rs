//! Carelink integration service.
//!
//! Main entry point. Loads configuration, opens storage, wires the sync
//! orchestrator to the webhook dispatcher and runs the scheduler and the
//! webhook sweeper until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use carelink::{Config, StorageBackend};
use carelink_core::{
    storage::postgres, Clock, EventHandler, IntegrationStore, MemoryStore, MulticastEventHandler,
    PostgresStore, RealClock,
};
use carelink_sync::{AdapterRegistry, SyncOrchestrator, SyncScheduler};
use carelink_webhooks::{SyncEventSubscriber, WebhookClient, WebhookDispatcher, WebhookSweeper};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!("Starting Carelink integration service");
    info!(
        storage_backend = ?config.storage_backend,
        scheduler_tick_seconds = config.scheduler_tick_seconds,
        webhook_sweep_seconds = config.webhook_sweep_seconds,
        "Configuration loaded"
    );

    let (store, db_pool): (Arc<dyn IntegrationStore>, Option<sqlx::PgPool>) =
        match config.storage_backend {
            StorageBackend::Memory => {
                warn!("Using in-memory storage; state is lost on restart");
                (Arc::new(MemoryStore::new()), None)
            },
            StorageBackend::Postgres => {
                info!(database_url = %config.database_url_masked(), "Connecting to database");
                let pool = create_database_pool(&config).await?;
                info!("Database connection pool established");

                postgres::run_migrations(&pool).await.context("Failed to bootstrap schema")?;
                info!("Database schema ready");

                (Arc::new(PostgresStore::new(pool.clone())), Some(pool))
            },
        };

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let client = WebhookClient::new(config.to_client_config())
        .context("Failed to build webhook client")?;
    let dispatcher = Arc::new(WebhookDispatcher::new(
        store.clone(),
        client,
        clock.clone(),
        config.to_dispatcher_config(),
    ));

    let mut events = MulticastEventHandler::new();
    events.add_subscriber(Arc::new(SyncEventSubscriber::new(dispatcher.clone())));
    let events: Arc<dyn EventHandler> = Arc::new(events);

    let registry = AdapterRegistry::with_defaults(config.to_adapter_settings(), clock.clone());
    let orchestrator = Arc::new(SyncOrchestrator::new(
        store,
        registry,
        events,
        clock.clone(),
        config.to_orchestrator_config(),
    ));

    let recovered = orchestrator
        .recover_interrupted_syncs()
        .await
        .context("Failed to recover interrupted syncs")?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "Integrations left syncing were moved to error");
    }

    let cancellation_token = CancellationToken::new();
    let scheduler_handle = SyncScheduler::new(
        orchestrator,
        clock.clone(),
        config.scheduler_tick(),
        cancellation_token.clone(),
    )
    .spawn();
    let sweeper_handle = WebhookSweeper::new(
        dispatcher,
        clock,
        config.webhook_sweep_interval(),
        cancellation_token.clone(),
    )
    .spawn();

    info!("Carelink is running");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");
    cancellation_token.cancel();

    // In-flight passes finish before the drivers exit.
    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        if let Err(e) = scheduler_handle.await {
            error!(error = %e, "Sync scheduler task failed");
        }
        if let Err(e) = sweeper_handle.await {
            error!(error = %e, "Webhook sweeper task failed");
        }
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown grace period expired");
    }

    if let Some(pool) = db_pool {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("Carelink shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter.
///
/// `RUST_LOG` reaches the filter through the `rust_log` configuration key.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(&config.rust_log).context("Invalid log filter")?;

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
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                PostgresStore::new(pool.clone())
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
        () = ctrl_c => {},
        () = terminate => {},
    }
}
