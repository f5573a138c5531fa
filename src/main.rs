use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use galdex::config::AppConfig;
use galdex::jobs::{JobScheduler, Services, TracingEvents};
use galdex::models::Identity;
use galdex::services::merge::MergeResolver;
use galdex::services::offline_db::OfflineCatalog;
use galdex::services::people::Roster;
use galdex::services::sources::SourceRegistry;
use galdex::services::store::{MemoryStore, RecordStore};

/// Log what the engine is doing every 30 seconds until `shutdown` fires.
async fn log_job_status(scheduler: Arc<JobScheduler>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                for job in scheduler.active_jobs() {
                    tracing::info!(
                        "{} [{:?}] {}/{}",
                        job.title,
                        job.state,
                        job.progress.current,
                        job.progress.total
                    );
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "galdex=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = AppConfig::load();
    config
        .paths
        .ensure_dirs()
        .await
        .context("Failed to create application directories")?;
    config.log_config();

    let mut registry = SourceRegistry::new(config.merge.priority());
    if config.offline_enabled {
        let catalog = OfflineCatalog::new(config.offline_catalog.clone(), config.offline_min_score);
        if let Err(e) = catalog.preload().await {
            tracing::warn!("Offline catalog unavailable: {:#}", e);
        }
        registry.register(Arc::new(catalog));
    }
    if registry.is_empty() {
        tracing::warn!("No metadata providers registered; refresh jobs will find nothing");
    }

    let store = Arc::new(MemoryStore::new());
    let roster = Arc::new(Roster::with_people(
        store.people().await.context("Failed to load people")?,
    ));

    let services = Services {
        registry: Arc::new(registry),
        store,
        roster,
        resolver: Arc::new(MergeResolver::new(
            config.producer_table(),
            config.merge.developer_match_threshold,
        )),
        settings: config.engine.clone(),
        events: Arc::new(TracingEvents),
    };
    let scheduler = JobScheduler::new(services, config.paths.descriptor_path());

    match scheduler.resume_all().await {
        Ok(handles) if !handles.is_empty() => {
            tracing::info!("Resumed {} job(s) from last session", handles.len())
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to resume saved jobs: {}", e),
    }

    // Titles given on the command line are refreshed right away
    for title in std::env::args().skip(1) {
        if let Err(e) = scheduler.refresh(Uuid::new_v4(), Identity::named(title.clone())) {
            tracing::warn!("Could not start refresh for {:?}: {}", title, e);
        }
    }

    let shutdown = CancellationToken::new();
    let status_logger = tokio::spawn(log_job_status(scheduler.clone(), shutdown.clone()));

    // Create shutdown signal listener
    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };
    shutdown_signal.await;

    shutdown.cancel();
    if let Err(e) = status_logger.await {
        tracing::warn!("Job status logger panicked: {}", e);
    }

    // Unfinished jobs are picked up again on next start
    match scheduler.persist_all().await {
        Ok(0) => tracing::debug!("No unfinished jobs to save"),
        Ok(count) => tracing::info!("Saved {} unfinished job(s)", count),
        Err(e) => tracing::error!("Failed to save unfinished jobs: {}", e),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
