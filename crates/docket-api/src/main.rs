//! docket server binary.
//!
//! Wires the store, services and background tasks, then serves the HTTP
//! front door until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket_api::{build_router, global_limiter, AppState};
use docket_audit::{AnomalyDetector, RetentionSweeper};
use docket_core::{defaults, system_clock, ConfigHandle, ConfigSnapshot, EventBus};
use docket_db::{Database, PoolConfig};
use docket_jobs::{
    AdaptiveCache, DocumentProcessingHandler, HttpDocumentStore, HttpProcessor, WorkerBuilder,
    WorkerConfig,
};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "docket=debug,docket_api=debug,docket_jobs=info,docket_audit=info,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("docket.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(log_ansi.unwrap_or(false)),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Store
    let db = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let db = Database::connect_with_config(&url, PoolConfig::from_env()).await?;
            db.migrate().await?;
            info!(subsystem = "db", "Connected to PostgreSQL and applied migrations");
            if let Some(pool) = db.pool() {
                docket_db::log_pool_metrics(pool);
            }
            db
        }
        Err(_) => {
            warn!(subsystem = "db", "DATABASE_URL not set, using in-memory store");
            Database::in_memory()
        }
    };

    let clock = system_clock();
    let config = ConfigHandle::new(ConfigSnapshot::from_env());
    let events = EventBus::default();

    let limiter = if env_or("GLOBAL_RATE_LIMIT_ENABLED", true) {
        let requests = env_or(
            "GLOBAL_RATE_LIMIT_REQUESTS",
            defaults::GLOBAL_RATE_LIMIT_REQUESTS,
        );
        let period = env_or(
            "GLOBAL_RATE_LIMIT_PERIOD_SECS",
            defaults::GLOBAL_RATE_LIMIT_PERIOD_SECS,
        );
        global_limiter(
            u32::try_from(requests).unwrap_or(u32::MAX),
            Duration::from_secs(period),
        )
    } else {
        None
    };
    let state = AppState::new(&db, config.clone(), events.clone(), clock.clone())
        .with_global_limiter(limiter);

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    background.push(state.scheduler.clone().spawn_reaper(
        Duration::from_secs(env_or(
            "JOB_REAPER_INTERVAL_SECS",
            defaults::JOB_REAPER_INTERVAL_SECS,
        )),
        shutdown_rx.clone(),
    ));

    let detector = Arc::new(AnomalyDetector::new(
        db.audit.clone(),
        state.alerts.clone(),
        config.clone(),
        clock.clone(),
    ));
    background.push(detector.spawn(
        Duration::from_secs(env_or(
            "DETECTOR_INTERVAL_SECS",
            defaults::DETECT_INTERVAL_SECS,
        )),
        shutdown_rx.clone(),
    ));

    let sweeper = Arc::new(RetentionSweeper::new(db.clone(), config.clone(), clock.clone()));
    background.push(sweeper.spawn(
        Duration::from_secs(env_or(
            "SWEEPER_INTERVAL_SECS",
            defaults::SWEEP_INTERVAL_SECS,
        )),
        shutdown_rx.clone(),
    ));

    // Worker pool
    let mut worker_config = WorkerConfig::from_env();
    let mut builder = WorkerBuilder::new(state.scheduler.clone());
    match (HttpDocumentStore::from_env()?, HttpProcessor::from_env()?) {
        (Some(store), Some(processor)) => {
            let cache = Arc::new(AdaptiveCache::new(
                db.cache.clone(),
                db.audit.clone(),
                config.clone(),
                clock.clone(),
            ));
            builder = builder.with_handlers(DocumentProcessingHandler::for_all_types(
                Arc::new(store),
                Arc::new(processor),
                cache,
            ));
        }
        _ => {
            warn!(
                subsystem = "jobs",
                "STORAGE_URL or PROCESSOR_URL not set, job worker disabled"
            );
            worker_config = worker_config.with_enabled(false);
        }
    }
    let worker = builder.with_config(worker_config).build().start();

    // Server
    let app = build_router(state);
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env_or("PORT", defaults::SERVER_PORT);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(subsystem = "api", %addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping background tasks");
    let _ = shutdown_tx.send(true);
    worker.stop().await;
    for task in background {
        if let Err(e) = task.await {
            warn!(error = ?e, "Background task ended abnormally");
        }
    }
    info!("Shutdown complete");
    Ok(())
}
