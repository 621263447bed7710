mod handlers;
mod routes;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use codegrade_common::config::EngineSettings;
use codegrade_engine::{limiter, ExecutionScheduler, InMemoryCatalog, LanguageRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Room for JSON escaping and the other request fields
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

pub struct AppState {
    pub scheduler: Arc<ExecutionScheduler>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("CODEGRADE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal, draining submissions...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Codegrade API booting...");

    let settings = EngineSettings::from_env()?;

    let languages_path = env_path("CODEGRADE_LANGUAGES", "config/languages.json");
    let registry = LanguageRegistry::load(&languages_path).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!("Loaded language configurations for: {:?}", registry.list_languages());

    let exercises_path = env_path("CODEGRADE_EXERCISES", "config/exercises.json");
    let catalog = InMemoryCatalog::load(&exercises_path)?;
    info!("Loaded {} exercises", catalog.len());

    let limiter = limiter::from_settings(&settings).context("Failed to initialize sandbox backend")?;
    info!(backend = ?settings.backend, network = ?settings.network_isolation, "Sandbox backend ready");

    let body_limit = settings.max_source_bytes * 2 + BODY_OVERHEAD_BYTES;
    let scheduler = Arc::new(ExecutionScheduler::start(
        settings,
        Arc::new(registry),
        Arc::new(catalog),
        limiter,
    ));

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
    });

    let app = Router::new()
        .merge(routes::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    let addr = std::env::var("CODEGRADE_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler.shutdown().await;
    info!("API shutdown complete");
    Ok(())
}
