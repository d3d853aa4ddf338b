//! Axum API server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reel_api::{create_router, metrics, ApiConfig, AppState, StoreBackend, TokenVerifier};
use reel_auth::{spawn_renewal, AuthConfig, AuthGuard, RenewalHandle, ServiceAccountProvider};
use reel_firestore::{FirestoreClient, FirestoreConfig, SessionRepository};
use reel_provider::HttpClipProvider;
use reel_reconcile::{
    FirestoreJobStore, JobService, JobStore, MemoryJobStore, ReconcileConfig, Reconciler,
};
use reel_storage::{PartPlanner, PlannerConfig, R2Client};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reel_api=info,reel_reconcile=info,reel_storage=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Session store for the configured backend, plus the token renewal task
/// that keeps Firestore credentials fresh.
async fn build_store(
    backend: StoreBackend,
    cancel: &CancellationToken,
) -> Result<(Arc<dyn JobStore>, Option<RenewalHandle>)> {
    match backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory session store; records are lost on restart");
            Ok((Arc::new(MemoryJobStore::new()), None))
        }
        StoreBackend::Firestore => {
            let provider = ServiceAccountProvider::from_environment()
                .await
                .context("Failed to load GCP credentials")?;
            let guard = Arc::new(AuthGuard::new(Arc::new(provider), AuthConfig::from_env()));
            let renewal = spawn_renewal(Arc::clone(&guard), cancel.child_token());

            let client = FirestoreClient::new(FirestoreConfig::from_env()?, guard)?;
            let repo = SessionRepository::from_env(client);
            Ok((Arc::new(FirestoreJobStore::new(repo)), Some(renewal)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // rustls 0.23 needs a process-wide crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    init_tracing();
    info!("Starting reel-api");

    let config = ApiConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    let cancel = CancellationToken::new();

    let storage = Arc::new(R2Client::from_env().context("Failed to configure object storage")?);
    let planner = PartPlanner::new(storage.clone(), PlannerConfig::from_env());

    let (store, renewal) = build_store(config.store_backend, &cancel).await?;
    let reconcile_config = ReconcileConfig::from_env();
    match reconcile_config.webhook_url.as_deref() {
        Some(url) => info!("Provider callbacks go to {}", url),
        None => warn!("PUBLIC_BASE_URL not set; jobs are observed by polling only"),
    }
    let engine = Arc::new(Reconciler::new(store, reconcile_config));
    let provider = HttpClipProvider::from_env().context("Failed to configure clip provider")?;
    let jobs = Arc::new(JobService::new(engine, Arc::new(provider)));

    let verifier = TokenVerifier::from_config(&config)?;
    if config.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET not set; provider webhooks are accepted unsigned");
    }

    let metrics_handle = if config.metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("Failed to install Prometheus recorder")?)
    } else {
        None
    };

    let state = AppState::new(config.clone(), planner, Arc::clone(&jobs), verifier)
        .with_storage(storage);
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    jobs.shutdown().await;
    cancel.cancel();
    if let Some(renewal) = renewal {
        renewal.shutdown().await;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
