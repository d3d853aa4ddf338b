//! Upload one file through the upload worker and print its events as JSON lines.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reel_auth::{spawn_renewal, AuthConfig, AuthGuard, FirebaseRefreshProvider};
use reel_upload::{
    parse_delays, PlanClient, PresignedPartEndpoint, StartUpload, TransferEndpoint, TusEndpoint,
    UploadConfig, UploadEvent, UploadWorker,
};

#[derive(Parser, Debug)]
#[command(name = "reel-upload")]
#[command(about = "Upload a source video with resume and retry")]
struct Args {
    /// File to upload
    path: PathBuf,

    /// Upload id (defaults to the file name)
    #[arg(long)]
    id: Option<String>,

    /// tus creation endpoint
    #[arg(long, env = "UPLOAD_ENDPOINT", conflicts_with = "plan_url")]
    endpoint: Option<String>,

    /// Presigned plan API; uploads parts straight to object storage
    #[arg(long, env = "UPLOAD_PLAN_URL", requires = "session_id")]
    plan_url: Option<String>,

    /// Session the upload belongs to (presigned mode)
    #[arg(long)]
    session_id: Option<String>,

    /// Refresh token used to mint bearer credentials (presigned mode)
    #[arg(long, env = "REEL_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// Chunk size in bytes; ignored when the endpoint fixes one
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Comma-separated retry delays in milliseconds
    #[arg(long, value_name = "MS,MS,...")]
    retry_delays_ms: Option<String>,

    /// Extra request header, repeatable
    #[arg(long = "header", value_name = "NAME=VALUE")]
    headers: Vec<String>,

    /// Upload metadata entry, repeatable
    #[arg(long = "meta", value_name = "KEY=VALUE")]
    metadata: Vec<String>,

    /// Where tus upload URLs are kept between runs
    #[arg(
        long,
        env = "REEL_UPLOAD_RESUME_FILE",
        default_value = ".reel-upload/resume.json"
    )]
    resume_file: PathBuf,
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reel_upload=info"));

    // Events go to stdout; logs go to stderr.
    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .init();
    }
}

fn parse_pairs(pairs: &[String], what: &str) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("{} '{}' is not NAME=VALUE", what, pair))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = UploadConfig::from_env();
    let cancel = CancellationToken::new();

    let mut renewal = None;
    let endpoint: Arc<dyn TransferEndpoint> = match (&args.endpoint, &args.plan_url) {
        (Some(url), _) => Arc::new(
            TusEndpoint::new(url, config.request_timeout)?
                .with_resume_file(&args.resume_file)
                .await
                .context("failed to load the resume file")?,
        ),
        (None, Some(plan_url)) => {
            let auth_config = AuthConfig::from_env();
            let api_key = auth_config
                .firebase_api_key
                .clone()
                .context("FIREBASE_API_KEY is required for presigned uploads")?;
            let provider = FirebaseRefreshProvider::new(api_key, args.refresh_token.clone());
            let guard = Arc::new(AuthGuard::new(Arc::new(provider), auth_config));
            renewal = Some(spawn_renewal(guard.clone(), cancel.child_token()));

            let planner = Arc::new(PlanClient::new(plan_url, guard, config.request_timeout)?);
            let session_id = args
                .session_id
                .clone()
                .context("--session-id is required with --plan-url")?;
            Arc::new(PresignedPartEndpoint::new(
                planner,
                session_id,
                config.request_timeout,
            )?)
        }
        (None, None) => {
            return Err(anyhow!(
                "no upload target: pass --endpoint or --plan-url (or set UPLOAD_ENDPOINT)"
            ))
        }
    };

    let retry_delays = match &args.retry_delays_ms {
        Some(raw) => parse_delays(raw).context("--retry-delays-ms must be a comma list of integers")?,
        None => config.retry_delays.clone(),
    };

    let id = args.id.clone().unwrap_or_else(|| {
        args.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string()
    });

    let mut request = StartUpload::new(id.as_str(), args.path.clone(), endpoint)
        .with_retry_delays(retry_delays);
    request.headers = parse_pairs(&args.headers, "header")?;
    request.metadata = parse_pairs(&args.metadata, "metadata")?;
    request.chunk_size = args.chunk_size;

    let handle = UploadWorker::spawn();
    let mut events = handle.start_upload(request).await?;
    info!(upload_id = %id, path = %args.path.display(), "Upload started");

    let mut interrupted = false;
    let mut last: Option<UploadEvent> = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if event.is_terminal() {
                    last = Some(event);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(upload_id = %id, "Interrupted, cancelling upload");
                interrupted = true;
                handle.cancel_upload(events.upload_id()).await.ok();
            }
        }
    }

    cancel.cancel();
    if let Some(renewal) = renewal {
        renewal.shutdown().await;
    }

    match last {
        Some(UploadEvent::Succeeded { .. }) => Ok(()),
        Some(UploadEvent::Cancelled) => Err(anyhow!("upload cancelled")),
        Some(UploadEvent::Error { message }) => Err(anyhow!("upload failed: {}", message)),
        _ => Err(anyhow!("upload worker stopped unexpectedly")),
    }
}
