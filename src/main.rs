//! Weave - desktop image-generation orchestrator
//!
//! Main entry point: loads configuration, brings up the compute worker,
//! and serves the HTTP surface until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use weave::cli::Cli;
use weave::compute::{self, ComputeConfig};
use weave::config::Config;
use weave::llm::create_provider;
use weave::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(|| "weave.yaml".to_string());
    let config = Config::load(&config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    let provider = create_provider(&config.provider)?;
    let state = AppState::new(config, provider);
    let cancel = CancellationToken::new();

    // Background maintenance loops exit with the server context.
    state.sessions.spawn_sweeper(cancel.clone());
    state
        .chat_limiter
        .spawn_sweeper(Duration::from_secs(5 * 60), cancel.clone());
    state
        .generate_limiter
        .spawn_sweeper(Duration::from_secs(5 * 60), cancel.clone());

    // Bring up the compute worker unless running chat-only. A missing
    // binary or unset XDG_RUNTIME_DIR is fatal: the desktop shell
    // treats a non-zero exit as a startup failure.
    let mut worker = None;
    if state.config.compute.disabled {
        tracing::warn!("compute worker disabled; image generation unavailable");
    } else {
        let compute_config = ComputeConfig {
            worker_path: state.config.compute.worker_path.clone(),
            accept_timeout: Duration::from_secs(state.config.compute.accept_timeout_secs),
            shutdown_timeout: Duration::from_secs(state.config.compute.shutdown_timeout_secs),
            max_payload: weave::compute::MAX_PAYLOAD_LEN,
        };
        let spawned = compute::spawn_worker(&compute_config).await?;
        state.set_compute(Some(Arc::clone(&spawned.mux)));
        worker = Some(spawned);
    }

    // Ctrl-C / SIGTERM ends the serve loop gracefully.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let serve_result = server::serve(state.clone(), cancel.clone()).await;

    // Teardown runs on every exit path: SSE streams end, the worker is
    // asked to exit and killed if it refuses, the socket dir is removed.
    cancel.cancel();
    state.broker.shutdown();
    state.set_compute(None);
    if let Some(worker) = worker {
        worker.teardown().await?;
    }

    serve_result
}

/// Initialize tracing subscriber with environment filter
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weave=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
