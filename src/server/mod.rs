//! HTTP surface: router, shared state, and serving
//!
//! Routes, middleware, and the shared [`AppState`] every handler sees.
//! The compute multiplexer slot is filled (or left empty) at startup by
//! `main` and may be empty when running chat-only; handlers treat an
//! empty or dead multiplexer as "worker unavailable".

pub mod assets;
pub mod handlers;
pub mod rate_limit;
pub mod session_mw;
pub mod sse;

use std::sync::{Arc, RwLock};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::compute::Multiplexer;
use crate::config::Config;
use crate::error::Result;
use crate::images::ImageStore;
use crate::llm::ChatProvider;
use crate::server::rate_limit::RateLimiter;
use crate::server::sse::SseBroker;
use crate::session::{SessionStore, SessionStoreConfig};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Session store (conversations, settings)
    pub sessions: Arc<SessionStore>,
    /// SSE broker
    pub broker: Arc<SseBroker>,
    /// Generated-image store
    pub images: Arc<ImageStore>,
    /// Language-model backend
    pub provider: Arc<dyn ChatProvider>,
    /// Compute multiplexer; `None` until a worker connects
    pub compute: Arc<RwLock<Option<Arc<Multiplexer>>>>,
    /// Chat rate limiter
    pub chat_limiter: Arc<RateLimiter>,
    /// Generate rate limiter
    pub generate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Builds state from configuration and a provider.
    pub fn new(config: Config, provider: Arc<dyn ChatProvider>) -> Self {
        let store_config = SessionStoreConfig {
            max_sessions: config.limits.max_sessions,
            idle_timeout: std::time::Duration::from_secs(config.limits.session_idle_hours * 3600),
            ..Default::default()
        };
        let chat_limiter = Arc::new(RateLimiter::per_minute(
            config.limits.chat_per_minute,
            "You're sending messages too quickly. Give it a minute.",
        ));
        let generate_limiter = Arc::new(RateLimiter::per_minute(
            config.limits.generate_per_minute,
            "Too many generations at once. Give it a minute.",
        ));
        Self {
            sessions: Arc::new(SessionStore::new(store_config)),
            broker: SseBroker::new(config.limits.max_sse_connections),
            images: Arc::new(ImageStore::new(config.limits.image_store_bytes)),
            provider,
            compute: Arc::new(RwLock::new(None)),
            chat_limiter,
            generate_limiter,
            config: Arc::new(config),
        }
    }

    /// Installs (or clears) the compute multiplexer.
    pub fn set_compute(&self, mux: Option<Arc<Multiplexer>>) {
        *self.compute.write().expect("compute slot poisoned") = mux;
    }

    /// Returns the multiplexer if a worker is connected and its reader
    /// is alive.
    pub fn compute_mux(&self) -> Option<Arc<Multiplexer>> {
        self.compute
            .read()
            .expect("compute slot poisoned")
            .clone()
            .filter(|mux| !mux.is_dead())
    }
}

/// Assembles the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.limits.max_body_bytes;
    Router::new()
        .route("/", get(handlers::index))
        .route("/static/*file", get(handlers::static_file))
        .route("/events", get(handlers::events))
        .route("/chat", post(handlers::chat))
        .route("/prompt", post(handlers::prompt))
        .route("/generate", post(handlers::generate))
        .route("/new-chat", post(handlers::new_chat))
        .route("/images/:id", get(handlers::image))
        .route("/ready", get(handlers::ready))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            session_mw::session_cookie,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Binds the configured address and serves until `cancel` fires.
pub async fn serve(state: AppState, cancel: CancellationToken) -> Result<()> {
    let bind = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on http://{}", bind);
    serve_with_listener(state, listener, cancel).await
}

/// Serves on an already-bound listener until `cancel` fires.
///
/// Split out from [`serve`] so callers (and tests) can bind port 0 and
/// learn the actual address first.
pub async fn serve_with_listener(
    state: AppState,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
