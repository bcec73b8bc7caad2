use crate::broadcast::{BroadcastSettings, Broadcaster, CloseReason};
use crate::config::Config;
use crate::encoder::{EncoderStatus, EncoderSupervisor};
use crate::ingest::IngestSettings;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

pub mod routes_stats;
pub mod routes_stream;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Fan-out shared with the encoder ingest task
    pub broadcaster: Broadcaster,
    /// Encoder supervisor status (stays `Stopped` when the encoder is disabled)
    pub encoder: watch::Receiver<EncoderStatus>,
}

impl AppContext {
    /// Context with a fresh broadcaster and no encoder attached.
    pub fn new(config: Config) -> Self {
        let broadcaster = Broadcaster::new(BroadcastSettings::from(&config.stream));
        let (_, encoder) = watch::channel(EncoderStatus::default());
        Self {
            config: Arc::new(config),
            broadcaster,
            encoder,
        }
    }

    pub fn with_encoder(mut self, encoder: watch::Receiver<EncoderStatus>) -> Self {
        self.encoder = encoder;
        self
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext, static_dir: Option<PathBuf>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::RANGE])
        .expose_headers([header::CONTENT_TYPE]);

    let mut app = Router::new()
        // Health check
        .route("/health", get(health_check))
        .merge(routes_stream::stream_routes())
        .merge(routes_stats::stats_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);

    // Serve the player page and its assets if a directory is configured
    if let Some(dir) = static_dir {
        if dir.exists() {
            tracing::info!("Serving static files from {:?}", dir);
            let index_path = dir.join("index.html");
            app = app.fallback_service(
                ServeDir::new(&dir)
                    .append_index_html_on_directories(true)
                    .not_found_service(ServeFile::new(index_path)),
            );
        }
    }

    app
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Start the encoder supervisor (if enabled) and the HTTP server.
///
/// Runs until Ctrl+C or SIGTERM. On shutdown the encoder is stopped and every
/// viewer stream is ended so open connections can drain.
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let cancel = CancellationToken::new();
    let mut ctx = AppContext::new(config.clone());

    let supervisor_handle = if config.encoder.enabled {
        let supervisor = EncoderSupervisor::new(
            config.encoder.clone(),
            IngestSettings::from(&config.stream),
            ctx.broadcaster.clone(),
        );
        ctx = ctx.with_encoder(supervisor.status());
        Some(tokio::spawn(supervisor.run(cancel.clone())))
    } else {
        tracing::warn!("Encoder disabled; /stream will wait for an init segment that never comes");
        None
    };

    let broadcaster = ctx.broadcaster.clone();
    let app = create_router(ctx, config.server.static_dir.clone());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
            let closed = broadcaster.disconnect_all(CloseReason::Shutdown);
            tracing::info!(closed, "Closed viewer streams");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    cancel.cancel();
    if let Some(handle) = supervisor_handle {
        if let Err(e) = handle.await {
            tracing::error!("Encoder supervisor task failed: {}", e);
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
