//! HTTP server setup and routing
//!
//! Axum server exposing the split endpoints and the provider webhook
//! receivers. Webhook routes answer with the status codes the providers
//! key their retry behavior on, so nothing here may panic or hang.

use crate::error::{Error, Result};
use crate::notifier::NotifierHandle;
use crate::subscriptions::google::verifier::PurchaseVerifier;
use axum::{
    routing::{get, post, put},
    Router,
};
use crescendo_common::config::Config;
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application context passed to all handlers
///
/// **Note:** AppContext implements Clone, which gives us `FromRef<AppContext>`
/// for free via Axum's blanket implementation.
#[derive(Clone)]
pub struct AppContext {
    pub db: SqlitePool,
    pub config: Arc<Config>,
    pub notifier: NotifierHandle,
    pub verifier: Arc<dyn PurchaseVerifier>,
    pub http: reqwest::Client,
}

pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        // Royalty splits
        .route("/songs/:song_id/splits", get(super::handlers::get_splits))
        .route("/songs/:song_id/splits", put(super::handlers::put_splits))
        .route("/invitations/confirm", post(super::handlers::confirm_invitation))
        // Provider webhooks
        .route("/webhooks/apple", post(super::handlers::apple_webhook))
        .route("/webhooks/google", post(super::handlers::google_webhook))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run the HTTP server until shutdown
pub async fn run(ctx: AppContext) -> Result<()> {
    let port = ctx.config.port;
    let app = create_router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Upstream(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Upstream(format!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
