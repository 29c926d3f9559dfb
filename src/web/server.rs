//! Control-plane HTTP server.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers;
use crate::error::{HostError, HostResult};
use crate::host::PluginHost;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<PluginHost>,
}

/// Build the control-plane router.
pub fn build_router(host: Arc<PluginHost>) -> Router {
    let state = AppState { host };
    Router::new()
        .route("/plugins/installed", get(handlers::installed))
        .route("/plugins/updates", get(handlers::updates))
        .route("/plugins/stats", get(handlers::stats))
        .route("/plugins/health", get(handlers::health))
        .route("/plugins/health/:name", get(handlers::health_one))
        .route("/plugins/metrics", get(handlers::metrics))
        .route("/plugins/metrics/:name/reset", post(handlers::reset_metrics))
        .route(
            "/plugins/metrics/reset-all",
            post(handlers::reset_all_metrics),
        )
        .route("/plugins/conflicts", get(handlers::conflicts))
        .route(
            "/registry/plugins",
            get(handlers::registry_list).post(handlers::registry_publish),
        )
        .route(
            "/registry/plugins/:name/install",
            post(handlers::registry_install),
        )
        .route(
            "/registry/plugins/:name/update",
            post(handlers::registry_update),
        )
        .route("/registry/status", get(handlers::registry_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the control plane until the task is cancelled.
pub async fn serve(host: Arc<PluginHost>, addr: &str) -> HostResult<()> {
    let router = build_router(host);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(HostError::Io)?;
    info!(%addr, "control plane listening");
    axum::serve(listener, router)
        .await
        .map_err(|e| HostError::Internal(format!("http server error: {e}")))
}
