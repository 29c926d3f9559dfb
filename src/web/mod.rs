//! HTTP control plane for the plugin host.
//!
//! Thin axum surface over [`PluginHost`](crate::host::PluginHost): installed
//! plugins, health, circuit metrics, and registry proxy routes. Errors map
//! to `{message, details, timestamp}` JSON bodies with the status codes the
//! taxonomy prescribes (400 malformed input, 404 unknown plugin, 409 version
//! conflict, 503 downstream failure).

pub mod handlers;
pub mod server;

pub use server::{build_router, serve, AppState};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::HostError;

/// JSON error body returned by every control-plane endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: String::new(),
            timestamp: Utc::now(),
            plugin_name: None,
            suggestion: None,
            status: StatusCode::BAD_REQUEST,
        }
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        let (status, plugin_name, suggestion) = match &err {
            HostError::PluginNotFound { plugin } | HostError::RegistryNotFound { plugin } => (
                StatusCode::NOT_FOUND,
                Some(plugin.clone()),
                Some("check the plugin name against /plugins/installed".to_string()),
            ),
            HostError::RegistryVersionConflict { plugin, .. } => (
                StatusCode::CONFLICT,
                Some(plugin.clone()),
                Some("bump the plugin version before publishing".to_string()),
            ),
            HostError::ManifestInvalid { plugin, .. } => (
                StatusCode::BAD_REQUEST,
                Some(plugin.clone()),
                Some("fix the manifest and reload".to_string()),
            ),
            HostError::ManifestMissing { .. } | HostError::RegistryInvalidPackage { .. } => {
                (StatusCode::BAD_REQUEST, None, None)
            }
            HostError::RegistryUnavailable { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                None,
                Some("verify PLUGIN_REGISTRY_URL and registry health".to_string()),
            ),
            HostError::CircuitOpen { plugin } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(plugin.clone()),
                Some("reset the plugin's circuit via /plugins/metrics".to_string()),
            ),
            _ => (StatusCode::SERVICE_UNAVAILABLE, None, None),
        };
        Self {
            message: err.kind().to_string(),
            details: err.to_string(),
            timestamp: Utc::now(),
            plugin_name,
            suggestion,
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}
