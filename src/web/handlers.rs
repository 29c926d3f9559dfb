//! HTTP handlers for the control-plane endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::server::AppState;
use super::ApiError;

/// Query parameter accepted by the health and metrics endpoints.
#[derive(Debug, Deserialize)]
pub struct PluginQuery {
    pub plugin: Option<String>,
}

/// `GET /plugins/installed`
pub async fn installed(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "plugins": state.host.installed() }))
}

/// `GET /plugins/updates`
pub async fn updates(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let updates = state.host.check_updates().await?;
    Ok(Json(json!({ "updates": updates })))
}

/// `GET /plugins/stats`
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.host.stats()))
}

/// `GET /plugins/health[?plugin=name]`
pub async fn health(
    State(state): State<AppState>,
    Query(query): Query<PluginQuery>,
) -> Json<Value> {
    Json(json!({ "health": state.host.health(query.plugin.as_deref()) }))
}

/// `GET /plugins/health/{name}`
pub async fn health_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut health = state.host.health(Some(&name));
    match health.pop() {
        Some(entry) if entry.state.is_some() => Ok(Json(json!(entry))),
        _ => Err(crate::error::HostError::PluginNotFound { plugin: name }.into()),
    }
}

/// `GET /plugins/metrics[?plugin=name]`
pub async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<PluginQuery>,
) -> Json<Value> {
    Json(json!({
        "circuits": state.host.metrics(query.plugin.as_deref()),
        "events": {
            "published": state.host.stats().events_published,
            "dropped": state.host.stats().events_dropped,
        },
    }))
}

/// `POST /plugins/metrics/{name}/reset`
pub async fn reset_metrics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<Value> {
    state.host.circuits().reset_plugin(&name);
    Json(json!({ "reset": name }))
}

/// `POST /plugins/metrics/reset-all`
pub async fn reset_all_metrics(State(state): State<AppState>) -> Json<Value> {
    state.host.circuits().reset_all();
    Json(json!({ "reset": "all" }))
}

/// `GET /plugins/conflicts`
pub async fn conflicts(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "conflicts": state.host.scan_conflicts() }))
}

/// `GET /registry/plugins`
pub async fn registry_list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let plugins = state.host.registry().list().await?;
    Ok(Json(json!({ "plugins": plugins })))
}

/// `POST /registry/plugins`: publish a local plugin directory.
pub async fn registry_publish(
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let Some(Json(body)) = body else {
        return Err(ApiError::bad_request("request body required"));
    };
    let Some(name) = body.get("name").and_then(|v| v.as_str()) else {
        return Err(ApiError::bad_request("missing plugin name"));
    };

    let dir = state.host.config().plugins_dir.join(name);
    if !dir.is_dir() {
        return Err(crate::error::HostError::PluginNotFound {
            plugin: name.to_string(),
        }
        .into());
    }
    let archive = crate::registry::pack_directory(&dir)?;
    let record = state.host.registry().upload(name, archive).await?;
    Ok(Json(json!({ "published": record })))
}

/// `POST /registry/plugins/{name}/install`
pub async fn registry_install(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.host.install_from_registry(&name).await?;
    Ok(Json(json!({ "installed": name })))
}

/// `POST /registry/plugins/{name}/update`
pub async fn registry_update(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.host.install_from_registry(&name).await?;
    Ok(Json(json!({ "updated": name })))
}

/// `GET /registry/status`
pub async fn registry_status(State(state): State<AppState>) -> Json<Value> {
    let available = state.host.registry().health().await;
    Json(json!({
        "available": available,
        "url": state.host.config().registry_url,
    }))
}
