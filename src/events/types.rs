//! Event types for the plugin host bus.
//!
//! The bus carries a fixed enumeration of event kinds. Every event carries at
//! minimum `{type, pluginName, timestamp, source}`; anything else rides in the
//! JSON payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed enumeration of events the host can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "plugin.discovered")]
    Discovered,
    #[serde(rename = "plugin.loading.started")]
    LoadingStarted,
    #[serde(rename = "plugin.loading.progress")]
    LoadingProgress,
    #[serde(rename = "plugin.loaded")]
    Loaded,
    #[serde(rename = "plugin.load.failed")]
    LoadFailed,
    #[serde(rename = "plugin.unloaded")]
    Unloaded,
    #[serde(rename = "plugin.state.changed")]
    StateChanged,
    #[serde(rename = "plugin.dependency.resolved")]
    DependencyResolved,
    #[serde(rename = "plugin.dependency.failed")]
    DependencyFailed,
    #[serde(rename = "plugin.reloaded")]
    Reloaded,
    #[serde(rename = "plugin.validation.succeeded")]
    ValidationSucceeded,
    #[serde(rename = "plugin.validation.failed")]
    ValidationFailed,
    #[serde(rename = "plugin.security.violation")]
    SecurityViolation,
    #[serde(rename = "plugin.security.warning")]
    SecurityWarning,
    #[serde(rename = "plugin.performance")]
    Performance,
    #[serde(rename = "plugin.circuit-breaker")]
    CircuitBreaker,
    #[serde(rename = "plugin.cache")]
    Cache,
    #[serde(rename = "plugin.error")]
    Error,
    #[serde(rename = "plugin.guard.registered")]
    GuardRegistered,
    #[serde(rename = "plugin.guard.removed")]
    GuardRemoved,
    #[serde(rename = "registry.download.started")]
    RegistryDownloadStarted,
    #[serde(rename = "registry.download.completed")]
    RegistryDownloadCompleted,
    #[serde(rename = "registry.upload.completed")]
    RegistryUploadCompleted,
    #[serde(rename = "registry.update.available")]
    RegistryUpdateAvailable,
    #[serde(rename = "backpressure.activated")]
    Backpressure,
}

/// Static delivery priority. Lower sorts earlier when a batch flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Error,
    Security,
    State,
    Routine,
}

impl EventKind {
    /// Wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Discovered => "plugin.discovered",
            EventKind::LoadingStarted => "plugin.loading.started",
            EventKind::LoadingProgress => "plugin.loading.progress",
            EventKind::Loaded => "plugin.loaded",
            EventKind::LoadFailed => "plugin.load.failed",
            EventKind::Unloaded => "plugin.unloaded",
            EventKind::StateChanged => "plugin.state.changed",
            EventKind::DependencyResolved => "plugin.dependency.resolved",
            EventKind::DependencyFailed => "plugin.dependency.failed",
            EventKind::Reloaded => "plugin.reloaded",
            EventKind::ValidationSucceeded => "plugin.validation.succeeded",
            EventKind::ValidationFailed => "plugin.validation.failed",
            EventKind::SecurityViolation => "plugin.security.violation",
            EventKind::SecurityWarning => "plugin.security.warning",
            EventKind::Performance => "plugin.performance",
            EventKind::CircuitBreaker => "plugin.circuit-breaker",
            EventKind::Cache => "plugin.cache",
            EventKind::Error => "plugin.error",
            EventKind::GuardRegistered => "plugin.guard.registered",
            EventKind::GuardRemoved => "plugin.guard.removed",
            EventKind::RegistryDownloadStarted => "registry.download.started",
            EventKind::RegistryDownloadCompleted => "registry.download.completed",
            EventKind::RegistryUploadCompleted => "registry.upload.completed",
            EventKind::RegistryUpdateAvailable => "registry.update.available",
            EventKind::Backpressure => "backpressure.activated",
        }
    }

    /// Static priority used for batch ordering and batching bypass.
    pub fn priority(&self) -> EventPriority {
        match self {
            EventKind::Error | EventKind::LoadFailed | EventKind::DependencyFailed => {
                EventPriority::Error
            }
            EventKind::SecurityViolation | EventKind::SecurityWarning => EventPriority::Security,
            EventKind::StateChanged
            | EventKind::Loaded
            | EventKind::Unloaded
            | EventKind::Reloaded
            | EventKind::LoadingStarted
            | EventKind::Discovered => EventPriority::State,
            _ => EventPriority::Routine,
        }
    }

    /// High-priority events bypass batching entirely.
    pub fn bypasses_batching(&self) -> bool {
        matches!(self.priority(), EventPriority::Error | EventPriority::Security)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Plugin this event concerns; empty for host-level notices.
    pub plugin_name: String,
    /// Wall-clock time the event was created.
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event.
    pub source: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Set on events re-emitted by the batch flusher so they skip QoS layers.
    #[serde(skip)]
    pub(crate) replayed: bool,
}

impl PluginEvent {
    pub fn new(kind: EventKind, plugin_name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            plugin_name: plugin_name.into(),
            timestamp: Utc::now(),
            source: source.into(),
            payload: serde_json::Value::Null,
            replayed: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn replay(mut self) -> Self {
        self.replayed = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_dotted_convention() {
        assert_eq!(EventKind::Loaded.as_str(), "plugin.loaded");
        assert_eq!(EventKind::StateChanged.as_str(), "plugin.state.changed");
        assert_eq!(EventKind::Backpressure.as_str(), "backpressure.activated");
    }

    #[test]
    fn priorities_order_errors_first() {
        assert!(EventKind::Error.priority() < EventKind::SecurityViolation.priority());
        assert!(EventKind::SecurityViolation.priority() < EventKind::StateChanged.priority());
        assert!(EventKind::StateChanged.priority() < EventKind::LoadingProgress.priority());
    }

    #[test]
    fn high_priority_bypasses_batching() {
        assert!(EventKind::Error.bypasses_batching());
        assert!(EventKind::SecurityViolation.bypasses_batching());
        assert!(!EventKind::LoadingProgress.bypasses_batching());
    }
}
