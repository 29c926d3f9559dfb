//! Error handling for the plugin host.
//!
//! A single error type covers every failure the host can surface, so the
//! loader, the managers, and the control plane all speak the same taxonomy.
//! Per-plugin failures are contained by the loader; only critical-plugin
//! failures abort a host load.

use thiserror::Error;

/// Main error type for all plugin host operations.
#[derive(Debug, Error)]
pub enum HostError {
    // Manifest and discovery errors
    #[error("invalid manifest for '{plugin}': {reason}")]
    ManifestInvalid { plugin: String, reason: String },

    #[error("manifest not found at {path}")]
    ManifestMissing { path: String },

    // Dependency errors
    #[error("plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    DependencyMissing { plugin: String, dependency: String },

    #[error("circular dependency involving plugins: {plugins:?}")]
    DependencyCycle { plugins: Vec<String> },

    #[error("plugin '{plugin}' timed out after {timeout_ms}ms waiting for dependencies {pending:?}")]
    DependencyTimeout {
        plugin: String,
        pending: Vec<String>,
        timeout_ms: u64,
    },

    #[error("dependency '{dependency}' of plugin '{plugin}' failed to load")]
    DependencyFailed { plugin: String, dependency: String },

    // Guard errors
    #[error("guard '{guard}' requested by plugin '{plugin}' cannot be resolved: {reason}")]
    GuardUnresolvable {
        plugin: String,
        guard: String,
        reason: String,
    },

    #[error("circular guard dependency in plugin '{plugin}': {guards:?}")]
    GuardCircular { plugin: String, guards: Vec<String> },

    #[error("guard security violation: plugin '{plugin}' may not access guard '{guard}' of '{guard_source}'")]
    GuardSecurityViolation {
        plugin: String,
        guard: String,
        guard_source: String,
    },

    // Service errors
    #[error("service token collision for '{token}' between '{existing}' and '{plugin}'")]
    ServiceTokenCollision {
        token: String,
        existing: String,
        plugin: String,
    },

    // Lifecycle errors
    #[error("lifecycle hook '{hook}' of plugin '{plugin}' failed: {reason}")]
    LifecycleHookFailure {
        plugin: String,
        hook: String,
        reason: String,
    },

    #[error("lifecycle hook '{hook}' of plugin '{plugin}' timed out after {timeout_ms}ms")]
    LifecycleHookTimeout {
        plugin: String,
        hook: String,
        timeout_ms: u64,
    },

    #[error("invalid module declaration for plugin '{plugin}': {reason}")]
    ModuleInvalid { plugin: String, reason: String },

    #[error("illegal state transition for plugin '{plugin}': {from} -> {to}")]
    IllegalTransition {
        plugin: String,
        from: String,
        to: String,
    },

    // Circuit breaker / timeouts
    #[error("circuit open for plugin '{plugin}'")]
    CircuitOpen { plugin: String },

    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    OperationTimeout { operation: String, timeout_ms: u64 },

    // Registry errors
    #[error("registry unavailable: {reason}")]
    RegistryUnavailable { reason: String },

    #[error("plugin '{plugin}' not found in registry")]
    RegistryNotFound { plugin: String },

    #[error("invalid plugin package: {reason}")]
    RegistryInvalidPackage { reason: String },

    #[error("version conflict for plugin '{plugin}': {version} already published")]
    RegistryVersionConflict { plugin: String, version: String },

    // Event bus
    #[error("backpressure active for event type '{event_type}'")]
    BackpressureActive { event_type: String },

    // Load orchestration
    #[error("critical plugin '{plugin}' failed to load: {reason}")]
    CriticalPluginFailed { plugin: String, reason: String },

    #[error("plugin '{plugin}' not found")]
    PluginNotFound { plugin: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for host operations.
pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    /// Short machine-readable kind, used in events and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::ManifestInvalid { .. } => "manifest-invalid",
            HostError::ManifestMissing { .. } => "manifest-missing",
            HostError::DependencyMissing { .. } => "dependency-missing",
            HostError::DependencyCycle { .. } => "dependency-cycle",
            HostError::DependencyTimeout { .. } => "dependency-timeout",
            HostError::DependencyFailed { .. } => "dependency-failed",
            HostError::GuardUnresolvable { .. } => "guard-unresolvable",
            HostError::GuardCircular { .. } => "guard-circular",
            HostError::GuardSecurityViolation { .. } => "guard-security-violation",
            HostError::ServiceTokenCollision { .. } => "service-token-collision",
            HostError::LifecycleHookFailure { .. } => "lifecycle-hook-failure",
            HostError::LifecycleHookTimeout { .. } => "lifecycle-hook-timeout",
            HostError::ModuleInvalid { .. } => "module-invalid",
            HostError::IllegalTransition { .. } => "illegal-transition",
            HostError::CircuitOpen { .. } => "circuit-open",
            HostError::OperationTimeout { .. } => "operation-timeout",
            HostError::RegistryUnavailable { .. } => "registry-unavailable",
            HostError::RegistryNotFound { .. } => "registry-not-found",
            HostError::RegistryInvalidPackage { .. } => "registry-invalid-package",
            HostError::RegistryVersionConflict { .. } => "registry-version-conflict",
            HostError::BackpressureActive { .. } => "backpressure-active",
            HostError::CriticalPluginFailed { .. } => "critical-plugin-failed",
            HostError::PluginNotFound { .. } => "plugin-not-found",
            HostError::Io(_) => "io",
            HostError::Json(_) => "json",
            HostError::Http(_) => "http",
            HostError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = HostError::CircuitOpen {
            plugin: "auth".into(),
        };
        assert_eq!(err.kind(), "circuit-open");

        let err = HostError::DependencyCycle {
            plugins: vec!["x".into(), "y".into()],
        };
        assert_eq!(err.kind(), "dependency-cycle");
        assert!(err.to_string().contains("x"));
    }
}
