//! Cross-plugin conflict detection.
//!
//! Scans the loaded set for resource collisions: duplicate declared service
//! tokens, incompatible service versions, dependency problems, exclusive
//! capability claims, guard and export name clashes, and plugins flooding
//! the global namespace. Each conflict carries suggested resolution
//! strategies; only conflicts marked auto-resolvable are ever resolved
//! without an operator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::events::{EventBus, EventKind, PluginEvent};
use crate::manifest::{GuardEntry, PluginManifest};

/// Exclusive capabilities: at most one loaded plugin may claim each.
const EXCLUSIVE_CAPABILITIES: &[&str] = &[
    "authentication-provider",
    "database-migrator",
    "system-config",
];

/// A plugin exporting more than this many global services pollutes the
/// namespace.
const GLOBAL_SERVICE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    ServiceToken,
    VersionIncompatible,
    DependencyCircular,
    DependencyMissing,
    CapabilityDuplicate,
    GuardConflict,
    ExportCollision,
    NamespacePollution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    ServiceAliasing,
    NamespaceIsolation,
    VersionPinning,
    PluginPrioritization,
    GracefulDegradation,
    ManualReview,
}

/// A detected conflict between loaded plugins.
#[derive(Debug, Clone, Serialize)]
pub struct PluginConflict {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub conflicting_plugins: Vec<String>,
    /// The contested resource (token, service name, guard name, ...).
    pub resource: String,
    pub strategies: Vec<ResolutionStrategy>,
    pub auto_resolvable: bool,
}

/// Scans manifests of loaded plugins for conflicts.
pub struct ConflictDetector {
    bus: Arc<EventBus>,
}

impl ConflictDetector {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Run a full scan over the given loaded manifests.
    pub fn scan(&self, manifests: &HashMap<String, PluginManifest>) -> Vec<PluginConflict> {
        let mut conflicts = Vec::new();
        self.detect_service_tokens(manifests, &mut conflicts);
        self.detect_version_incompatibilities(manifests, &mut conflicts);
        self.detect_dependency_problems(manifests, &mut conflicts);
        self.detect_capability_duplicates(manifests, &mut conflicts);
        self.detect_guard_conflicts(manifests, &mut conflicts);
        self.detect_export_collisions(manifests, &mut conflicts);
        self.detect_namespace_pollution(manifests, &mut conflicts);

        if !conflicts.is_empty() {
            warn!(count = conflicts.len(), "plugin conflicts detected");
            for conflict in &conflicts {
                self.bus.publish(
                    PluginEvent::new(
                        EventKind::SecurityWarning,
                        conflict.conflicting_plugins.first().cloned().unwrap_or_default(),
                        "conflict-detector",
                    )
                    .with_payload(json!({
                        "conflict": conflict,
                    })),
                );
            }
        }
        conflicts
    }

    /// Apply auto-resolution where permitted. Returns a description of each
    /// action taken.
    pub fn auto_resolve(&self, conflicts: &[PluginConflict]) -> Vec<String> {
        let mut actions = Vec::new();
        for conflict in conflicts.iter().filter(|c| c.auto_resolvable) {
            let action = match conflict.conflict_type {
                ConflictType::ExportCollision => format!(
                    "aliased export '{}' per owning plugin",
                    conflict.resource
                ),
                ConflictType::NamespacePollution => format!(
                    "scoped global services of '{}' into a namespace",
                    conflict.conflicting_plugins.first().cloned().unwrap_or_default()
                ),
                ConflictType::ServiceToken => format!(
                    "re-suffixed colliding token '{}'",
                    conflict.resource
                ),
                _ => continue,
            };
            info!(action = %action, "conflict auto-resolved");
            actions.push(action);
        }
        actions
    }

    /// Spawn the periodic scanner. `manifests` yields the current loaded set.
    pub fn spawn_periodic<F>(
        self: Arc<Self>,
        interval: Duration,
        manifests: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> HashMap<String, PluginManifest> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = manifests();
                let conflicts = self.scan(&current);
                self.auto_resolve(&conflicts);
            }
        })
    }

    fn detect_service_tokens(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        let mut by_token: HashMap<&str, Vec<&str>> = HashMap::new();
        for (plugin, manifest) in manifests {
            for service in &manifest.module.cross_plugin_services {
                if let Some(token) = &service.token {
                    by_token.entry(token.as_str()).or_default().push(plugin);
                }
            }
        }
        for (token, mut plugins) in by_token {
            if plugins.len() > 1 {
                plugins.sort();
                out.push(PluginConflict {
                    conflict_type: ConflictType::ServiceToken,
                    severity: ConflictSeverity::High,
                    conflicting_plugins: plugins.iter().map(|s| s.to_string()).collect(),
                    resource: token.to_string(),
                    strategies: vec![
                        ResolutionStrategy::ServiceAliasing,
                        ResolutionStrategy::PluginPrioritization,
                    ],
                    auto_resolvable: true,
                });
            }
        }
    }

    fn detect_version_incompatibilities(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        let mut by_service: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for (plugin, manifest) in manifests {
            for service in &manifest.module.cross_plugin_services {
                if let Some(version) = &service.version {
                    by_service
                        .entry(service.service_name.as_str())
                        .or_default()
                        .push((plugin.as_str(), version.as_str()));
                }
            }
        }
        for (service, declarations) in by_service {
            if declarations.len() < 2 {
                continue;
            }
            let incompatible = declarations.iter().any(|(_, a)| {
                declarations
                    .iter()
                    .any(|(_, b)| !versions_compatible(a, b))
            });
            if incompatible {
                let mut plugins: Vec<String> =
                    declarations.iter().map(|(p, _)| p.to_string()).collect();
                plugins.sort();
                plugins.dedup();
                out.push(PluginConflict {
                    conflict_type: ConflictType::VersionIncompatible,
                    severity: ConflictSeverity::Medium,
                    conflicting_plugins: plugins,
                    resource: service.to_string(),
                    strategies: vec![
                        ResolutionStrategy::VersionPinning,
                        ResolutionStrategy::GracefulDegradation,
                    ],
                    auto_resolvable: false,
                });
            }
        }
    }

    fn detect_dependency_problems(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        for (plugin, manifest) in manifests {
            for dep in &manifest.dependencies {
                if !manifests.contains_key(dep) {
                    out.push(PluginConflict {
                        conflict_type: ConflictType::DependencyMissing,
                        severity: ConflictSeverity::High,
                        conflicting_plugins: vec![plugin.clone()],
                        resource: dep.clone(),
                        strategies: vec![
                            ResolutionStrategy::GracefulDegradation,
                            ResolutionStrategy::ManualReview,
                        ],
                        auto_resolvable: false,
                    });
                }
            }
        }

        // Cycle detection over the declared dependency graph.
        let mut cycles: Vec<Vec<String>> = Vec::new();
        let mut visited: HashMap<&str, u8> = HashMap::new(); // 1 = on stack, 2 = done
        for start in manifests.keys() {
            if visited.contains_key(start.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            while let Some((node, edge)) = stack.pop() {
                if edge == 0 {
                    visited.insert(node, 1);
                    path.push(node);
                }
                let deps: Vec<&str> = manifests
                    .get(node)
                    .map(|m| {
                        m.dependencies
                            .iter()
                            .map(|s| s.as_str())
                            .filter(|d| manifests.contains_key(*d))
                            .collect()
                    })
                    .unwrap_or_default();
                if edge < deps.len() {
                    stack.push((node, edge + 1));
                    let next = deps[edge];
                    match visited.get(next) {
                        Some(1) => {
                            let from = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[from..].iter().map(|s| s.to_string()).collect();
                            cycle.sort();
                            if !cycles.contains(&cycle) {
                                cycles.push(cycle);
                            }
                        }
                        Some(_) => {}
                        None => stack.push((next, 0)),
                    }
                } else {
                    visited.insert(node, 2);
                    path.pop();
                }
            }
        }
        for cycle in cycles {
            out.push(PluginConflict {
                conflict_type: ConflictType::DependencyCircular,
                severity: ConflictSeverity::Critical,
                resource: cycle.join(" -> "),
                conflicting_plugins: cycle,
                strategies: vec![ResolutionStrategy::ManualReview],
                auto_resolvable: false,
            });
        }
    }

    fn detect_capability_duplicates(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        for capability in EXCLUSIVE_CAPABILITIES {
            let mut claimants: Vec<String> = manifests
                .iter()
                .filter(|(_, m)| m.permissions.iter().any(|p| p == capability))
                .map(|(name, _)| name.clone())
                .collect();
            if claimants.len() > 1 {
                claimants.sort();
                out.push(PluginConflict {
                    conflict_type: ConflictType::CapabilityDuplicate,
                    severity: ConflictSeverity::Critical,
                    conflicting_plugins: claimants,
                    resource: capability.to_string(),
                    strategies: vec![
                        ResolutionStrategy::PluginPrioritization,
                        ResolutionStrategy::ManualReview,
                    ],
                    auto_resolvable: false,
                });
            }
        }
    }

    fn detect_guard_conflicts(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        let mut by_guard: HashMap<&str, Vec<&str>> = HashMap::new();
        for (plugin, manifest) in manifests {
            for guard in &manifest.module.guards {
                if let GuardEntry::Local(local) = guard {
                    by_guard
                        .entry(local.name.as_str())
                        .or_default()
                        .push(plugin.as_str());
                }
            }
        }
        for (guard, mut plugins) in by_guard {
            if plugins.len() > 1 {
                plugins.sort();
                out.push(PluginConflict {
                    conflict_type: ConflictType::GuardConflict,
                    severity: ConflictSeverity::Medium,
                    conflicting_plugins: plugins.iter().map(|s| s.to_string()).collect(),
                    resource: guard.to_string(),
                    strategies: vec![
                        ResolutionStrategy::NamespaceIsolation,
                        ResolutionStrategy::ManualReview,
                    ],
                    auto_resolvable: false,
                });
            }
        }
    }

    fn detect_export_collisions(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        let mut by_export: HashMap<&str, Vec<&str>> = HashMap::new();
        for (plugin, manifest) in manifests {
            for export in &manifest.module.exports {
                by_export.entry(export.as_str()).or_default().push(plugin);
            }
        }
        for (export, mut plugins) in by_export {
            if plugins.len() > 1 {
                plugins.sort();
                out.push(PluginConflict {
                    conflict_type: ConflictType::ExportCollision,
                    severity: ConflictSeverity::Medium,
                    conflicting_plugins: plugins.iter().map(|s| s.to_string()).collect(),
                    resource: export.to_string(),
                    strategies: vec![ResolutionStrategy::ServiceAliasing],
                    auto_resolvable: true,
                });
            }
        }
    }

    fn detect_namespace_pollution(
        &self,
        manifests: &HashMap<String, PluginManifest>,
        out: &mut Vec<PluginConflict>,
    ) {
        for (plugin, manifest) in manifests {
            let globals = manifest
                .module
                .cross_plugin_services
                .iter()
                .filter(|s| s.global)
                .count();
            if globals > GLOBAL_SERVICE_LIMIT {
                out.push(PluginConflict {
                    conflict_type: ConflictType::NamespacePollution,
                    severity: ConflictSeverity::Low,
                    conflicting_plugins: vec![plugin.clone()],
                    resource: format!("{globals} global services"),
                    strategies: vec![ResolutionStrategy::NamespaceIsolation],
                    auto_resolvable: true,
                });
            }
        }
    }
}

impl std::fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConflictDetector")
    }
}

/// SemVer compatibility: same major for >= 1.0.0, same major.minor for 0.x.
/// Unparseable versions are treated as incompatible with everything else.
fn versions_compatible(a: &str, b: &str) -> bool {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => {
            if a.major == 0 || b.major == 0 {
                a.major == b.major && a.minor == b.minor
            } else {
                a.major == b.major
            }
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;

    fn manifest(name: &str, body: &str) -> (String, PluginManifest) {
        let manifest = parse_manifest(
            &format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "description": "d",
                    "author": "a",
                    "license": "MIT"{body}
                }}"#
            ),
            name,
        )
        .unwrap();
        (name.to_string(), manifest)
    }

    fn detector() -> ConflictDetector {
        ConflictDetector::new(EventBus::with_defaults())
    }

    #[tokio::test]
    async fn duplicate_declared_token_is_one_high_conflict() {
        let manifests: HashMap<_, _> = [
            manifest(
                "alpha",
                r#", "module": {"crossPluginServices": [{"serviceName": "api", "token": "SHARED_T_deadbeef"}]}"#,
            ),
            manifest(
                "beta",
                r#", "module": {"crossPluginServices": [{"serviceName": "api", "token": "SHARED_T_deadbeef"}]}"#,
            ),
        ]
        .into_iter()
        .collect();

        let conflicts = detector().scan(&manifests);
        let token_conflicts: Vec<_> = conflicts
            .iter()
            .filter(|c| c.conflict_type == ConflictType::ServiceToken)
            .collect();
        assert_eq!(token_conflicts.len(), 1);
        assert_eq!(token_conflicts[0].severity, ConflictSeverity::High);
        assert_eq!(token_conflicts[0].conflicting_plugins, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn incompatible_versions_flagged_compatible_ignored() {
        let compatible: HashMap<_, _> = [
            manifest(
                "alpha",
                r#", "module": {"crossPluginServices": [{"serviceName": "api", "version": "1.2.0"}]}"#,
            ),
            manifest(
                "beta",
                r#", "module": {"crossPluginServices": [{"serviceName": "api", "version": "1.9.4"}]}"#,
            ),
        ]
        .into_iter()
        .collect();
        assert!(detector()
            .scan(&compatible)
            .iter()
            .all(|c| c.conflict_type != ConflictType::VersionIncompatible));

        let incompatible: HashMap<_, _> = [
            manifest(
                "alpha",
                r#", "module": {"crossPluginServices": [{"serviceName": "api", "version": "1.2.0"}]}"#,
            ),
            manifest(
                "beta",
                r#", "module": {"crossPluginServices": [{"serviceName": "api", "version": "2.0.0"}]}"#,
            ),
        ]
        .into_iter()
        .collect();
        assert!(detector()
            .scan(&incompatible)
            .iter()
            .any(|c| c.conflict_type == ConflictType::VersionIncompatible));
    }

    #[tokio::test]
    async fn dependency_cycle_is_critical() {
        let manifests: HashMap<_, _> = [
            manifest("x", r#", "dependencies": ["y"]"#),
            manifest("y", r#", "dependencies": ["x"]"#),
        ]
        .into_iter()
        .collect();

        let conflicts = detector().scan(&manifests);
        let cycle = conflicts
            .iter()
            .find(|c| c.conflict_type == ConflictType::DependencyCircular)
            .expect("cycle conflict");
        assert_eq!(cycle.severity, ConflictSeverity::Critical);
        assert_eq!(cycle.conflicting_plugins, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn exclusive_capability_claimed_twice() {
        let manifests: HashMap<_, _> = [
            manifest("alpha", r#", "permissions": ["authentication-provider"]"#),
            manifest("beta", r#", "permissions": ["authentication-provider"]"#),
        ]
        .into_iter()
        .collect();

        let conflicts = detector().scan(&manifests);
        assert!(conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::CapabilityDuplicate
                && c.severity == ConflictSeverity::Critical));
    }

    #[tokio::test]
    async fn export_collision_is_auto_resolvable() {
        let manifests: HashMap<_, _> = [
            manifest("alpha", r#", "module": {"exports": ["Shared"]}"#),
            manifest("beta", r#", "module": {"exports": ["Shared"]}"#),
        ]
        .into_iter()
        .collect();

        let detector = detector();
        let conflicts = detector.scan(&manifests);
        let collision = conflicts
            .iter()
            .find(|c| c.conflict_type == ConflictType::ExportCollision)
            .expect("export collision");
        assert!(collision.auto_resolvable);

        let actions = detector.auto_resolve(&conflicts);
        assert_eq!(actions.len(), 1);
        assert!(actions[0].contains("Shared"));
    }

    #[tokio::test]
    async fn namespace_pollution_over_limit() {
        let services: Vec<String> = (0..12)
            .map(|i| format!(r#"{{"serviceName": "svc-{i}", "global": true}}"#))
            .collect();
        let manifests: HashMap<_, _> = [manifest(
            "noisy",
            &format!(r#", "module": {{"crossPluginServices": [{}]}}"#, services.join(",")),
        )]
        .into_iter()
        .collect();

        let conflicts = detector().scan(&manifests);
        assert!(conflicts
            .iter()
            .any(|c| c.conflict_type == ConflictType::NamespacePollution));
    }

    #[test]
    fn semver_compatibility_rules() {
        assert!(versions_compatible("1.2.3", "1.9.0"));
        assert!(!versions_compatible("1.2.3", "2.0.0"));
        assert!(versions_compatible("0.3.1", "0.3.9"));
        assert!(!versions_compatible("0.3.1", "0.4.0"));
        assert!(!versions_compatible("abc", "1.0.0"));
    }
}
