//! Dependency resolution and batch planning.
//!
//! From a discovery list the resolver produces a topological load order and
//! a list of batches: each batch contains only plugins whose dependencies
//! are satisfied by earlier batches, so its members may load concurrently.
//! Ties inside a tier break by ascending `loadOrder`, then name, so plans
//! are deterministic.
//!
//! Cycles are fatal for their members only; plugins that merely depend on a
//! cycle (or on a plugin with a missing dependency) are excluded as cascade
//! victims, and everything else still loads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::discovery::PluginDiscovery;
use crate::error::{HostError, HostResult};
use crate::events::{listener, EventBus, EventKind, PluginEvent};
use crate::state::{PluginState, PluginStateMachine};

/// Result of planning a load.
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    /// Full topological order over the loadable plugins.
    pub order: Vec<String>,
    /// Concurrency batches, in execution order.
    pub batches: Vec<Vec<String>>,
    /// Members of dependency cycles. None of these load.
    pub cyclic: Vec<String>,
    /// Plugins excluded because a declared dependency was never discovered.
    pub missing: Vec<(String, String)>,
    /// Plugins excluded because they depend (transitively) on an excluded one.
    pub cascaded: Vec<String>,
}

/// Compute order and batches for a set of discovered plugins.
pub fn compute_plan(discoveries: &[PluginDiscovery]) -> LoadPlan {
    let known: HashSet<&str> = discoveries.iter().map(|d| d.name.as_str()).collect();
    let by_name: HashMap<&str, &PluginDiscovery> =
        discoveries.iter().map(|d| (d.name.as_str(), d)).collect();

    // Plugins with undeclared dependencies can never load.
    let mut missing = Vec::new();
    let mut excluded: HashSet<&str> = HashSet::new();
    for discovery in discoveries {
        for dep in &discovery.dependencies {
            if !known.contains(dep.as_str()) {
                missing.push((discovery.name.clone(), dep.clone()));
                excluded.insert(discovery.name.as_str());
            }
        }
    }

    // Transitively exclude dependents of excluded plugins.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for discovery in discoveries {
        for dep in &discovery.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(discovery.name.as_str());
        }
    }
    let mut stack: Vec<&str> = excluded.iter().copied().collect();
    let mut cascaded: HashSet<&str> = HashSet::new();
    while let Some(name) = stack.pop() {
        for dependent in dependents.get(name).into_iter().flatten() {
            if excluded.insert(dependent) {
                cascaded.insert(dependent);
                stack.push(dependent);
            }
        }
    }

    // Kahn's algorithm over the remaining graph, tier by tier.
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    for discovery in discoveries {
        if excluded.contains(discovery.name.as_str()) {
            continue;
        }
        let degree = discovery
            .dependencies
            .iter()
            .filter(|dep| !excluded.contains(dep.as_str()))
            .count();
        indegree.insert(discovery.name.as_str(), degree);
    }

    let mut order = Vec::new();
    let mut batches = Vec::new();
    let mut emitted: HashSet<&str> = HashSet::new();
    loop {
        let mut tier: Vec<&str> = indegree
            .iter()
            .filter(|(name, degree)| **degree == 0 && !emitted.contains(*name))
            .map(|(name, _)| *name)
            .collect();
        if tier.is_empty() {
            break;
        }
        tier.sort_by_key(|name| {
            let discovery = by_name[name];
            (discovery.load_order, discovery.name.clone())
        });
        for name in &tier {
            emitted.insert(name);
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        batches.push(tier.into_iter().map(String::from).collect());
    }

    // Whatever Kahn could not emit sits on or behind a cycle.
    let remaining: HashSet<&str> = indegree
        .keys()
        .filter(|name| !emitted.contains(**name))
        .copied()
        .collect();
    let (cycle_members, cycle_victims) = split_cycles(&remaining, &by_name);

    let mut plan = LoadPlan {
        order,
        batches,
        cyclic: cycle_members.into_iter().map(String::from).collect(),
        missing,
        cascaded: cascaded
            .into_iter()
            .map(String::from)
            .chain(cycle_victims.into_iter().map(String::from))
            .collect(),
    };
    plan.cyclic.sort();
    plan.cascaded.sort();
    if !plan.cyclic.is_empty() {
        warn!(plugins = ?plan.cyclic, "dependency cycle detected");
    }
    plan
}

/// Split unresolved nodes into true cycle members and their victims.
fn split_cycles<'a>(
    remaining: &HashSet<&'a str>,
    by_name: &HashMap<&'a str, &'a PluginDiscovery>,
) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut on_cycle: HashSet<&str> = HashSet::new();

    for &start in remaining {
        if on_cycle.contains(start) {
            continue;
        }
        // Iterative DFS restricted to unresolved nodes; a back edge to a
        // node on the current path marks every path node from there on.
        let mut path: Vec<&str> = Vec::new();
        let mut path_set: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        while let Some((node, edge)) = stack.pop() {
            if edge == 0 {
                path.push(node);
                path_set.insert(node);
                visited.insert(node);
            }
            let deps: Vec<&str> = by_name
                .get(node)
                .map(|d| {
                    d.dependencies
                        .iter()
                        .map(|s| s.as_str())
                        .filter(|dep| remaining.contains(dep))
                        .collect()
                })
                .unwrap_or_default();
            if edge < deps.len() {
                stack.push((node, edge + 1));
                let next = deps[edge];
                if path_set.contains(next) {
                    let from = path.iter().position(|n| *n == next).unwrap_or(0);
                    for member in &path[from..] {
                        on_cycle.insert(member);
                    }
                } else if !visited.contains(next) {
                    stack.push((next, 0));
                }
            } else {
                path.pop();
                path_set.remove(node);
            }
        }
    }

    let mut members: Vec<&str> = Vec::new();
    let mut victims: Vec<&str> = Vec::new();
    for &node in remaining {
        if on_cycle.contains(node) {
            members.push(node);
        } else {
            victims.push(node);
        }
    }
    (members, victims)
}

/// Event-driven wait for a plugin's dependencies to reach LOADED.
#[derive(Debug)]
pub struct DependencyWaiter {
    states: Arc<PluginStateMachine>,
    bus: Arc<EventBus>,
}

impl DependencyWaiter {
    pub fn new(states: Arc<PluginStateMachine>, bus: Arc<EventBus>) -> Self {
        Self { states, bus }
    }

    /// Block until every dependency is LOADED, a dependency fails, or the
    /// deadline expires.
    pub async fn wait_for(
        &self,
        plugin: &str,
        dependencies: &[String],
        deadline: Duration,
    ) -> HostResult<()> {
        if dependencies.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let handle = self.bus.subscribe(
            EventKind::StateChanged,
            listener(move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                    Ok(())
                }
            }),
        );

        let started = tokio::time::Instant::now();
        let result = loop {
            match self.check(plugin, dependencies) {
                WaitStatus::Ready => break Ok(()),
                WaitStatus::Failed(dependency) => {
                    break Err(HostError::DependencyFailed {
                        plugin: plugin.to_string(),
                        dependency,
                    })
                }
                WaitStatus::Pending(pending) => {
                    let elapsed = started.elapsed();
                    if elapsed >= deadline {
                        break Err(HostError::DependencyTimeout {
                            plugin: plugin.to_string(),
                            pending,
                            timeout_ms: deadline.as_millis() as u64,
                        });
                    }
                    match tokio::time::timeout(deadline - elapsed, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) | Err(_) => {
                            break Err(HostError::DependencyTimeout {
                                plugin: plugin.to_string(),
                                pending,
                                timeout_ms: deadline.as_millis() as u64,
                            })
                        }
                    }
                }
            }
        };
        self.bus.unsubscribe(&handle);

        match &result {
            Ok(()) => {
                debug!(plugin, "dependencies resolved");
                self.bus.publish(
                    PluginEvent::new(EventKind::DependencyResolved, plugin, "resolver")
                        .with_payload(json!({ "dependencies": dependencies })),
                );
            }
            Err(err) => {
                self.bus.publish(
                    PluginEvent::new(EventKind::DependencyFailed, plugin, "resolver")
                        .with_payload(json!({ "reason": err.kind() })),
                );
            }
        }
        result
    }

    fn check(&self, _plugin: &str, dependencies: &[String]) -> WaitStatus {
        let snapshot = self.states.snapshot();
        let mut pending = Vec::new();
        for dep in dependencies {
            match snapshot.get(dep).map(|record| record.state) {
                Some(PluginState::Loaded) => {}
                Some(PluginState::Failed) | Some(PluginState::Unloaded) => {
                    return WaitStatus::Failed(dep.clone());
                }
                _ => pending.push(dep.clone()),
            }
        }
        if pending.is_empty() {
            WaitStatus::Ready
        } else {
            WaitStatus::Pending(pending)
        }
    }
}

enum WaitStatus {
    Ready,
    Failed(String),
    Pending(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;
    use std::path::PathBuf;

    fn discovery(name: &str, deps: &[&str], load_order: u32) -> PluginDiscovery {
        let manifest: PluginManifest = serde_json::from_str(&format!(
            r#"{{
                "name": "{name}",
                "version": "1.0.0",
                "description": "test",
                "author": "tester",
                "license": "MIT",
                "loadOrder": {load_order},
                "dependencies": [{}]
            }}"#,
            deps.iter()
                .map(|d| format!("\"{d}\""))
                .collect::<Vec<_>>()
                .join(",")
        ))
        .unwrap();
        PluginDiscovery {
            name: name.to_string(),
            path: PathBuf::from(format!("/tmp/{name}")),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            load_order,
            manifest,
        }
    }

    #[test]
    fn linear_chain_one_per_batch() {
        let plan = compute_plan(&[
            discovery("a", &[], 0),
            discovery("b", &["a"], 0),
            discovery("c", &["b"], 0),
        ]);
        assert_eq!(plan.batches, vec![vec!["a"], vec!["b"], vec!["c"]]);
        assert_eq!(plan.order, vec!["a", "b", "c"]);
        assert!(plan.cyclic.is_empty());
    }

    #[test]
    fn diamond_middle_tier_shares_a_batch() {
        let plan = compute_plan(&[
            discovery("a", &[], 0),
            discovery("b", &["a"], 0),
            discovery("c", &["a"], 0),
            discovery("d", &["b", "c"], 0),
        ]);
        assert_eq!(
            plan.batches,
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
    }

    #[test]
    fn load_order_breaks_ties() {
        let plan = compute_plan(&[
            discovery("zeta", &[], 1),
            discovery("omega", &[], 0),
            discovery("alpha", &[], 1),
        ]);
        assert_eq!(plan.batches, vec![vec!["omega", "alpha", "zeta"]]);
    }

    #[test]
    fn cycle_members_are_isolated() {
        let plan = compute_plan(&[
            discovery("x", &["y"], 0),
            discovery("y", &["x"], 0),
            discovery("standalone", &[], 0),
        ]);
        assert_eq!(plan.cyclic, vec!["x", "y"]);
        assert_eq!(plan.batches, vec![vec!["standalone"]]);
    }

    #[test]
    fn cycle_dependents_are_victims_not_members() {
        let plan = compute_plan(&[
            discovery("x", &["y"], 0),
            discovery("y", &["x"], 0),
            discovery("leech", &["x"], 0),
        ]);
        assert_eq!(plan.cyclic, vec!["x", "y"]);
        assert_eq!(plan.cascaded, vec!["leech"]);
    }

    #[test]
    fn missing_dependency_excludes_and_cascades() {
        let plan = compute_plan(&[
            discovery("a", &["ghost"], 0),
            discovery("b", &["a"], 0),
            discovery("ok", &[], 0),
        ]);
        assert_eq!(plan.missing, vec![("a".to_string(), "ghost".to_string())]);
        assert_eq!(plan.cascaded, vec!["b"]);
        assert_eq!(plan.batches, vec![vec!["ok"]]);
    }

    #[test]
    fn no_batch_contains_an_internal_edge() {
        let plan = compute_plan(&[
            discovery("a", &[], 0),
            discovery("b", &["a"], 0),
            discovery("c", &["a"], 0),
            discovery("d", &["b"], 0),
            discovery("e", &["b", "c"], 0),
        ]);
        let deps: HashMap<&str, Vec<&str>> = [
            ("b", vec!["a"]),
            ("c", vec!["a"]),
            ("d", vec!["b"]),
            ("e", vec!["b", "c"]),
        ]
        .into_iter()
        .collect();
        for batch in &plan.batches {
            for member in batch {
                for dep in deps.get(member.as_str()).into_iter().flatten() {
                    assert!(
                        !batch.iter().any(|other| other == dep),
                        "batch {batch:?} contains edge {member} -> {dep}"
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn waiter_resolves_when_dependency_loads() {
        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        states.record_discovered("dep").unwrap();
        states.record_discovered("app").unwrap();

        let waiter = DependencyWaiter::new(Arc::clone(&states), Arc::clone(&bus));
        let states_bg = Arc::clone(&states);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            states_bg.transition("dep", PluginState::Loading).unwrap();
            states_bg.transition("dep", PluginState::Loaded).unwrap();
        });

        waiter
            .wait_for("app", &["dep".to_string()], Duration::from_secs(5))
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn waiter_fails_fast_on_failed_dependency() {
        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        states.record_discovered("dep").unwrap();
        states.transition("dep", PluginState::Loading).unwrap();
        states.transition("dep", PluginState::Failed).unwrap();

        let waiter = DependencyWaiter::new(states, bus);
        let err = waiter
            .wait_for("app", &["dep".to_string()], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::DependencyFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out() {
        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        states.record_discovered("dep").unwrap();

        let waiter = DependencyWaiter::new(states, bus);
        let err = waiter
            .wait_for("app", &["dep".to_string()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::DependencyTimeout { .. }));
    }
}
