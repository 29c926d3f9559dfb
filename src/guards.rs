//! Guard manager: storage and cross-plugin resolution of access-control
//! guards.
//!
//! Guards are stored under the composite key `<plugin>:<guardName>`. A
//! resolution walks the guard graph depth-first with explicit visited and
//! on-stack sets, so circular references are detected rather than recursed
//! into. Lookup order for a requested guard: the requester's own locals,
//! then exported locals of other loaded plugins, then the requester's
//! declared external references.
//!
//! Stores and removes are serialized by one mutex, resolutions by another;
//! a resolution briefly takes the store lock to clone a consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::descriptor::{SymbolHandle, SymbolTable};
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, EventKind, PluginEvent};
use crate::manifest::{GuardEntry, LocalGuard, PluginManifest};
use crate::state::{PluginState, PluginStateMachine};

/// A stored guard with its (optional) backing symbols.
#[derive(Debug, Clone)]
pub struct LoadedGuard {
    pub entry: GuardEntry,
    pub plugin: String,
    pub class_handle: Option<SymbolHandle>,
    pub instance: Option<SymbolHandle>,
}

/// One successfully resolved guard.
#[derive(Debug, Clone)]
pub struct ResolvedGuard {
    /// Composite key `<owner>:<name>`.
    pub key: String,
    pub owner: String,
    pub guard: LocalGuard,
}

/// An unresolvable guard reference.
#[derive(Debug, Clone, Serialize)]
pub struct MissingGuard {
    pub name: String,
    pub reason: String,
}

/// Outcome of resolving a list of guard names for a requester.
#[derive(Debug, Clone, Default)]
pub struct GuardResolution {
    pub resolved: Vec<ResolvedGuard>,
    pub missing: Vec<MissingGuard>,
    pub circular: Vec<String>,
}

/// Aggregate counts over the guard index.
#[derive(Debug, Clone, Serialize)]
pub struct GuardStatistics {
    pub total: usize,
    pub local: usize,
    pub external: usize,
    pub exported: usize,
    pub by_plugin: HashMap<String, usize>,
}

#[derive(Default)]
struct GuardStore {
    guards: HashMap<String, LoadedGuard>,
    by_plugin: HashMap<String, Vec<String>>,
}

/// Host-wide guard index.
pub struct GuardManager {
    store: StdMutex<GuardStore>,
    resolve_lock: Mutex<()>,
    states: Arc<PluginStateMachine>,
    bus: Arc<EventBus>,
}

impl GuardManager {
    pub fn new(states: Arc<PluginStateMachine>, bus: Arc<EventBus>) -> Self {
        Self {
            store: StdMutex::new(GuardStore::default()),
            resolve_lock: Mutex::new(()),
            states,
            bus,
        }
    }

    /// Store every guard a plugin declares. Local guards pick up their class
    /// handle from the symbol table when present.
    pub fn store_guards(
        &self,
        plugin: &str,
        manifest: &PluginManifest,
        symbols: &SymbolTable,
    ) -> HostResult<usize> {
        let mut store = self.store.lock().unwrap();
        let mut stored = 0;
        for entry in &manifest.module.guards {
            let class_handle = match entry {
                GuardEntry::Local(local) => {
                    let handle = symbols.get(&local.class_name).cloned();
                    if handle.is_none() {
                        warn!(
                            plugin,
                            guard = %local.name,
                            class = %local.class_name,
                            "guard class symbol missing"
                        );
                    }
                    handle
                }
                GuardEntry::External(_) => None,
            };

            let key = guard_key(plugin, entry.name());
            store.guards.insert(
                key.clone(),
                LoadedGuard {
                    entry: entry.clone(),
                    plugin: plugin.to_string(),
                    class_handle,
                    instance: None,
                },
            );
            store
                .by_plugin
                .entry(plugin.to_string())
                .or_default()
                .push(key.clone());
            stored += 1;

            self.bus.publish(
                PluginEvent::new(EventKind::GuardRegistered, plugin, "guard-manager")
                    .with_payload(json!({ "guard": entry.name() })),
            );
        }
        debug!(plugin, stored, "guards stored");
        Ok(stored)
    }

    /// Remove every guard owned by a plugin. Returns the removal count.
    pub fn remove_plugin_guards(&self, plugin: &str) -> usize {
        let mut store = self.store.lock().unwrap();
        let keys = store.by_plugin.remove(plugin).unwrap_or_default();
        for key in &keys {
            if let Some(removed) = store.guards.remove(key) {
                self.bus.publish(
                    PluginEvent::new(EventKind::GuardRemoved, plugin, "guard-manager")
                        .with_payload(json!({ "guard": removed.entry.name() })),
                );
            }
        }
        keys.len()
    }

    /// Validate the full guard graph a plugin declares; used during load.
    pub async fn validate_plugin_graph(&self, plugin: &str) -> HostResult<()> {
        let names: Vec<String> = {
            let store = self.store.lock().unwrap();
            store
                .by_plugin
                .get(plugin)
                .into_iter()
                .flatten()
                .filter_map(|key| store.guards.get(key))
                .map(|guard| guard.entry.name().to_string())
                .collect()
        };
        let resolution = self.resolve(plugin, &names).await;
        if !resolution.circular.is_empty() {
            return Err(HostError::GuardCircular {
                plugin: plugin.to_string(),
                guards: resolution.circular,
            });
        }
        if let Some(missing) = resolution.missing.first() {
            return Err(HostError::GuardUnresolvable {
                plugin: plugin.to_string(),
                guard: missing.name.clone(),
                reason: missing.reason.clone(),
            });
        }
        Ok(())
    }

    /// Resolve `names` for `requester`, walking guard dependencies.
    pub async fn resolve(&self, requester: &str, names: &[String]) -> GuardResolution {
        let _serialized = self.resolve_lock.lock().await;
        let snapshot: HashMap<String, LoadedGuard> = {
            let store = self.store.lock().unwrap();
            store.guards.clone()
        };
        let states = self.states.snapshot();
        let loaded: HashSet<&str> = states
            .iter()
            .filter(|(_, record)| record.state == PluginState::Loaded)
            .map(|(name, _)| name.as_str())
            .collect();

        let mut resolution = GuardResolution::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut on_stack: HashSet<String> = HashSet::new();
        for name in names {
            self.visit(
                requester,
                requester,
                name,
                &snapshot,
                &loaded,
                &mut visited,
                &mut on_stack,
                &mut resolution,
            );
        }
        resolution
    }

    /// Counts over the current index.
    pub fn statistics(&self) -> GuardStatistics {
        let store = self.store.lock().unwrap();
        let mut local = 0;
        let mut external = 0;
        let mut exported = 0;
        for guard in store.guards.values() {
            match &guard.entry {
                GuardEntry::Local(l) => {
                    local += 1;
                    if l.exported {
                        exported += 1;
                    }
                }
                GuardEntry::External(_) => external += 1,
            }
        }
        GuardStatistics {
            total: store.guards.len(),
            local,
            external,
            exported,
            by_plugin: store
                .by_plugin
                .iter()
                .map(|(plugin, keys)| (plugin.clone(), keys.len()))
                .collect(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        requester: &str,
        owner_hint: &str,
        name: &str,
        snapshot: &HashMap<String, LoadedGuard>,
        loaded: &HashSet<&str>,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        resolution: &mut GuardResolution,
    ) {
        let stack_key = format!("{owner_hint}:{name}");
        if on_stack.contains(&stack_key) {
            if !resolution.circular.contains(&name.to_string()) {
                resolution.circular.push(name.to_string());
            }
            return;
        }
        if visited.contains(&stack_key) {
            return;
        }
        visited.insert(stack_key.clone());

        let found = self.lookup(requester, owner_hint, name, snapshot, loaded);
        match found {
            Ok((owner, guard)) => {
                on_stack.insert(stack_key.clone());
                for dep in guard.dependencies.clone() {
                    self.visit(
                        requester, &owner, &dep, snapshot, loaded, visited, on_stack, resolution,
                    );
                }
                on_stack.remove(&stack_key);
                resolution.resolved.push(ResolvedGuard {
                    key: guard_key(&owner, name),
                    owner,
                    guard,
                });
            }
            Err(reason) => resolution.missing.push(MissingGuard {
                name: name.to_string(),
                reason,
            }),
        }
    }

    /// Spec lookup order: requester locals, exported locals of other loaded
    /// plugins, then the requester's external declarations.
    fn lookup(
        &self,
        requester: &str,
        owner_hint: &str,
        name: &str,
        snapshot: &HashMap<String, LoadedGuard>,
        loaded: &HashSet<&str>,
    ) -> Result<(String, LocalGuard), String> {
        // Dependencies of a resolved guard first search their owner's locals.
        if let Some(LoadedGuard {
            entry: GuardEntry::Local(local),
            ..
        }) = snapshot.get(&guard_key(owner_hint, name))
        {
            return Ok((owner_hint.to_string(), local.clone()));
        }
        if owner_hint != requester {
            if let Some(LoadedGuard {
                entry: GuardEntry::Local(local),
                ..
            }) = snapshot.get(&guard_key(requester, name))
            {
                return Ok((requester.to_string(), local.clone()));
            }
        }

        // Exported locals of other plugins, deterministically by owner name.
        let mut candidates: Vec<(&String, &LoadedGuard)> = snapshot
            .iter()
            .filter(|(_, guard)| {
                guard.plugin != requester
                    && matches!(
                        &guard.entry,
                        GuardEntry::Local(local) if local.name == name && local.exported
                    )
            })
            .collect();
        candidates.sort_by(|a, b| a.1.plugin.cmp(&b.1.plugin));
        for (_, guard) in candidates {
            if loaded.contains(guard.plugin.as_str()) {
                if let GuardEntry::Local(local) = &guard.entry {
                    return Ok((guard.plugin.clone(), local.clone()));
                }
            }
        }

        // The requester's own external declaration for this name.
        if let Some(LoadedGuard {
            entry: GuardEntry::External(external),
            ..
        }) = snapshot.get(&guard_key(requester, name))
        {
            let source_key = guard_key(&external.source, name);
            return match snapshot.get(&source_key) {
                Some(LoadedGuard {
                    entry: GuardEntry::Local(local),
                    ..
                }) if local.exported => {
                    if loaded.contains(external.source.as_str()) {
                        Ok((external.source.clone(), local.clone()))
                    } else {
                        Err(format!("source plugin '{}' is not loaded", external.source))
                    }
                }
                Some(LoadedGuard {
                    entry: GuardEntry::Local(_),
                    ..
                }) => Err(format!(
                    "guard '{name}' exists in '{}' but is not exported",
                    external.source
                )),
                _ => Err(format!(
                    "source plugin '{}' does not declare guard '{name}'",
                    external.source
                )),
            };
        }

        Err(format!("guard '{name}' is not declared anywhere visible"))
    }
}

impl std::fmt::Debug for GuardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GuardManager")
    }
}

fn guard_key(plugin: &str, guard: &str) -> String {
    format!("{plugin}:{guard}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;

    fn manifest(name: &str, guards: &str) -> PluginManifest {
        parse_manifest(
            &format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "description": "d",
                    "author": "a",
                    "license": "MIT",
                    "module": {{"guards": {guards}}}
                }}"#
            ),
            name,
        )
        .unwrap()
    }

    async fn manager_with_loaded(
        plugins: &[&str],
    ) -> (GuardManager, Arc<PluginStateMachine>) {
        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        for plugin in plugins {
            states.record_discovered(plugin).unwrap();
            states.transition(plugin, PluginState::Loading).unwrap();
            states.transition(plugin, PluginState::Loaded).unwrap();
        }
        (GuardManager::new(Arc::clone(&states), bus), states)
    }

    #[tokio::test]
    async fn stores_and_resolves_local_guard() {
        let (manager, _) = manager_with_loaded(&["auth"]).await;
        let m = manifest(
            "auth",
            r#"[{"name": "jwt-guard", "className": "JwtGuard"}]"#,
        );
        manager
            .store_guards("auth", &m, &SymbolTable::new())
            .unwrap();

        let resolution = manager.resolve("auth", &["jwt-guard".to_string()]).await;
        assert_eq!(resolution.resolved.len(), 1);
        assert_eq!(resolution.resolved[0].owner, "auth");
        assert!(resolution.missing.is_empty());
    }

    #[tokio::test]
    async fn external_guard_requires_export() {
        let (manager, _) = manager_with_loaded(&["p", "q"]).await;
        // q declares the guard local but NOT exported
        let q = manifest("q", r#"[{"name": "shared-guard", "className": "SharedGuard"}]"#);
        manager.store_guards("q", &q, &SymbolTable::new()).unwrap();
        // p references it externally
        let p = manifest("p", r#"[{"name": "shared-guard", "source": "q"}]"#);
        manager.store_guards("p", &p, &SymbolTable::new()).unwrap();

        let resolution = manager.resolve("p", &["shared-guard".to_string()]).await;
        assert!(resolution.resolved.is_empty());
        assert_eq!(resolution.missing.len(), 1);
        assert!(resolution.missing[0].reason.contains("not exported"));

        let err = manager.validate_plugin_graph("p").await.unwrap_err();
        assert!(matches!(err, HostError::GuardUnresolvable { .. }));
    }

    #[tokio::test]
    async fn external_guard_resolves_when_exported_and_loaded() {
        let (manager, _) = manager_with_loaded(&["p", "q"]).await;
        let q = manifest(
            "q",
            r#"[{"name": "shared-guard", "className": "SharedGuard", "exported": true}]"#,
        );
        manager.store_guards("q", &q, &SymbolTable::new()).unwrap();
        let p = manifest("p", r#"[{"name": "shared-guard", "source": "q"}]"#);
        manager.store_guards("p", &p, &SymbolTable::new()).unwrap();

        let resolution = manager.resolve("p", &["shared-guard".to_string()]).await;
        assert_eq!(resolution.resolved.len(), 1);
        assert_eq!(resolution.resolved[0].owner, "q");
    }

    #[tokio::test]
    async fn external_guard_requires_loaded_source() {
        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        // q discovered but never loaded
        states.record_discovered("q").unwrap();
        let manager = GuardManager::new(Arc::clone(&states), bus);

        let q = manifest(
            "q",
            r#"[{"name": "shared-guard", "className": "SharedGuard", "exported": true}]"#,
        );
        manager.store_guards("q", &q, &SymbolTable::new()).unwrap();
        let p = manifest("p", r#"[{"name": "shared-guard", "source": "q"}]"#);
        manager.store_guards("p", &p, &SymbolTable::new()).unwrap();

        let resolution = manager.resolve("p", &["shared-guard".to_string()]).await;
        assert_eq!(resolution.missing.len(), 1);
        assert!(resolution.missing[0].reason.contains("not loaded"));
    }

    #[tokio::test]
    async fn circular_guard_dependencies_detected() {
        let (manager, _) = manager_with_loaded(&["auth"]).await;
        let m = manifest(
            "auth",
            r#"[
                {"name": "a-guard", "className": "AGuard", "dependencies": ["b-guard"]},
                {"name": "b-guard", "className": "BGuard", "dependencies": ["a-guard"]}
            ]"#,
        );
        manager.store_guards("auth", &m, &SymbolTable::new()).unwrap();

        let err = manager.validate_plugin_graph("auth").await.unwrap_err();
        assert!(matches!(err, HostError::GuardCircular { .. }));
    }

    #[tokio::test]
    async fn removal_empties_index_and_emits_events() {
        let bus = EventBus::with_defaults();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            EventKind::GuardRemoved,
            crate::events::listener(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        );
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        let manager = GuardManager::new(states, bus);

        let m = manifest("auth", r#"[{"name": "jwt-guard", "className": "JwtGuard"}]"#);
        manager.store_guards("auth", &m, &SymbolTable::new()).unwrap();
        assert_eq!(manager.remove_plugin_guards("auth"), 1);
        assert_eq!(manager.statistics().total, 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["guard"], "jwt-guard");
    }

    #[tokio::test]
    async fn statistics_count_kinds() {
        let (manager, _) = manager_with_loaded(&["a", "b"]).await;
        let a = manifest(
            "a",
            r#"[{"name": "g-one", "className": "GOne", "exported": true}]"#,
        );
        let b = manifest("b", r#"[{"name": "g-one", "source": "a"}]"#);
        manager.store_guards("a", &a, &SymbolTable::new()).unwrap();
        manager.store_guards("b", &b, &SymbolTable::new()).unwrap();

        let stats = manager.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.local, 1);
        assert_eq!(stats.external, 1);
        assert_eq!(stats.exported, 1);
    }
}
