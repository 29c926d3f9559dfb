//! Plugin lifecycle state machine.
//!
//! Every plugin moves through `Discovered -> Loading -> Loaded | Failed` and
//! `Loaded -> Unloaded`; a plugin that never starts loading can also fail
//! directly (dependency cascade, cycle member). `Failed` and `Unloaded` are
//! terminal; a reload creates a fresh discovery. The legal transition table
//! is enforced here and nowhere else.
//!
//! Queries read an atomic snapshot: writers build a fresh map and swap the
//! `Arc`, so readers never contend with a transition in progress.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};
use crate::events::{EventBus, EventKind, PluginEvent};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Loading,
    Loaded,
    Failed,
    Unloaded,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Discovered => "discovered",
            PluginState::Loading => "loading",
            PluginState::Loaded => "loaded",
            PluginState::Failed => "failed",
            PluginState::Unloaded => "unloaded",
        }
    }

    /// Legal transition table.
    pub fn can_transition_to(&self, to: PluginState) -> bool {
        matches!(
            (self, to),
            (PluginState::Discovered, PluginState::Loading)
                | (PluginState::Discovered, PluginState::Failed)
                | (PluginState::Loading, PluginState::Loaded)
                | (PluginState::Loading, PluginState::Failed)
                | (PluginState::Loaded, PluginState::Unloaded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginState::Failed | PluginState::Unloaded)
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-plugin record: current state plus the transition history.
#[derive(Debug, Clone, Serialize)]
pub struct StateRecord {
    pub state: PluginState,
    pub changed_at: DateTime<Utc>,
    pub history: Vec<(PluginState, DateTime<Utc>)>,
}

type Snapshot = Arc<HashMap<String, StateRecord>>;

/// Central state machine over all plugins.
#[derive(Debug)]
pub struct PluginStateMachine {
    snapshot: RwLock<Snapshot>,
    bus: Arc<EventBus>,
}

impl PluginStateMachine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            bus,
        }
    }

    /// Register a plugin as freshly discovered.
    ///
    /// A terminal record (failed / unloaded) is replaced; an active one is a
    /// name conflict because names are immutable once discovered.
    pub fn record_discovered(&self, plugin: &str) -> HostResult<()> {
        let mut guard = self.snapshot.write().unwrap();
        if let Some(record) = guard.get(plugin) {
            if !record.state.is_terminal() {
                return Err(HostError::ManifestInvalid {
                    plugin: plugin.to_string(),
                    reason: format!("plugin already registered in state {}", record.state),
                });
            }
        }
        let now = Utc::now();
        let mut map: HashMap<String, StateRecord> = (**guard).clone();
        map.insert(
            plugin.to_string(),
            StateRecord {
                state: PluginState::Discovered,
                changed_at: now,
                history: vec![(PluginState::Discovered, now)],
            },
        );
        *guard = Arc::new(map);
        debug!(plugin, "plugin discovered");
        Ok(())
    }

    /// Apply one transition, returning the previous state.
    ///
    /// Illegal edges fail and emit a `plugin.error` event.
    pub fn transition(&self, plugin: &str, to: PluginState) -> HostResult<PluginState> {
        let from = {
            let mut guard = self.snapshot.write().unwrap();
            let Some(record) = guard.get(plugin) else {
                return Err(HostError::PluginNotFound {
                    plugin: plugin.to_string(),
                });
            };
            let from = record.state;
            if !from.can_transition_to(to) {
                drop(guard);
                warn!(plugin, %from, %to, "illegal state transition rejected");
                self.bus.publish(
                    PluginEvent::new(EventKind::Error, plugin, "state-machine").with_payload(
                        json!({
                            "message": format!("illegal transition {from} -> {to}"),
                        }),
                    ),
                );
                return Err(HostError::IllegalTransition {
                    plugin: plugin.to_string(),
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }

            let now = Utc::now();
            let mut map: HashMap<String, StateRecord> = (**guard).clone();
            let record = map.get_mut(plugin).expect("record exists in clone");
            record.state = to;
            record.changed_at = now;
            record.history.push((to, now));
            *guard = Arc::new(map);
            from
        };

        debug!(plugin, %from, %to, "state transition");
        self.bus.publish(
            PluginEvent::new(EventKind::StateChanged, plugin, "state-machine").with_payload(
                json!({
                    "fromState": from.as_str(),
                    "toState": to.as_str(),
                    "transition": format!("{from}->{to}"),
                }),
            ),
        );
        Ok(from)
    }

    /// Lock-free read of a plugin's current state.
    pub fn current_state(&self, plugin: &str) -> Option<PluginState> {
        self.snapshot().get(plugin).map(|record| record.state)
    }

    pub fn record(&self, plugin: &str) -> Option<StateRecord> {
        self.snapshot().get(plugin).cloned()
    }

    /// All plugins currently in `state`.
    pub fn list_by_state(&self, state: PluginState) -> Vec<String> {
        let mut names: Vec<String> = self
            .snapshot()
            .iter()
            .filter(|(_, record)| record.state == state)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Current snapshot of every record.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.snapshot.read().unwrap())
    }

    /// Drop a plugin's record entirely (part of unload cleanup).
    pub fn remove(&self, plugin: &str) -> bool {
        let mut guard = self.snapshot.write().unwrap();
        if !guard.contains_key(plugin) {
            return false;
        }
        let mut map: HashMap<String, StateRecord> = (**guard).clone();
        map.remove(plugin);
        *guard = Arc::new(map);
        true
    }

    pub fn counts(&self) -> HashMap<PluginState, usize> {
        let mut counts = HashMap::new();
        for record in self.snapshot().values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> PluginStateMachine {
        PluginStateMachine::new(EventBus::with_defaults())
    }

    #[tokio::test]
    async fn happy_path_transitions() {
        let sm = machine();
        sm.record_discovered("auth").unwrap();
        assert_eq!(sm.current_state("auth"), Some(PluginState::Discovered));

        sm.transition("auth", PluginState::Loading).unwrap();
        sm.transition("auth", PluginState::Loaded).unwrap();
        sm.transition("auth", PluginState::Unloaded).unwrap();
        assert_eq!(sm.current_state("auth"), Some(PluginState::Unloaded));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let sm = machine();
        sm.record_discovered("auth").unwrap();
        let err = sm.transition("auth", PluginState::Loaded).unwrap_err();
        assert!(matches!(err, HostError::IllegalTransition { .. }));
        // state unchanged
        assert_eq!(sm.current_state("auth"), Some(PluginState::Discovered));
    }

    #[tokio::test]
    async fn terminal_states_stay_terminal() {
        let sm = machine();
        sm.record_discovered("auth").unwrap();
        sm.transition("auth", PluginState::Loading).unwrap();
        sm.transition("auth", PluginState::Failed).unwrap();
        assert!(sm.transition("auth", PluginState::Loading).is_err());
        assert!(sm.transition("auth", PluginState::Loaded).is_err());
    }

    #[tokio::test]
    async fn rediscovery_replaces_only_terminal_records() {
        let sm = machine();
        sm.record_discovered("auth").unwrap();
        assert!(sm.record_discovered("auth").is_err());

        sm.transition("auth", PluginState::Loading).unwrap();
        sm.transition("auth", PluginState::Failed).unwrap();
        sm.record_discovered("auth").unwrap();
        assert_eq!(sm.current_state("auth"), Some(PluginState::Discovered));
    }

    #[tokio::test]
    async fn state_changed_events_flow_in_order() {
        let bus = EventBus::with_defaults();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            EventKind::StateChanged,
            crate::events::listener(move |event| {
                let tx = tx.clone();
                async move {
                    tx.send(event).map_err(|e| e.to_string())?;
                    Ok(())
                }
            }),
        );

        let sm = PluginStateMachine::new(Arc::clone(&bus));
        sm.record_discovered("auth").unwrap();
        sm.transition("auth", PluginState::Loading).unwrap();
        sm.transition("auth", PluginState::Loaded).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["toState"], "loading");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["toState"], "loaded");
    }

    #[tokio::test]
    async fn list_by_state_filters() {
        let sm = machine();
        sm.record_discovered("a").unwrap();
        sm.record_discovered("b").unwrap();
        sm.transition("a", PluginState::Loading).unwrap();
        assert_eq!(sm.list_by_state(PluginState::Discovered), vec!["b"]);
        assert_eq!(sm.list_by_state(PluginState::Loading), vec!["a"]);
    }
}
