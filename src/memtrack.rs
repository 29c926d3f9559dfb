//! Per-plugin resource tracking.
//!
//! The host keeps weak references to plugin instances plus the timers and
//! bus listeners a plugin registered, so an unload can reclaim everything
//! the plugin left behind: timers are aborted, listeners unsubscribed, and
//! the instance set dropped. Weak references also give an honest liveness
//! count after unload.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::{EventBus, ListenerHandle};

type AnyInstance = dyn Any + Send + Sync;

#[derive(Default)]
struct PluginResources {
    instances: Vec<Weak<AnyInstance>>,
    timers: Vec<JoinHandle<()>>,
    listeners: Vec<ListenerHandle>,
}

/// Memory stats for one plugin.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PluginMemoryStats {
    pub tracked_instances: usize,
    pub live_instances: usize,
    pub timers: usize,
    pub listeners: usize,
}

/// Host-wide resource ledger.
#[derive(Default)]
pub struct MemoryTracker {
    inner: Mutex<HashMap<String, PluginResources>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a plugin-owned instance without keeping it alive.
    pub fn track_instance(&self, plugin: &str, instance: &Arc<AnyInstance>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(plugin.to_string())
            .or_default()
            .instances
            .push(Arc::downgrade(instance));
    }

    /// Track a timer task the plugin started.
    pub fn track_timer(&self, plugin: &str, timer: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(plugin.to_string()).or_default().timers.push(timer);
    }

    /// Track a bus listener the plugin attached.
    pub fn track_listener(&self, plugin: &str, handle: ListenerHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(plugin.to_string())
            .or_default()
            .listeners
            .push(handle);
    }

    /// Reclaim everything a plugin registered. Called during unload.
    pub fn cleanup(&self, plugin: &str, bus: &EventBus) -> PluginMemoryStats {
        let resources = {
            let mut inner = self.inner.lock().unwrap();
            inner.remove(plugin)
        };
        let Some(resources) = resources else {
            return PluginMemoryStats::default();
        };

        let stats = PluginMemoryStats {
            tracked_instances: resources.instances.len(),
            live_instances: resources
                .instances
                .iter()
                .filter(|weak| weak.strong_count() > 0)
                .count(),
            timers: resources.timers.len(),
            listeners: resources.listeners.len(),
        };

        for timer in resources.timers {
            timer.abort();
        }
        for listener in resources.listeners {
            bus.unsubscribe(&listener);
        }
        debug!(
            plugin,
            timers = stats.timers,
            listeners = stats.listeners,
            "plugin resources reclaimed"
        );
        stats
    }

    /// Stats for one plugin without reclaiming anything.
    pub fn stats(&self, plugin: &str) -> Option<PluginMemoryStats> {
        let inner = self.inner.lock().unwrap();
        inner.get(plugin).map(|resources| PluginMemoryStats {
            tracked_instances: resources.instances.len(),
            live_instances: resources
                .instances
                .iter()
                .filter(|weak| weak.strong_count() > 0)
                .count(),
            timers: resources.timers.len(),
            listeners: resources.listeners.len(),
        })
    }

    /// Aggregate stats across all tracked plugins.
    pub fn aggregate(&self) -> PluginMemoryStats {
        let inner = self.inner.lock().unwrap();
        let mut total = PluginMemoryStats::default();
        for resources in inner.values() {
            total.tracked_instances += resources.instances.len();
            total.live_instances += resources
                .instances
                .iter()
                .filter(|weak| weak.strong_count() > 0)
                .count();
            total.timers += resources.timers.len();
            total.listeners += resources.listeners.len();
        }
        total
    }
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MemoryTracker")
            .field("plugins", &inner.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn weak_tracking_reports_liveness() {
        let tracker = MemoryTracker::new();
        let instance: Arc<AnyInstance> = Arc::new(42u32);
        tracker.track_instance("auth", &instance);

        let stats = tracker.stats("auth").unwrap();
        assert_eq!(stats.tracked_instances, 1);
        assert_eq!(stats.live_instances, 1);

        drop(instance);
        let stats = tracker.stats("auth").unwrap();
        assert_eq!(stats.live_instances, 0);
    }

    #[tokio::test]
    async fn cleanup_aborts_timers_and_unsubscribes() {
        let bus = EventBus::with_defaults();
        let tracker = MemoryTracker::new();

        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        tracker.track_timer("auth", timer);

        let handle = bus.subscribe(
            EventKind::Loaded,
            crate::events::listener(|_| async { Ok(()) }),
        );
        tracker.track_listener("auth", handle);

        let stats = tracker.cleanup("auth", &bus);
        assert_eq!(stats.timers, 1);
        assert_eq!(stats.listeners, 1);
        assert!(tracker.stats("auth").is_none());
    }

    #[tokio::test]
    async fn aggregate_sums_plugins() {
        let tracker = MemoryTracker::new();
        let a: Arc<AnyInstance> = Arc::new(1u8);
        let b: Arc<AnyInstance> = Arc::new(2u8);
        tracker.track_instance("alpha", &a);
        tracker.track_instance("beta", &b);
        assert_eq!(tracker.aggregate().tracked_instances, 2);
    }
}
