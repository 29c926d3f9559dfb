//! The plugin host facade.
//!
//! Owns every subsystem and drives the whole lifecycle: discovery, planning,
//! batch loading, background maintenance (cache sweeper, periodic conflict
//! scan), reload, and ordered shutdown. The control plane and the CLI only
//! ever talk to this type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheStats, PluginCache};
use crate::circuit::{CircuitBreakerRegistry, CircuitConfig, CircuitState, CircuitStats};
use crate::config::HostConfig;
use crate::conflicts::{ConflictDetector, PluginConflict};
use crate::descriptor::{ModuleLoader, StaticModuleLoader};
use crate::discovery::DiscoveryScanner;
use crate::error::HostResult;
use crate::events::{BusStatsSnapshot, EventBus, EventBusConfig, EventKind, PluginEvent};
use crate::guards::{GuardManager, GuardStatistics};
use crate::loader::{LoadReport, LoadedPlugin, PluginLoader};
use crate::memtrack::{MemoryTracker, PluginMemoryStats};
use crate::registry::{RegistryClient, UpdateInfo};
use crate::services::{CrossPluginServiceManager, ServiceStatistics};
use crate::state::{PluginState, PluginStateMachine};

/// Aggregate statistics for the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub plugins_by_state: HashMap<String, usize>,
    pub cache: CacheStats,
    pub services: ServiceStatistics,
    pub guards: GuardStatistics,
    pub memory: PluginMemoryStats,
    pub events_published: u64,
    pub events_dropped: u64,
}

/// Per-plugin health view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHealth {
    pub plugin: String,
    pub state: Option<PluginState>,
    pub circuit: CircuitState,
    pub healthy: bool,
}

/// The long-lived plugin host.
pub struct PluginHost {
    config: HostConfig,
    bus: Arc<EventBus>,
    cache: Arc<PluginCache>,
    states: Arc<PluginStateMachine>,
    circuits: Arc<CircuitBreakerRegistry>,
    services: Arc<CrossPluginServiceManager>,
    guards: Arc<GuardManager>,
    loader: Arc<PluginLoader>,
    conflicts: Arc<ConflictDetector>,
    memory: Arc<MemoryTracker>,
    registry: Arc<RegistryClient>,
    scanner: DiscoveryScanner,
    module_loader: Arc<dyn ModuleLoader>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginHost {
    /// Build a host with the default in-process module loader.
    pub fn new(config: HostConfig) -> HostResult<Arc<Self>> {
        Self::with_module_loader(config, Arc::new(StaticModuleLoader::new()))
    }

    /// Build a host around a custom module loader.
    pub fn with_module_loader(
        config: HostConfig,
        module_loader: Arc<dyn ModuleLoader>,
    ) -> HostResult<Arc<Self>> {
        let bus = EventBus::new(EventBusConfig::default());
        let cache = Arc::new(PluginCache::new(config.cache.clone()));
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        let circuits = Arc::new(CircuitBreakerRegistry::new(
            CircuitConfig::default(),
            Arc::clone(&bus),
        ));
        let services = Arc::new(CrossPluginServiceManager::new(Arc::clone(&bus)));
        let guards = Arc::new(GuardManager::new(Arc::clone(&states), Arc::clone(&bus)));
        let memory = Arc::new(MemoryTracker::new());
        let conflicts = Arc::new(ConflictDetector::new(Arc::clone(&bus)));
        let registry = Arc::new(RegistryClient::new(
            &config.registry_url,
            config.registry_timeout(),
            Arc::clone(&bus),
        )?);
        let scanner = DiscoveryScanner::new(
            Arc::clone(&cache),
            Arc::clone(&states),
            Arc::clone(&bus),
            config.max_file_size,
            config.regex_timeout(),
        );
        let loader = Arc::new(PluginLoader::new(
            config.clone(),
            Arc::clone(&states),
            Arc::clone(&bus),
            Arc::clone(&cache),
            Arc::clone(&circuits),
            Arc::clone(&services),
            Arc::clone(&guards),
            Arc::clone(&module_loader),
            Arc::clone(&memory),
        ));

        Ok(Arc::new(Self {
            config,
            bus,
            cache,
            states,
            circuits,
            services,
            guards,
            loader,
            conflicts,
            memory,
            registry,
            scanner,
            module_loader,
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Discover, plan, and load everything under the plugins directory, then
    /// start background maintenance. `Err` only when a critical plugin
    /// failed; partial failure is a successful start.
    pub async fn start(&self) -> HostResult<LoadReport> {
        if !self.config.plugins_dir.exists() {
            tokio::fs::create_dir_all(&self.config.plugins_dir).await?;
        }

        let discoveries = self.scanner.scan(&self.config.plugins_dir).await?;
        let report = self.loader.load_all(discoveries).await?;

        self.spawn_background();
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "host started"
        );
        Ok(report)
    }

    fn spawn_background(&self) {
        let mut background = self.background.lock().unwrap();
        background.push(self.cache.spawn_sweeper());
        let loader = Arc::clone(&self.loader);
        background.push(Arc::clone(&self.conflicts).spawn_periodic(
            std::time::Duration::from_millis(self.config.conflict_scan_interval_ms.max(1)),
            move || loader.loaded_manifests(),
        ));
    }

    /// Unload one plugin.
    pub async fn unload_plugin(&self, name: &str) -> HostResult<()> {
        self.loader.unload(name).await
    }

    /// Unload (if needed) and load a plugin again from its directory.
    pub async fn reload_plugin(&self, name: &str) -> HostResult<()> {
        if self.loader.get_loaded(name).is_some() {
            self.loader.unload(name).await?;
        } else {
            // a failed plugin keeps a terminal state record; clear it
            self.states.remove(name);
        }

        let dir = self.config.plugins_dir.join(name);
        // the previous manifest may be stale
        self.cache.invalidate(&format!(
            "manifest:{}",
            dir.join(crate::manifest::MANIFEST_FILE).display()
        ));
        let discovery = self.scanner.discover_one(&dir).await?;
        self.loader.load_one(discovery).await?;
        self.bus
            .publish(PluginEvent::new(EventKind::Reloaded, name, "host"));
        Ok(())
    }

    /// Install a plugin from the registry and load it.
    pub async fn install_from_registry(&self, name: &str) -> HostResult<()> {
        self.registry
            .download(name, &self.config.plugins_dir)
            .await?;
        if self.loader.get_loaded(name).is_some() {
            self.reload_plugin(name).await
        } else {
            self.states.remove(name);
            let dir = self.config.plugins_dir.join(name);
            let discovery = self.scanner.discover_one(&dir).await?;
            self.loader.load_one(discovery).await
        }
    }

    /// Check the registry for updates to loaded plugins.
    pub async fn check_updates(&self) -> HostResult<Vec<UpdateInfo>> {
        let installed: HashMap<String, String> = self
            .loader
            .loaded_manifests()
            .into_iter()
            .map(|(name, manifest)| (name, manifest.version))
            .collect();
        self.registry.check_updates(&installed).await
    }

    /// Run an on-demand conflict scan over the loaded set.
    pub fn scan_conflicts(&self) -> Vec<PluginConflict> {
        self.conflicts.scan(&self.loader.loaded_manifests())
    }

    /// Per-plugin health: lifecycle state plus circuit state.
    pub fn health(&self, plugin: Option<&str>) -> Vec<PluginHealth> {
        let names: Vec<String> = match plugin {
            Some(name) => vec![name.to_string()],
            None => self.states.snapshot().keys().cloned().collect(),
        };
        names
            .into_iter()
            .map(|name| {
                let state = self.states.current_state(&name);
                let circuit = self.circuits.state(&name);
                PluginHealth {
                    healthy: state == Some(PluginState::Loaded)
                        && circuit == CircuitState::Closed,
                    plugin: name,
                    state,
                    circuit,
                }
            })
            .collect()
    }

    /// Circuit metrics, optionally narrowed to one plugin.
    pub fn metrics(&self, plugin: Option<&str>) -> HashMap<String, CircuitStats> {
        match plugin {
            Some(name) => self
                .circuits
                .stats(name)
                .map(|stats| HashMap::from([(name.to_string(), stats)]))
                .unwrap_or_default(),
            None => self.circuits.all_stats(),
        }
    }

    pub fn stats(&self) -> HostStats {
        let bus: BusStatsSnapshot = self.bus.stats();
        HostStats {
            plugins_by_state: self
                .states
                .counts()
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
            cache: self.cache.stats(),
            services: self.services.statistics(),
            guards: self.guards.statistics(),
            memory: self.memory.aggregate(),
            events_published: bus.bus.published,
            events_dropped: bus.bus.dropped_rate_limited + bus.bus.dropped_invalid,
        }
    }

    /// Unload everything in reverse load order and stop background tasks.
    pub async fn shutdown(&self) {
        info!("shutting down plugin host");
        let mut names = self.loader.loaded_names();
        names.reverse();
        for name in names {
            if let Err(e) = self.loader.unload(&name).await {
                warn!(plugin = %name, error = %e, "unload during shutdown failed");
            }
        }
        self.bus.flush_batches();
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // Accessors consumed by the control plane and tests.

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn states(&self) -> &Arc<PluginStateMachine> {
        &self.states
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn services(&self) -> &Arc<CrossPluginServiceManager> {
        &self.services
    }

    pub fn guards(&self) -> &Arc<GuardManager> {
        &self.guards
    }

    pub fn registry(&self) -> &Arc<RegistryClient> {
        &self.registry
    }

    pub fn module_loader(&self) -> &Arc<dyn ModuleLoader> {
        &self.module_loader
    }

    /// Loaded plugin summaries for `/plugins/installed`.
    pub fn installed(&self) -> Vec<serde_json::Value> {
        self.loader
            .loaded_names()
            .into_iter()
            .filter_map(|name| self.loader.get_loaded(&name))
            .map(|plugin: LoadedPlugin| {
                json!({
                    "name": plugin.discovery.name,
                    "version": plugin.discovery.manifest.version,
                    "description": plugin.discovery.manifest.description,
                    "critical": plugin.discovery.manifest.critical,
                    "loadedAt": plugin.loaded_at,
                    "controllers": plugin.module.controllers.len(),
                    "services": plugin.module.services.len(),
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins_dir", &self.config.plugins_dir)
            .finish()
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
