//! Plugin loader and batch scheduler.
//!
//! Drives every plugin from DISCOVERED to LOADED (or FAILED) in
//! topologically sound batches. Within a batch plugins load concurrently
//! with no mutual ordering; a new batch starts only after every member of
//! the previous one reached LOADED or FAILED. A failure cascades FAILED to
//! every not-yet-loaded dependent; a failing `critical` plugin aborts the
//! whole load.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::PluginCache;
use crate::circuit::CircuitBreakerRegistry;
use crate::config::{HostConfig, LoadingStrategy};
use crate::descriptor::{HookContext, HookPhase, ModuleLoader, PluginDescriptor, SymbolHandle};
use crate::discovery::PluginDiscovery;
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, EventKind, PluginEvent};
use crate::guards::{GuardManager, ResolvedGuard};
use crate::manifest::{PluginManifest, MODULE_ENTRY};
use crate::memtrack::MemoryTracker;
use crate::resolver::{compute_plan, DependencyWaiter};
use crate::services::{CrossPluginServiceManager, ServiceProvider};
use crate::state::{PluginState, PluginStateMachine};

/// A controller symbol bound to its owning plugin, so the guard interceptor
/// can attribute runtime calls.
#[derive(Debug, Clone)]
pub struct ControllerBinding {
    pub name: String,
    pub owner: String,
    pub handle: Option<SymbolHandle>,
}

/// The module composition built for a loaded plugin.
#[derive(Debug, Clone, Default)]
pub struct PluginModule {
    pub controllers: Vec<ControllerBinding>,
    pub providers: Vec<String>,
    pub exports: Vec<String>,
    pub imports: Vec<String>,
    pub guards: Vec<ResolvedGuard>,
    pub services: Vec<ServiceProvider>,
    pub global_module: bool,
}

/// A fully loaded plugin.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub discovery: PluginDiscovery,
    pub descriptor: PluginDescriptor,
    pub module: PluginModule,
    pub loaded_at: DateTime<Utc>,
    pub load_seq: u64,
}

/// Outcome of a full load pass.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: HashMap<String, String>,
    pub cyclic: Vec<String>,
}

/// The batch-driven plugin loader.
pub struct PluginLoader {
    config: HostConfig,
    states: Arc<PluginStateMachine>,
    bus: Arc<EventBus>,
    cache: Arc<PluginCache>,
    circuits: Arc<CircuitBreakerRegistry>,
    services: Arc<CrossPluginServiceManager>,
    guards: Arc<GuardManager>,
    waiter: DependencyWaiter,
    module_loader: Arc<dyn ModuleLoader>,
    memory: Arc<MemoryTracker>,
    loaded: RwLock<HashMap<String, LoadedPlugin>>,
    in_flight: Mutex<HashSet<String>>,
    load_seq: AtomicU64,
}

impl PluginLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HostConfig,
        states: Arc<PluginStateMachine>,
        bus: Arc<EventBus>,
        cache: Arc<PluginCache>,
        circuits: Arc<CircuitBreakerRegistry>,
        services: Arc<CrossPluginServiceManager>,
        guards: Arc<GuardManager>,
        module_loader: Arc<dyn ModuleLoader>,
        memory: Arc<MemoryTracker>,
    ) -> Self {
        let waiter = DependencyWaiter::new(Arc::clone(&states), Arc::clone(&bus));
        Self {
            config,
            states,
            bus,
            cache,
            circuits,
            services,
            guards,
            waiter,
            module_loader,
            memory,
            loaded: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            load_seq: AtomicU64::new(0),
        }
    }

    /// Load every discovered plugin. Returns `Err` only when a critical
    /// plugin failed; partial failure is reported in the [`LoadReport`].
    pub async fn load_all(&self, discoveries: Vec<PluginDiscovery>) -> HostResult<LoadReport> {
        let plan = compute_plan(&discoveries);
        let by_name: HashMap<String, PluginDiscovery> = discoveries
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut report = LoadReport {
            cyclic: plan.cyclic.clone(),
            ..LoadReport::default()
        };

        // Plan-level exclusions fail before any batch runs.
        if !plan.cyclic.is_empty() {
            self.bus.publish(
                PluginEvent::new(EventKind::Error, "", "loader").with_payload(json!({
                    "message": format!("dependency cycle: {:?}", plan.cyclic),
                    "errorKind": "dependency-cycle",
                    "plugins": plan.cyclic,
                })),
            );
        }
        for name in &plan.cyclic {
            self.mark_failed(name, "dependency-cycle", &mut report);
        }
        for (name, dependency) in &plan.missing {
            warn!(plugin = %name, dependency = %dependency, "missing dependency");
            self.mark_failed(name, "dependency-missing", &mut report);
        }
        for name in &plan.cascaded {
            self.mark_failed(name, "dependency-cascade", &mut report);
        }

        if let Some(critical) = self.first_critical(&report, &by_name) {
            return Err(critical);
        }

        let batches: Vec<Vec<String>> = match self.config.loading_strategy {
            LoadingStrategy::Sequential => {
                plan.order.iter().map(|name| vec![name.clone()]).collect()
            }
            LoadingStrategy::Parallel | LoadingStrategy::Batch => plan.batches.clone(),
        };

        for batch in batches {
            debug!(?batch, "starting load batch");
            let runnable: Vec<&PluginDiscovery> = batch
                .iter()
                .filter(|name| {
                    self.states.current_state(name) == Some(PluginState::Discovered)
                })
                .filter_map(|name| by_name.get(name.as_str()))
                .collect();

            let results = join_all(
                runnable
                    .iter()
                    .map(|discovery| self.load_one((*discovery).clone())),
            )
            .await;

            for (discovery, result) in runnable.iter().zip(results) {
                match result {
                    Ok(()) => report.loaded.push(discovery.name.clone()),
                    Err(err) => {
                        report
                            .failed
                            .insert(discovery.name.clone(), err.kind().to_string());
                        self.cascade_dependents(&discovery.name, &by_name, &mut report);
                    }
                }
            }

            if let Some(critical) = self.first_critical(&report, &by_name) {
                return Err(critical);
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "load pass complete"
        );
        Ok(report)
    }

    /// Load one plugin through the full pipeline.
    pub async fn load_one(&self, discovery: PluginDiscovery) -> HostResult<()> {
        let name = discovery.name.clone();

        // At most one concurrent load per plugin name.
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(name.clone()) {
                return Err(HostError::Internal(format!(
                    "plugin '{name}' is already loading"
                )));
            }
        }
        let result = self.load_inner(&discovery).await;
        self.in_flight.lock().unwrap().remove(&name);

        match result {
            Ok(()) => Ok(()),
            Err((err, descriptor)) => {
                self.fail_plugin(&discovery, &err, descriptor.as_ref()).await;
                Err(err)
            }
        }
    }

    async fn load_inner(
        &self,
        discovery: &PluginDiscovery,
    ) -> Result<(), (HostError, Option<PluginDescriptor>)> {
        let name = &discovery.name;

        self.states
            .transition(name, PluginState::Loading)
            .map_err(|e| (e, None))?;
        self.bus.publish(
            PluginEvent::new(EventKind::LoadingStarted, name, "loader")
                .with_payload(json!({ "version": discovery.manifest.version })),
        );

        // Circuit admission; an open breaker skips the plugin entirely.
        let admission = self.circuits.admit(name).map_err(|e| (e, None))?;

        self.waiter
            .wait_for(name, &discovery.dependencies, self.config.dependency_timeout())
            .await
            .map_err(|e| (e, None))?;
        self.progress(name, "dependencies-resolved");

        // Import the code bundle; stale cache entries for the path go first.
        let module_path = discovery.path.join(MODULE_ENTRY);
        self.cache
            .invalidate(&format!("module:{}", module_path.display()));
        let descriptor = self
            .module_loader
            .load_module(discovery)
            .await
            .map_err(|e| (e, None))?;
        self.progress(name, "module-imported");

        if let Err(err) = self
            .run_hook(name, &descriptor, HookPhase::BeforeLoad, None)
            .await
        {
            return Err((err, Some(descriptor)));
        }

        if let Err(err) =
            self.guards
                .store_guards(name, &discovery.manifest, &descriptor.symbols)
        {
            return Err((err, Some(descriptor)));
        }
        if let Err(err) = self.guards.validate_plugin_graph(name).await {
            self.guards.remove_plugin_guards(name);
            return Err((err, Some(descriptor)));
        }

        let mut module = self.compose_module(name, &discovery.manifest, &descriptor);
        let declared_guards: Vec<String> = discovery
            .manifest
            .module
            .guards
            .iter()
            .map(|guard| guard.name().to_string())
            .collect();
        module.guards = self.guards.resolve(name, &declared_guards).await.resolved;

        if let Err(err) = self
            .run_hook(name, &descriptor, HookPhase::AfterLoad, None)
            .await
        {
            warn!(plugin = %name, error = %err, "afterLoad hook failed, continuing");
        }

        let loaded = LoadedPlugin {
            discovery: discovery.clone(),
            descriptor,
            module,
            loaded_at: Utc::now(),
            load_seq: self.load_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.loaded
            .write()
            .unwrap()
            .insert(name.clone(), loaded);

        self.states
            .transition(name, PluginState::Loaded)
            .map_err(|e| (e, None))?;
        self.circuits.record_success(name);
        drop(admission);
        self.bus.publish(
            PluginEvent::new(EventKind::Loaded, name, "loader")
                .with_payload(json!({ "version": discovery.manifest.version })),
        );
        info!(plugin = %name, "plugin loaded");
        Ok(())
    }

    /// Resolve declared symbols into the module composition. Missing symbols
    /// warn and drop; they never fail the plugin.
    fn compose_module(
        &self,
        plugin: &str,
        manifest: &PluginManifest,
        descriptor: &PluginDescriptor,
    ) -> PluginModule {
        let resolve_names = |declared: &[String], kind: &str| -> Vec<String> {
            declared
                .iter()
                .filter(|symbol| {
                    let present = descriptor.symbols.contains(symbol);
                    if !present {
                        warn!(plugin, symbol = %symbol, kind, "declared symbol missing, dropped");
                    }
                    present
                })
                .cloned()
                .collect()
        };

        let controllers = manifest
            .module
            .controllers
            .iter()
            .filter(|symbol| {
                let present = descriptor.symbols.contains(symbol);
                if !present {
                    warn!(plugin, symbol = %symbol, "controller symbol missing, dropped");
                }
                present
            })
            .map(|symbol| ControllerBinding {
                name: symbol.clone(),
                owner: plugin.to_string(),
                handle: descriptor.symbols.get(symbol).cloned(),
            })
            .collect();

        let services = self
            .services
            .create_providers(plugin, manifest, &descriptor.symbols);

        PluginModule {
            controllers,
            providers: resolve_names(&manifest.module.providers, "provider"),
            exports: resolve_names(&manifest.module.exports, "export"),
            imports: manifest.module.imports.clone(),
            guards: Vec::new(),
            services,
            global_module: self
                .config
                .global_module_allowlist
                .iter()
                .any(|allowed| allowed == plugin),
        }
    }

    /// Unload a plugin: hooks, index removal, state teardown.
    pub async fn unload(&self, name: &str) -> HostResult<()> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(name.to_string()) {
                return Err(HostError::Internal(format!(
                    "plugin '{name}' has an operation in flight"
                )));
            }
        }
        let result = self.unload_inner(name).await;
        self.in_flight.lock().unwrap().remove(name);
        result
    }

    async fn unload_inner(&self, name: &str) -> HostResult<()> {
        let descriptor = {
            let loaded = self.loaded.read().unwrap();
            let Some(plugin) = loaded.get(name) else {
                return Err(HostError::PluginNotFound {
                    plugin: name.to_string(),
                });
            };
            plugin.descriptor.clone()
        };

        if let Err(err) = self
            .run_hook(name, &descriptor, HookPhase::BeforeUnload, None)
            .await
        {
            warn!(plugin = %name, error = %err, "beforeUnload hook failed, continuing");
        }

        // Remove the plugin from every index before announcing the unload.
        self.loaded.write().unwrap().remove(name);
        self.services.remove_plugin_services(name);
        self.guards.remove_plugin_guards(name);
        self.memory.cleanup(name, &self.bus);
        self.states.transition(name, PluginState::Unloaded)?;
        self.states.remove(name);

        if let Err(err) = self
            .run_hook(name, &descriptor, HookPhase::AfterUnload, None)
            .await
        {
            warn!(plugin = %name, error = %err, "afterUnload hook failed, continuing");
        }
        self.module_loader.unload_module(name).await?;

        self.bus
            .publish(PluginEvent::new(EventKind::Unloaded, name, "loader"));
        info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Names of loaded plugins, in load order.
    pub fn loaded_names(&self) -> Vec<String> {
        let loaded = self.loaded.read().unwrap();
        let mut entries: Vec<(&String, u64)> = loaded
            .iter()
            .map(|(name, plugin)| (name, plugin.load_seq))
            .collect();
        entries.sort_by_key(|(_, seq)| *seq);
        entries.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn get_loaded(&self, name: &str) -> Option<LoadedPlugin> {
        self.loaded.read().unwrap().get(name).cloned()
    }

    /// Manifests of all loaded plugins; input to the conflict detector.
    pub fn loaded_manifests(&self) -> HashMap<String, PluginManifest> {
        self.loaded
            .read()
            .unwrap()
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.discovery.manifest.clone()))
            .collect()
    }

    fn progress(&self, plugin: &str, step: &str) {
        self.bus.publish(
            PluginEvent::new(EventKind::LoadingProgress, plugin, "loader")
                .with_payload(json!({ "step": step })),
        );
    }

    async fn run_hook(
        &self,
        plugin: &str,
        descriptor: &PluginDescriptor,
        phase: HookPhase,
        error: Option<String>,
    ) -> HostResult<()> {
        let Some(hook) = descriptor.hooks.get(phase) else {
            return Ok(());
        };
        let context = HookContext {
            plugin: plugin.to_string(),
            phase,
            error,
        };
        let timeout = self.config.hook_timeout();
        match tokio::time::timeout(timeout, hook(context)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(HostError::LifecycleHookFailure {
                plugin: plugin.to_string(),
                hook: phase.as_str().to_string(),
                reason,
            }),
            Err(_) => Err(HostError::LifecycleHookTimeout {
                plugin: plugin.to_string(),
                hook: phase.as_str().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Record a failure: state, cleanup, events, onError hook.
    async fn fail_plugin(
        &self,
        discovery: &PluginDiscovery,
        err: &HostError,
        descriptor: Option<&PluginDescriptor>,
    ) {
        let name = &discovery.name;
        warn!(plugin = %name, error = %err, "plugin failed to load");

        self.circuits.record_failure(name);
        self.guards.remove_plugin_guards(name);
        self.services.remove_plugin_services(name);
        self.loaded.write().unwrap().remove(name);

        match self.states.current_state(name) {
            Some(PluginState::Loading) | Some(PluginState::Discovered) => {
                let _ = self.states.transition(name, PluginState::Failed);
            }
            _ => {}
        }

        self.bus.publish(
            PluginEvent::new(EventKind::LoadFailed, name, "loader").with_payload(json!({
                "reason": err.kind(),
                "message": err.to_string(),
            })),
        );

        // onError is best-effort and only possible once the module loaded.
        if let Some(descriptor) = descriptor {
            if let Err(hook_err) = self
                .run_hook(name, descriptor, HookPhase::OnError, Some(err.to_string()))
                .await
            {
                debug!(plugin = %name, error = %hook_err, "onError hook failed");
            }
        }
    }

    /// Fail a plugin before its batch ever ran (plan exclusion / cascade).
    fn mark_failed(&self, name: &str, reason: &str, report: &mut LoadReport) {
        if self.states.current_state(name) == Some(PluginState::Discovered) {
            let _ = self.states.transition(name, PluginState::Failed);
        }
        report.failed.insert(name.to_string(), reason.to_string());
        self.bus.publish(
            PluginEvent::new(EventKind::LoadFailed, name, "loader")
                .with_payload(json!({ "reason": reason })),
        );
    }

    /// Transitively fail every not-yet-loaded dependent of `failed`.
    fn cascade_dependents(
        &self,
        failed: &str,
        by_name: &HashMap<String, PluginDiscovery>,
        report: &mut LoadReport,
    ) {
        let mut stack = vec![failed.to_string()];
        while let Some(current) = stack.pop() {
            for (name, discovery) in by_name {
                if discovery.dependencies.contains(&current)
                    && self.states.current_state(name) == Some(PluginState::Discovered)
                {
                    self.mark_failed(name, "dependency-cascade", report);
                    stack.push(name.clone());
                }
            }
        }
    }

    fn first_critical(
        &self,
        report: &LoadReport,
        by_name: &HashMap<String, PluginDiscovery>,
    ) -> Option<HostError> {
        report.failed.iter().find_map(|(name, reason)| {
            by_name
                .get(name)
                .filter(|discovery| discovery.manifest.critical)
                .map(|_| HostError::CriticalPluginFailed {
                    plugin: name.clone(),
                    reason: reason.clone(),
                })
        })
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &self.loaded.read().unwrap().len())
            .finish()
    }
}
