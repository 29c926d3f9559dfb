//! Plugin descriptors and the module-loader seam.
//!
//! The host never inspects plugin code. A pluggable [`ModuleLoader`] turns a
//! discovered plugin into a [`PluginDescriptor`]: a symbol table of named
//! handles plus explicitly registered lifecycle hooks. The default
//! [`StaticModuleLoader`] resolves descriptors from in-process factories
//! keyed by plugin name; a loader that reads `dist/index.js` bundles can
//! slot in behind the same trait.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::discovery::PluginDiscovery;
use crate::error::{HostError, HostResult};

/// A callable symbol: takes and returns JSON, the host's neutral currency.
pub type ServiceFn = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// A named handle exported by a plugin binary.
#[derive(Clone)]
pub enum SymbolHandle {
    Callable(ServiceFn),
    Value(serde_json::Value),
}

impl std::fmt::Debug for SymbolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolHandle::Callable(_) => f.write_str("Callable(..)"),
            SymbolHandle::Value(value) => write!(f, "Value({value})"),
        }
    }
}

/// Abstract symbol table returned by a module loader.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, SymbolHandle>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_callable<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.symbols
            .insert(name.to_string(), SymbolHandle::Callable(Arc::new(f)));
        self
    }

    pub fn insert_value(mut self, name: &str, value: serde_json::Value) -> Self {
        self.symbols
            .insert(name.to_string(), SymbolHandle::Value(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&SymbolHandle> {
        self.symbols.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn callable(&self, name: &str) -> Option<ServiceFn> {
        match self.symbols.get(name) {
            Some(SymbolHandle::Callable(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.symbols.keys().map(|k| k.as_str()).collect()
    }
}

/// Lifecycle phases a plugin may hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    BeforeLoad,
    AfterLoad,
    BeforeUnload,
    AfterUnload,
    OnError,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::BeforeLoad => "beforeLoad",
            HookPhase::AfterLoad => "afterLoad",
            HookPhase::BeforeUnload => "beforeUnload",
            HookPhase::AfterUnload => "afterUnload",
            HookPhase::OnError => "onError",
        }
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context handed to a lifecycle hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub plugin: String,
    pub phase: HookPhase,
    /// Set for `onError` hooks: the failure being reported.
    pub error: Option<String>,
}

/// Boxed future returned by a hook.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A lifecycle hook callable.
pub type HookFn = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Wrap an async closure into a [`HookFn`].
pub fn hook<F, Fut>(f: F) -> HookFn
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Hooks a plugin registered explicitly on its descriptor.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    hooks: HashMap<HookPhase, HookFn>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, phase: HookPhase, f: HookFn) -> Self {
        self.hooks.insert(phase, f);
        self
    }

    pub fn get(&self, phase: HookPhase) -> Option<HookFn> {
        self.hooks.get(&phase).cloned()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phases: Vec<&str> = self.hooks.keys().map(|p| p.as_str()).collect();
        write!(f, "LifecycleHooks({phases:?})")
    }
}

/// Everything the host needs from a loaded plugin binary.
#[derive(Debug, Clone, Default)]
pub struct PluginDescriptor {
    pub symbols: SymbolTable,
    pub hooks: LifecycleHooks,
}

impl PluginDescriptor {
    pub fn new(symbols: SymbolTable) -> Self {
        Self {
            symbols,
            hooks: LifecycleHooks::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Loads a plugin's code bundle and returns its descriptor.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load_module(&self, discovery: &PluginDiscovery) -> HostResult<PluginDescriptor>;

    /// Release loader-side resources for a plugin. Default: nothing to do.
    async fn unload_module(&self, _plugin: &str) -> HostResult<()> {
        Ok(())
    }
}

/// Factory producing a descriptor for one plugin.
pub type DescriptorFactory = Arc<dyn Fn() -> PluginDescriptor + Send + Sync>;

/// Default module loader: an in-process registry of descriptor factories.
#[derive(Default)]
pub struct StaticModuleLoader {
    factories: RwLock<HashMap<String, DescriptorFactory>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a plugin name.
    pub fn register<F>(&self, plugin: &str, factory: F)
    where
        F: Fn() -> PluginDescriptor + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap()
            .insert(plugin.to_string(), Arc::new(factory));
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load_module(&self, discovery: &PluginDiscovery) -> HostResult<PluginDescriptor> {
        let factory = {
            let factories = self.factories.read().unwrap();
            factories.get(&discovery.name).cloned()
        };
        match factory {
            Some(factory) => Ok(factory()),
            None => Err(HostError::ModuleInvalid {
                plugin: discovery.name.clone(),
                reason: "no module registered for plugin".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for StaticModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.factories.read().unwrap().keys().cloned().collect();
        write!(f, "StaticModuleLoader({names:?})")
    }
}
