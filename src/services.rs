//! Cross-plugin service manager.
//!
//! Every service a plugin exports is registered under a host-unique token of
//! the form `<PLUGIN>_<SERVICE>_<8-hex>`. Tokens never overwrite each other:
//! a collision generates a fresh suffix (up to ten attempts) and finally a
//! base36-timestamp fallback. Only tokens marked `global` are visible to
//! other plugins by service name.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::descriptor::{ServiceFn, SymbolTable};
use crate::events::{EventBus, EventKind, PluginEvent};
use crate::manifest::PluginManifest;

const MAX_TOKEN_ATTEMPTS: u32 = 10;
const MIN_TOKEN_LEN: usize = 8;
const MAX_TOKEN_LEN: usize = 128;

static STANDARD_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*_[0-9a-f]{8}$").expect("token regex is valid"));
static TIMESTAMP_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+_[a-z0-9-]+_[0-9a-z]+$").expect("token regex is valid"));

/// A registered cross-plugin service.
#[derive(Clone)]
pub struct ServiceProvider {
    pub token: String,
    pub service_name: String,
    pub plugin: String,
    pub global: bool,
    pub version: Option<String>,
    pub deprecated: bool,
    pub handle: ServiceFn,
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("token", &self.token)
            .field("service_name", &self.service_name)
            .field("plugin", &self.plugin)
            .field("global", &self.global)
            .finish()
    }
}

/// Result of [`CrossPluginServiceManager::validate_token`].
#[derive(Debug, Clone, Serialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub security_level: SecurityLevel,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    High,
    Medium,
    Low,
}

/// Aggregate statistics over the service index.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatistics {
    pub total: usize,
    pub global: usize,
    pub by_plugin: HashMap<String, usize>,
    pub average_token_length: f64,
    pub patterns: HashMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    providers: HashMap<String, ServiceProvider>,
    global_tokens: HashSet<String>,
    by_plugin: HashMap<String, Vec<String>>,
}

/// Registry of service tokens across the host.
pub struct CrossPluginServiceManager {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
}

impl CrossPluginServiceManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
        }
    }

    /// Register a provider for every declared service whose symbol exists
    /// and is callable. Missing or non-callable symbols are skipped with a
    /// warning.
    pub fn create_providers(
        &self,
        plugin: &str,
        manifest: &PluginManifest,
        symbols: &SymbolTable,
    ) -> Vec<ServiceProvider> {
        let mut created = Vec::new();
        for config in &manifest.module.cross_plugin_services {
            let Some(handle) = symbols.callable(&config.service_name) else {
                warn!(
                    plugin,
                    service = %config.service_name,
                    "service symbol missing or not callable, skipping"
                );
                continue;
            };

            let token = self.register(
                plugin,
                &config.service_name,
                config.token.clone(),
                config.global,
                config.version.clone(),
                config.deprecated,
                handle,
            );
            let inner = self.inner.lock().unwrap();
            if let Some(provider) = inner.providers.get(&token) {
                created.push(provider.clone());
            }
        }
        created
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        plugin: &str,
        service_name: &str,
        declared_token: Option<String>,
        global: bool,
        version: Option<String>,
        deprecated: bool,
        handle: ServiceFn,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();
        let mut token = declared_token.unwrap_or_else(|| generate_token(plugin, service_name));
        let mut collided_with: Option<String> = None;
        let mut attempts = 0u32;

        while inner.providers.contains_key(&token) {
            if collided_with.is_none() {
                collided_with = inner
                    .providers
                    .get(&token)
                    .map(|existing| existing.plugin.clone());
            }
            attempts += 1;
            if attempts >= MAX_TOKEN_ATTEMPTS {
                token = fallback_token(plugin, service_name);
                warn!(
                    plugin,
                    service = service_name,
                    token,
                    "token collision persisted, using timestamp fallback"
                );
                break;
            }
            token = generate_token(plugin, service_name);
        }

        let provider = ServiceProvider {
            token: token.clone(),
            service_name: service_name.to_string(),
            plugin: plugin.to_string(),
            global,
            version,
            deprecated,
            handle,
        };
        inner.providers.insert(token.clone(), provider);
        if global {
            inner.global_tokens.insert(token.clone());
        }
        inner
            .by_plugin
            .entry(plugin.to_string())
            .or_default()
            .push(token.clone());
        drop(inner);

        if let Some(existing) = collided_with {
            self.bus.publish(
                PluginEvent::new(EventKind::SecurityWarning, plugin, "service-manager")
                    .with_payload(json!({
                        "reason": "service-token-collision",
                        "service": service_name,
                        "existingOwner": existing,
                    })),
            );
        }
        debug!(plugin, service = service_name, token, "service provider registered");
        token
    }

    /// O(1) provider lookup by token.
    pub fn get_provider(&self, token: &str) -> Option<ServiceProvider> {
        self.inner.lock().unwrap().providers.get(token).cloned()
    }

    /// Lookup a globally visible service by name.
    pub fn find_global(&self, service_name: &str) -> Option<ServiceProvider> {
        let inner = self.inner.lock().unwrap();
        inner
            .global_tokens
            .iter()
            .filter_map(|token| inner.providers.get(token))
            .find(|provider| provider.service_name == service_name)
            .cloned()
    }

    /// All providers owned by one plugin.
    pub fn providers_for(&self, plugin: &str) -> Vec<ServiceProvider> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_plugin
            .get(plugin)
            .into_iter()
            .flatten()
            .filter_map(|token| inner.providers.get(token))
            .cloned()
            .collect()
    }

    /// All currently registered providers.
    pub fn all_providers(&self) -> Vec<ServiceProvider> {
        self.inner.lock().unwrap().providers.values().cloned().collect()
    }

    /// Remove every provider owned by `plugin`. Returns the removal count.
    pub fn remove_plugin_services(&self, plugin: &str) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let tokens = inner.by_plugin.remove(plugin).unwrap_or_default();
        for token in &tokens {
            inner.providers.remove(token);
            inner.global_tokens.remove(token);
        }
        if !tokens.is_empty() {
            debug!(plugin, count = tokens.len(), "removed plugin services");
        }
        tokens.len()
    }

    /// Structural checks on a token, with remediation hints.
    pub fn validate_token(&self, token: &str) -> TokenValidation {
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if token.len() < MIN_TOKEN_LEN {
            issues.push(format!("token shorter than {MIN_TOKEN_LEN} characters"));
        }
        if token.len() > MAX_TOKEN_LEN {
            issues.push(format!("token longer than {MAX_TOKEN_LEN} characters"));
        }

        let security_level = if STANDARD_TOKEN_RE.is_match(token) {
            SecurityLevel::High
        } else if TIMESTAMP_TOKEN_RE.is_match(token) {
            recommendations
                .push("timestamp fallback tokens carry less entropy; re-register".to_string());
            SecurityLevel::Medium
        } else {
            issues.push("token does not follow <PLUGIN>_<SERVICE>_<8-hex> format".to_string());
            recommendations.push("let the host generate tokens instead of declaring them".to_string());
            SecurityLevel::Low
        };

        TokenValidation {
            valid: issues.is_empty(),
            security_level,
            issues,
            recommendations,
        }
    }

    pub fn statistics(&self) -> ServiceStatistics {
        let inner = self.inner.lock().unwrap();
        let total = inner.providers.len();
        let total_len: usize = inner.providers.keys().map(|t| t.len()).sum();
        let mut patterns: HashMap<String, usize> = HashMap::new();
        for token in inner.providers.keys() {
            let class = if STANDARD_TOKEN_RE.is_match(token) {
                "standard"
            } else if TIMESTAMP_TOKEN_RE.is_match(token) {
                "timestamp"
            } else {
                "custom"
            };
            *patterns.entry(class.to_string()).or_insert(0) += 1;
        }
        ServiceStatistics {
            total,
            global: inner.global_tokens.len(),
            by_plugin: inner
                .by_plugin
                .iter()
                .map(|(plugin, tokens)| (plugin.clone(), tokens.len()))
                .collect(),
            average_token_length: if total == 0 {
                0.0
            } else {
                total_len as f64 / total as f64
            },
            patterns,
        }
    }
}

impl std::fmt::Debug for CrossPluginServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CrossPluginServiceManager")
            .field("providers", &inner.providers.len())
            .field("global", &inner.global_tokens.len())
            .finish()
    }
}

fn upper_ident(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

fn generate_token(plugin: &str, service: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}_{}_{suffix:08x}", upper_ident(plugin), upper_ident(service))
}

fn fallback_token(plugin: &str, service: &str) -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "{}_{}_{}",
        plugin.to_lowercase(),
        service.to_lowercase(),
        base36(now_ms)
    )
}

fn base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;

    fn manifest_with_services(name: &str, services: &str) -> PluginManifest {
        parse_manifest(
            &format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "description": "d",
                    "author": "a",
                    "license": "MIT",
                    "module": {{"crossPluginServices": {services}}}
                }}"#
            ),
            name,
        )
        .unwrap()
    }

    fn symbols_with(name: &str) -> SymbolTable {
        SymbolTable::new().insert_callable(name, |v| v)
    }

    #[tokio::test]
    async fn registers_callable_services() {
        let manager = CrossPluginServiceManager::new(EventBus::with_defaults());
        let manifest = manifest_with_services(
            "auth",
            r#"[{"serviceName": "authApi", "global": true}]"#,
        );
        let providers =
            manager.create_providers("auth", &manifest, &symbols_with("authApi"));

        assert_eq!(providers.len(), 1);
        let token = &providers[0].token;
        assert!(token.starts_with("AUTH_AUTHAPI_"));
        assert!(manager.get_provider(token).is_some());
        assert!(manager.find_global("authApi").is_some());
    }

    #[tokio::test]
    async fn missing_symbol_is_skipped() {
        let manager = CrossPluginServiceManager::new(EventBus::with_defaults());
        let manifest =
            manifest_with_services("auth", r#"[{"serviceName": "ghostApi"}]"#);
        let providers = manager.create_providers("auth", &manifest, &SymbolTable::new());
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn collision_never_overwrites() {
        let manager = CrossPluginServiceManager::new(EventBus::with_defaults());
        let token = "SHARED_TOKEN_deadbeef".to_string();

        let manifest_a = manifest_with_services(
            "alpha",
            &format!(r#"[{{"serviceName": "api", "token": "{token}"}}]"#),
        );
        let manifest_b = manifest_with_services(
            "beta",
            &format!(r#"[{{"serviceName": "api", "token": "{token}"}}]"#),
        );

        let first = manager.create_providers("alpha", &manifest_a, &symbols_with("api"));
        let second = manager.create_providers("beta", &manifest_b, &symbols_with("api"));

        assert_eq!(first[0].token, token);
        assert_ne!(second[0].token, token);
        assert_eq!(manager.get_provider(&token).unwrap().plugin, "alpha");
        assert_eq!(manager.statistics().total, 2);
    }

    #[tokio::test]
    async fn collision_emits_warning_event() {
        let bus = EventBus::with_defaults();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            EventKind::SecurityWarning,
            crate::events::listener(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok(())
                }
            }),
        );

        let manager = CrossPluginServiceManager::new(Arc::clone(&bus));
        let token = "SHARED_TOKEN_deadbeef".to_string();
        let manifest_a = manifest_with_services(
            "alpha",
            &format!(r#"[{{"serviceName": "api", "token": "{token}"}}]"#),
        );
        let manifest_b = manifest_with_services(
            "beta",
            &format!(r#"[{{"serviceName": "api", "token": "{token}"}}]"#),
        );
        manager.create_providers("alpha", &manifest_a, &symbols_with("api"));
        manager.create_providers("beta", &manifest_b, &symbols_with("api"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["reason"], "service-token-collision");
        assert_eq!(event.payload["existingOwner"], "alpha");
    }

    #[tokio::test]
    async fn removal_drops_providers_and_global_tokens() {
        let manager = CrossPluginServiceManager::new(EventBus::with_defaults());
        let manifest = manifest_with_services(
            "auth",
            r#"[{"serviceName": "authApi", "global": true},
                {"serviceName": "sessions"}]"#,
        );
        let symbols = SymbolTable::new()
            .insert_callable("authApi", |v| v)
            .insert_callable("sessions", |v| v);
        manager.create_providers("auth", &manifest, &symbols);
        assert_eq!(manager.statistics().total, 2);

        let removed = manager.remove_plugin_services("auth");
        assert_eq!(removed, 2);
        assert_eq!(manager.statistics().total, 0);
        assert_eq!(manager.statistics().global, 0);
        assert!(manager.find_global("authApi").is_none());
    }

    #[tokio::test]
    async fn token_validation_levels() {
        let manager = CrossPluginServiceManager::new(EventBus::with_defaults());
        let standard = manager.validate_token("AUTH_AUTHAPI_1a2b3c4d");
        assert!(standard.valid);
        assert_eq!(standard.security_level, SecurityLevel::High);

        let timestamp = manager.validate_token("auth_authapi_lx2hq9");
        assert_eq!(timestamp.security_level, SecurityLevel::Medium);

        let junk = manager.validate_token("short");
        assert!(!junk.valid);
        assert_eq!(junk.security_level, SecurityLevel::Low);
        assert!(!junk.issues.is_empty());
    }

    #[test]
    fn base36_encodes() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }
}
