//! Plugin discovery.
//!
//! Scans the immediate subdirectories of the plugins directory in parallel,
//! parses and validates each `plugin.manifest.json`, and records every valid
//! plugin as DISCOVERED. A directory that fails to parse or validate is
//! logged and skipped; the rest of the scan continues.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::PluginCache;
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, EventKind, PluginEvent};
use crate::manifest::{self, PluginManifest, ValidationLimits, MANIFEST_FILE};
use crate::state::PluginStateMachine;

/// Validated manifests stay cached for ten minutes.
const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(600);

/// A plugin found on disk, ready for the resolver.
#[derive(Debug, Clone)]
pub struct PluginDiscovery {
    pub name: String,
    pub path: PathBuf,
    pub manifest: PluginManifest,
    pub dependencies: Vec<String>,
    pub load_order: u32,
}

/// Scans a base directory for plugin packages.
#[derive(Debug)]
pub struct DiscoveryScanner {
    cache: Arc<PluginCache>,
    states: Arc<PluginStateMachine>,
    bus: Arc<EventBus>,
    max_file_size: u64,
    limits: ValidationLimits,
}

impl DiscoveryScanner {
    pub fn new(
        cache: Arc<PluginCache>,
        states: Arc<PluginStateMachine>,
        bus: Arc<EventBus>,
        max_file_size: u64,
        regex_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            states,
            bus,
            max_file_size,
            limits: ValidationLimits { regex_timeout },
        }
    }

    /// Scan `base_dir` and return every valid plugin, recorded as DISCOVERED.
    pub async fn scan(&self, base_dir: &Path) -> HostResult<Vec<PluginDiscovery>> {
        info!(dir = %base_dir.display(), "scanning for plugins");

        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                children.push(entry.path());
            }
        }

        let mut tasks = JoinSet::new();
        for dir in children {
            let cache = Arc::clone(&self.cache);
            let max_file_size = self.max_file_size;
            let limits = self.limits.clone();
            tasks.spawn(async move { read_manifest(&dir, &cache, max_file_size, &limits).await });
        }

        let mut discoveries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "discovery task panicked");
                    continue;
                }
            };
            match result {
                Ok((dir, manifest)) => {
                    if let Err(e) = self.states.record_discovered(&manifest.name) {
                        warn!(plugin = %manifest.name, error = %e, "skipping duplicate plugin");
                        continue;
                    }
                    self.bus.publish(
                        PluginEvent::new(EventKind::Discovered, &manifest.name, "discovery")
                            .with_payload(json!({
                                "path": dir.display().to_string(),
                                "version": manifest.version,
                            })),
                    );
                    discoveries.push(PluginDiscovery {
                        name: manifest.name.clone(),
                        dependencies: manifest.dependencies.clone(),
                        load_order: manifest.load_order,
                        path: dir,
                        manifest,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "skipping plugin directory");
                }
            }
        }

        discoveries.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = discoveries.len(), "discovery complete");
        Ok(discoveries)
    }

    /// Discover a single plugin directory (used by reload and installs).
    pub async fn discover_one(&self, dir: &Path) -> HostResult<PluginDiscovery> {
        let (dir, manifest) =
            read_manifest(dir, &self.cache, self.max_file_size, &self.limits).await?;
        self.states.record_discovered(&manifest.name)?;
        self.bus.publish(
            PluginEvent::new(EventKind::Discovered, &manifest.name, "discovery").with_payload(
                json!({
                    "path": dir.display().to_string(),
                    "version": manifest.version,
                }),
            ),
        );
        Ok(PluginDiscovery {
            name: manifest.name.clone(),
            dependencies: manifest.dependencies.clone(),
            load_order: manifest.load_order,
            path: dir,
            manifest,
        })
    }
}

async fn read_manifest(
    dir: &Path,
    cache: &PluginCache,
    max_file_size: u64,
    limits: &ValidationLimits,
) -> HostResult<(PathBuf, PluginManifest)> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let cache_key = format!("manifest:{}", manifest_path.display());

    if let Some(manifest) = cache.get_json::<PluginManifest>(&cache_key) {
        debug!(path = %manifest_path.display(), "manifest cache hit");
        return Ok((dir.to_path_buf(), manifest));
    }

    let metadata = tokio::fs::metadata(&manifest_path)
        .await
        .map_err(|_| HostError::ManifestMissing {
            path: manifest_path.display().to_string(),
        })?;
    if metadata.len() > max_file_size {
        return Err(HostError::ManifestInvalid {
            plugin: dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            reason: format!("manifest exceeds {max_file_size} bytes"),
        });
    }

    let content = tokio::fs::read_to_string(&manifest_path).await?;
    let hint = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let manifest = manifest::parse_manifest_limited(&content, &hint, limits)?;

    cache.set_json_ttl(&cache_key, &manifest, MANIFEST_CACHE_TTL);
    Ok((dir.to_path_buf(), manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::state::PluginState;
    use tempfile::TempDir;

    fn write_plugin(base: &Path, name: &str, extra: &str) {
        let dir = base.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "description": "test",
                    "author": "tester",
                    "license": "MIT"{extra}
                }}"#
            ),
        )
        .unwrap();
    }

    fn scanner() -> (DiscoveryScanner, Arc<PluginStateMachine>) {
        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        let cache = Arc::new(PluginCache::new(CacheSettings::default()));
        (
            DiscoveryScanner::new(
                cache,
                Arc::clone(&states),
                bus,
                1024 * 1024,
                Duration::from_millis(100),
            ),
            states,
        )
    }

    #[tokio::test]
    async fn discovers_valid_plugins() {
        let tmp = TempDir::new().unwrap();
        write_plugin(tmp.path(), "alpha", "");
        write_plugin(tmp.path(), "beta", r#", "dependencies": ["alpha"]"#);

        let (scanner, states) = scanner();
        let found = scanner.scan(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "alpha");
        assert_eq!(found[1].dependencies, vec!["alpha"]);
        assert_eq!(states.current_state("alpha"), Some(PluginState::Discovered));
    }

    #[tokio::test]
    async fn invalid_manifest_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        write_plugin(tmp.path(), "good", "");
        let bad = tmp.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILE), "{ not json").unwrap();

        let (scanner, _) = scanner();
        let found = scanner.scan(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "good");
    }

    #[tokio::test]
    async fn missing_manifest_is_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("empty-dir")).unwrap();
        write_plugin(tmp.path(), "real", "");

        let (scanner, _) = scanner();
        let found = scanner.scan(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn second_scan_hits_manifest_cache() {
        let tmp = TempDir::new().unwrap();
        write_plugin(tmp.path(), "cached", "");

        let bus = EventBus::with_defaults();
        let states = Arc::new(PluginStateMachine::new(Arc::clone(&bus)));
        let cache = Arc::new(PluginCache::new(CacheSettings::default()));
        let scanner = DiscoveryScanner::new(
            Arc::clone(&cache),
            states,
            bus,
            1024 * 1024,
            Duration::from_millis(100),
        );

        scanner.scan(tmp.path()).await.unwrap();
        let hits_before = cache.stats().hits;
        // delete the file; the cached manifest must still satisfy the scan
        std::fs::remove_file(tmp.path().join("cached").join(MANIFEST_FILE)).unwrap();
        let found = scanner.scan(tmp.path()).await.unwrap();
        assert_eq!(found.len(), 0); // duplicate discovery is rejected, but parse came from cache
        assert!(cache.stats().hits > hits_before);
    }
}
