//! TTL + LRU cache for manifests, validation results, and metadata.
//!
//! The key space is partitioned by prefix (`manifest:`, `validation:`,
//! `dependencies:`, `metadata:`). Expiry is lazy on read plus a periodic
//! sweeper; capacity is bounded by an entry count (LRU eviction) and an
//! estimated memory ceiling (oldest 10% by age evicted).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::CacheSettings;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
    created_at_ms: u64,
    last_access: u64,
}

/// Cache counters and size accounting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub estimated_memory_bytes: u64,
    pub evictions: u64,
    pub expired_removed: u64,
    pub oldest_entry_ms: Option<u64>,
    pub newest_entry_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expired_removed: u64,
}

/// In-process TTL + LRU cache.
#[derive(Debug)]
pub struct PluginCache {
    settings: CacheSettings,
    entries: Mutex<HashMap<String, CacheEntry>>,
    counters: Mutex<Counters>,
    access_clock: AtomicU64,
}

impl PluginCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            access_clock: AtomicU64::new(0),
        }
    }

    /// Store raw bytes under `key` with an explicit TTL.
    pub fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = now_ms();
        let entry = CacheEntry {
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            created_at_ms: now,
            last_access: self.access_clock.fetch_add(1, Ordering::Relaxed),
            value,
        };

        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(key) && entries.len() >= self.settings.max_size {
            self.evict_lru(&mut entries);
        }
        entries.insert(key.to_string(), entry);

        let memory: u64 = entries
            .values()
            .map(|e| e.value.len() as u64)
            .sum::<u64>();
        if memory > self.settings.memory_limit {
            self.evict_oldest_tenth(&mut entries);
        }
    }

    /// Serialize `value` as JSON and store it with the default TTL.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        self.set_json_ttl(key, value, Duration::from_millis(self.settings.default_ttl_ms));
    }

    pub fn set_json_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(bytes) = serde_json::to_vec(value) {
            self.set_bytes(key, bytes, ttl);
        }
    }

    /// Fetch raw bytes. Expired entries are removed and count as misses.
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let now = now_ms();
        let mut entries = self.entries.lock().unwrap();
        let mut counters = self.counters.lock().unwrap();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at_ms > now => {
                entry.last_access = self.access_clock.fetch_add(1, Ordering::Relaxed);
                counters.hits += 1;
                trace!(key, "cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                counters.misses += 1;
                counters.expired_removed += 1;
                trace!(key, "cache entry expired");
                None
            }
            None => {
                counters.misses += 1;
                None
            }
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key)?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    /// Remove every key matching `pattern`. Returns the removal count.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<String> = entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        if !doomed.is_empty() {
            debug!(pattern = %pattern, removed = doomed.len(), "cache pattern invalidation");
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Remove entries past their expiry. Called by the sweeper task.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at_ms > now);
        let removed = before - entries.len();
        if removed > 0 {
            self.counters.lock().unwrap().expired_removed += removed as u64;
            debug!(removed, "cache sweeper removed expired entries");
        }
        removed
    }

    /// Spawn the periodic sweeper. The task exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.settings.cleanup_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                cache.sweep_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap();
        let counters = self.counters.lock().unwrap();
        CacheStats {
            size: entries.len(),
            hits: counters.hits,
            misses: counters.misses,
            total_requests: counters.hits + counters.misses,
            estimated_memory_bytes: entries.values().map(|e| e.value.len() as u64).sum(),
            evictions: counters.evictions,
            expired_removed: counters.expired_removed,
            oldest_entry_ms: entries.values().map(|e| e.created_at_ms).min(),
            newest_entry_ms: entries.values().map(|e| e.created_at_ms).max(),
        }
    }

    fn evict_lru(&self, entries: &mut HashMap<String, CacheEntry>) {
        if let Some(key) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone())
        {
            entries.remove(&key);
            self.counters.lock().unwrap().evictions += 1;
            debug!(key, "cache evicted least-recently-used entry");
        }
    }

    fn evict_oldest_tenth(&self, entries: &mut HashMap<String, CacheEntry>) {
        let count = (entries.len() / 10).max(1);
        let mut by_age: Vec<(String, u64)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.created_at_ms))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);
        for (key, _) in by_age.into_iter().take(count) {
            entries.remove(&key);
            self.counters.lock().unwrap().evictions += 1;
        }
    }
}

/// Builders for the partitioned key space.
pub mod keys {
    /// `manifest:<name>` or `manifest:<name>:<version>`.
    pub fn manifest(name: &str, version: Option<&str>) -> String {
        match version {
            Some(version) => format!("manifest:{name}:{version}"),
            None => format!("manifest:{name}"),
        }
    }

    /// `validation:<checksum>:<kind>`.
    pub fn validation(checksum: &str, kind: &str) -> String {
        format!("validation:{checksum}:{kind}")
    }

    /// `dependencies:<name>`.
    pub fn dependencies(name: &str) -> String {
        format!("dependencies:{name}")
    }

    /// `metadata:<name>` or `metadata:<name>:<version>`.
    pub fn metadata(name: &str, version: Option<&str>) -> String {
        match version {
            Some(version) => format!("metadata:{name}:{version}"),
            None => format!("metadata:{name}"),
        }
    }

    /// Matches every key belonging to one plugin, across all prefixes.
    pub fn plugin_pattern(name: &str) -> regex::Regex {
        regex::Regex::new(&format!("^[^:]+:{}(?::|$)", regex::escape(name)))
            .expect("plugin pattern is valid")
    }

    /// Matches every key of one type prefix.
    pub fn type_pattern(prefix: &str) -> regex::Regex {
        regex::Regex::new(&format!("^{}:", regex::escape(prefix)))
            .expect("type pattern is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_size: usize, memory_limit: u64) -> CacheSettings {
        CacheSettings {
            max_size,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 60_000,
            memory_limit,
        }
    }

    #[test]
    fn get_after_set_within_ttl() {
        let cache = PluginCache::new(settings(10, u64::MAX));
        cache.set_json_ttl("manifest:a", &"value", Duration::from_secs(60));
        assert_eq!(cache.get_json::<String>("manifest:a").unwrap(), "value");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = PluginCache::new(settings(10, u64::MAX));
        cache.set_json_ttl("manifest:a", &"value", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_json::<String>("manifest:a").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn get_after_invalidate_misses() {
        let cache = PluginCache::new(settings(10, u64::MAX));
        cache.set_json("manifest:a", &1u32);
        assert!(cache.invalidate("manifest:a"));
        assert!(cache.get_json::<u32>("manifest:a").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = PluginCache::new(settings(2, u64::MAX));
        cache.set_json("metadata:a", &1u32);
        cache.set_json("metadata:b", &2u32);
        // touch `a` so `b` becomes least recently used
        assert!(cache.get_json::<u32>("metadata:a").is_some());
        cache.set_json("metadata:c", &3u32);

        assert!(cache.get_json::<u32>("metadata:a").is_some());
        assert!(cache.get_json::<u32>("metadata:b").is_none());
        assert!(cache.get_json::<u32>("metadata:c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn memory_pressure_evicts_oldest() {
        let cache = PluginCache::new(settings(100, 64));
        cache.set_bytes("metadata:old", vec![0u8; 40], Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.set_bytes("metadata:new", vec![0u8; 40], Duration::from_secs(60));
        assert!(cache.get_bytes("metadata:old").is_none());
        assert!(cache.get_bytes("metadata:new").is_some());
    }

    #[test]
    fn pattern_invalidation_by_plugin() {
        let cache = PluginCache::new(settings(10, u64::MAX));
        cache.set_json("manifest:auth", &1u32);
        cache.set_json("dependencies:auth", &2u32);
        cache.set_json("manifest:auth-extra", &3u32);

        let removed = cache.invalidate_pattern(&keys::plugin_pattern("auth"));
        assert_eq!(removed, 2);
        assert!(cache.get_json::<u32>("manifest:auth-extra").is_some());
    }

    #[test]
    fn sweeper_removes_expired() {
        let cache = PluginCache::new(settings(10, u64::MAX));
        cache.set_json_ttl("manifest:a", &1u32, Duration::from_millis(0));
        cache.set_json_ttl("manifest:b", &2u32, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn key_builders() {
        assert_eq!(keys::manifest("auth", None), "manifest:auth");
        assert_eq!(keys::manifest("auth", Some("1.2.3")), "manifest:auth:1.2.3");
        assert_eq!(keys::validation("abc123", "checksum"), "validation:abc123:checksum");
        assert!(keys::type_pattern("manifest").is_match("manifest:anything"));
        assert!(!keys::type_pattern("manifest").is_match("metadata:anything"));
    }
}
