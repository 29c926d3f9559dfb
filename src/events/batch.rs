//! Batching of low-priority event kinds.
//!
//! A configured kind accumulates events until either `max_batch_size` is
//! reached or its flush interval elapses. A flush yields the pending events
//! sorted by static priority; the bus turns that into one synthetic
//! `<type>.batch` event plus the individual re-emits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::types::{EventKind, PluginEvent};

/// Per-kind batching configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

#[derive(Debug, Default)]
struct PendingQueue {
    events: Vec<PluginEvent>,
    since: Option<Instant>,
}

/// Collects events per kind until a flush is due.
#[derive(Debug)]
pub struct Batcher {
    configs: HashMap<EventKind, BatchConfig>,
    pending: Mutex<HashMap<EventKind, PendingQueue>>,
}

impl Batcher {
    pub fn new(configs: HashMap<EventKind, BatchConfig>) -> Self {
        Self {
            configs,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Default batching: progress, performance, and cache chatter.
    pub fn default_configs() -> HashMap<EventKind, BatchConfig> {
        let mut configs = HashMap::new();
        let config = BatchConfig {
            max_batch_size: 25,
            flush_interval: Duration::from_millis(250),
        };
        configs.insert(EventKind::LoadingProgress, config);
        configs.insert(EventKind::Performance, config);
        configs.insert(EventKind::Cache, config);
        configs
    }

    /// Shortest configured flush interval; drives the flusher task cadence.
    pub fn min_flush_interval(&self) -> Option<Duration> {
        self.configs.values().map(|c| c.flush_interval).min()
    }

    /// Whether this kind is subject to batching at all.
    pub fn is_batched(&self, kind: EventKind) -> bool {
        !kind.bypasses_batching() && self.configs.contains_key(&kind)
    }

    /// Queue an event. Returns the full batch when `max_batch_size` is hit.
    pub fn push(&self, event: PluginEvent) -> Option<Vec<PluginEvent>> {
        let config = self.configs.get(&event.kind).copied()?;
        let mut pending = self.pending.lock().unwrap();
        let queue = pending.entry(event.kind).or_default();
        if queue.events.is_empty() {
            queue.since = Some(Instant::now());
        }
        queue.events.push(event);
        if queue.events.len() >= config.max_batch_size {
            let mut batch = std::mem::take(&mut queue.events);
            queue.since = None;
            sort_by_priority(&mut batch);
            Some(batch)
        } else {
            None
        }
    }

    /// Drain queues whose oldest entry has waited out the kind's interval.
    pub fn flush_due(&self) -> Vec<(EventKind, Vec<PluginEvent>)> {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        let mut flushed = Vec::new();
        for (kind, queue) in pending.iter_mut() {
            let Some(config) = self.configs.get(kind) else {
                continue;
            };
            let due = queue
                .since
                .map(|since| now.saturating_duration_since(since) >= config.flush_interval)
                .unwrap_or(false);
            if !due || queue.events.is_empty() {
                continue;
            }
            let mut batch = std::mem::take(&mut queue.events);
            queue.since = None;
            sort_by_priority(&mut batch);
            flushed.push((*kind, batch));
        }
        flushed
    }

    /// Drain every non-empty queue regardless of age (shutdown path).
    pub fn flush_all(&self) -> Vec<(EventKind, Vec<PluginEvent>)> {
        let mut pending = self.pending.lock().unwrap();
        let mut flushed = Vec::new();
        for (kind, queue) in pending.iter_mut() {
            if queue.events.is_empty() {
                continue;
            }
            let mut batch = std::mem::take(&mut queue.events);
            queue.since = None;
            sort_by_priority(&mut batch);
            flushed.push((*kind, batch));
        }
        flushed
    }
}

fn sort_by_priority(batch: &mut [PluginEvent]) {
    batch.sort_by_key(|event| event.kind.priority());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batcher(max: usize, interval: Duration) -> Batcher {
        let mut configs = HashMap::new();
        configs.insert(
            EventKind::LoadingProgress,
            BatchConfig {
                max_batch_size: max,
                flush_interval: interval,
            },
        );
        Batcher::new(configs)
    }

    #[tokio::test]
    async fn flushes_when_full() {
        let batcher = batcher(3, Duration::from_millis(100));
        for _ in 0..2 {
            assert!(batcher
                .push(PluginEvent::new(EventKind::LoadingProgress, "a", "test"))
                .is_none());
        }
        let batch = batcher
            .push(PluginEvent::new(EventKind::LoadingProgress, "a", "test"))
            .expect("third push fills the batch");
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_due_respects_per_kind_interval() {
        let batcher = batcher(100, Duration::from_millis(500));
        batcher.push(PluginEvent::new(EventKind::LoadingProgress, "a", "test"));

        // not due yet
        assert!(batcher.flush_due().is_empty());

        tokio::time::advance(Duration::from_millis(600)).await;
        let flushed = batcher.flush_due();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.len(), 1);
        assert!(batcher.flush_due().is_empty());
    }

    #[tokio::test]
    async fn flush_all_drains_partial_batches() {
        let batcher = batcher(100, Duration::from_secs(3600));
        batcher.push(PluginEvent::new(EventKind::LoadingProgress, "a", "test"));
        let flushed = batcher.flush_all();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.len(), 1);
        assert!(batcher.flush_all().is_empty());
    }

    #[tokio::test]
    async fn unbatched_kinds_are_rejected() {
        let batcher = batcher(3, Duration::from_millis(100));
        assert!(!batcher.is_batched(EventKind::Loaded));
        assert!(!batcher.is_batched(EventKind::Error));
        assert!(batcher
            .push(PluginEvent::new(EventKind::Loaded, "a", "test"))
            .is_none());
    }
}
