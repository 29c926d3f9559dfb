//! The host event bus.
//!
//! Single-process publish/subscribe with a fixed set of event kinds.
//! Listener invocations are queued per listener and run one at a time, so
//! each listener observes events in publish order. A failing listener never
//! blocks the others: its error is retried with exponential backoff, then
//! logged and republished as `plugin.error`.
//!
//! Two QoS layers sit in front of dispatch: a token-bucket rate limiter and
//! a priority-aware batcher for chatty low-priority kinds.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::batch::{BatchConfig, Batcher};
use super::rate_limit::{RateDecision, RateLimitConfig, RateLimiter};
use super::types::{EventKind, PluginEvent};
use super::validation::{EventValidator, ValidationCounters};
use crate::error::{HostError, HostResult};

/// Boxed future returned by a listener.
pub type ListenerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A subscribed callback. Return `Err` to trigger the retry path.
pub type Listener = Arc<dyn Fn(PluginEvent) -> ListenerFuture + Send + Sync>;

/// Wrap an async closure into a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(PluginEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Handle returned by [`EventBus::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    pub(crate) kind: EventKind,
    pub(crate) id: u64,
}

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Dispatched to this many listeners.
    Delivered(usize),
    /// Accepted into a batch; will be dispatched on flush.
    Batched,
    DroppedRateLimited,
    DroppedInvalid,
}

/// Bus construction parameters.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    pub rate_limits: HashMap<EventKind, RateLimitConfig>,
    pub batching: HashMap<EventKind, BatchConfig>,
    /// Drops past this count fire a `backpressure.activated` notice.
    pub backpressure_threshold: u64,
    /// Delivery attempts per listener per event.
    pub max_delivery_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimiter::default_configs(),
            batching: Batcher::default_configs(),
            backpressure_threshold: 50,
            max_delivery_attempts: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(10),
        }
    }
}

/// Counters surfaced via `/plugins/stats` and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub batched: u64,
    pub batches_flushed: u64,
    pub dropped_rate_limited: u64,
    pub dropped_invalid: u64,
    pub listener_failures: u64,
}

/// Full statistics snapshot.
#[derive(Debug, Clone)]
pub struct BusStatsSnapshot {
    pub bus: BusStats,
    pub validation: ValidationCounters,
    pub drops_by_kind: HashMap<EventKind, u64>,
}

struct ListenerEntry {
    id: u64,
    tx: mpsc::UnboundedSender<PluginEvent>,
    worker: JoinHandle<()>,
}

/// The event bus. Construct with [`EventBus::new`]; always lives in an `Arc`.
pub struct EventBus {
    config: EventBusConfig,
    listeners: Mutex<HashMap<EventKind, Vec<ListenerEntry>>>,
    limiter: RateLimiter,
    batcher: Arc<Batcher>,
    validator: EventValidator,
    stats: Mutex<BusStats>,
    next_listener_id: AtomicU64,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let limiter = RateLimiter::new(config.rate_limits.clone(), config.backpressure_threshold);
        let batcher = Arc::new(Batcher::new(config.batching.clone()));
        let bus = Arc::new(Self {
            limiter,
            batcher: Arc::clone(&batcher),
            validator: EventValidator::new(),
            stats: Mutex::new(BusStats::default()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            flusher: Mutex::new(None),
            config,
        });
        let interval = batcher
            .min_flush_interval()
            .unwrap_or(Duration::from_millis(250));
        let weak = Arc::downgrade(&bus);
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(bus) = weak.upgrade() else { break };
                for (kind, batch) in bus.batcher.flush_due() {
                    bus.dispatch_batch(kind, batch);
                }
            }
        });
        *bus.flusher.lock().unwrap() = Some(flusher);
        bus
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(EventBusConfig::default())
    }

    /// Subscribe a listener to one event kind.
    ///
    /// The listener runs on its own queue task: events are delivered in
    /// publish order, one at a time.
    pub fn subscribe(self: &Arc<Self>, kind: EventKind, listener: Listener) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<PluginEvent>();
        let weak = Arc::downgrade(self);
        let max_attempts = self.config.max_delivery_attempts.max(1);
        let retry_base = self.config.retry_base;
        let retry_cap = self.config.retry_cap;

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut attempt = 0u32;
                loop {
                    match (listener)(event.clone()).await {
                        Ok(()) => break,
                        Err(reason) => {
                            attempt += 1;
                            if attempt >= max_attempts {
                                warn!(
                                    listener = id,
                                    event = %event.kind,
                                    %reason,
                                    "listener failed after {attempt} attempts"
                                );
                                if let Some(bus) = weak.upgrade() {
                                    bus.stats.lock().unwrap().listener_failures += 1;
                                    if event.kind != EventKind::Error {
                                        bus.publish(
                                            PluginEvent::new(
                                                EventKind::Error,
                                                event.plugin_name.clone(),
                                                "event-bus",
                                            )
                                            .with_payload(json!({
                                                "message": reason,
                                                "listener": id,
                                                "failedEventType": event.kind.as_str(),
                                            })),
                                        );
                                    }
                                }
                                break;
                            }
                            let backoff = retry_base
                                .checked_mul(1u32 << (attempt - 1))
                                .unwrap_or(retry_cap)
                                .min(retry_cap);
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        });

        self.listeners
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(ListenerEntry { id, tx, worker });
        ListenerHandle { kind, id }
    }

    /// Remove one listener. Its queue drains and the worker exits.
    pub fn unsubscribe(&self, handle: &ListenerHandle) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(entries) = listeners.get_mut(&handle.kind) {
            entries.retain(|entry| entry.id != handle.id);
        }
    }

    /// Remove every listener for a kind, cancelling further deliveries.
    pub fn remove_listeners(&self, kind: EventKind) {
        let removed = self.listeners.lock().unwrap().remove(&kind);
        if let Some(entries) = removed {
            for entry in entries {
                entry.worker.abort();
            }
            debug!(kind = %kind, "removed all listeners");
        }
    }

    /// Publish an event, absorbing QoS rejections into the outcome.
    pub fn publish(&self, event: PluginEvent) -> PublishOutcome {
        let kind = event.kind;
        match self.try_publish(event) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(event = %kind, error = %err, "publish rejected");
                PublishOutcome::DroppedRateLimited
            }
        }
    }

    /// Publish an event through validation, rate limiting, and batching.
    ///
    /// A drop that crosses the backpressure threshold fires the
    /// `backpressure.activated` notice and surfaces as
    /// [`HostError::BackpressureActive`]; an ordinary rate-limit drop is an
    /// `Ok` outcome.
    pub fn try_publish(&self, event: PluginEvent) -> HostResult<PublishOutcome> {
        if !event.replayed {
            if let Err(reason) = self.validator.validate(&event) {
                debug!(event = %event.kind, %reason, "dropping invalid event");
                self.stats.lock().unwrap().dropped_invalid += 1;
                return Ok(PublishOutcome::DroppedInvalid);
            }

            match self.limiter.check(event.kind) {
                RateDecision::Allowed => {}
                RateDecision::Dropped { backpressure } => {
                    self.stats.lock().unwrap().dropped_rate_limited += 1;
                    if backpressure {
                        let notice =
                            PluginEvent::new(EventKind::Backpressure, "", "event-bus")
                                .with_payload(json!({
                                    "eventType": event.kind.as_str(),
                                    "cooldownMs": 5000,
                                }))
                                .replay();
                        self.dispatch(notice);
                        return Err(HostError::BackpressureActive {
                            event_type: event.kind.as_str().to_string(),
                        });
                    }
                    return Ok(PublishOutcome::DroppedRateLimited);
                }
            }

            if self.batcher.is_batched(event.kind) {
                let kind = event.kind;
                if let Some(batch) = self.batcher.push(event) {
                    self.dispatch_batch(kind, batch);
                } else {
                    self.stats.lock().unwrap().batched += 1;
                }
                return Ok(PublishOutcome::Batched);
            }
        }

        Ok(PublishOutcome::Delivered(self.dispatch(event)))
    }

    /// Drain all pending batches now. Exposed for shutdown and tests.
    pub fn flush_batches(&self) {
        for (kind, batch) in self.batcher.flush_all() {
            self.dispatch_batch(kind, batch);
        }
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            bus: *self.stats.lock().unwrap(),
            validation: self.validator.counters(),
            drops_by_kind: self.limiter.drop_counts(),
        }
    }

    fn dispatch_batch(&self, kind: EventKind, batch: Vec<PluginEvent>) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.batches_flushed += 1;
        }
        let synthetic = PluginEvent::new(kind, "", "event-bus")
            .with_payload(json!({
                "type": format!("{}.batch", kind.as_str()),
                "count": batch.len(),
                "events": serde_json::to_value(&batch).unwrap_or_default(),
            }))
            .replay();
        self.dispatch(synthetic);
        for event in batch {
            self.dispatch(event.replay());
        }
    }

    fn dispatch(&self, event: PluginEvent) -> usize {
        let listeners = self.listeners.lock().unwrap();
        let mut delivered = 0;
        if let Some(entries) = listeners.get(&event.kind) {
            for entry in entries {
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        drop(listeners);
        let mut stats = self.stats.lock().unwrap();
        stats.published += 1;
        stats.delivered += delivered as u64;
        delivered
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.lock().unwrap().take() {
            flusher.abort();
        }
        for entries in self.listeners.lock().unwrap().values() {
            for entry in entries {
                entry.worker.abort();
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("stats", &*self.stats.lock().unwrap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc as tokio_mpsc;

    fn recording_listener() -> (Listener, tokio_mpsc::UnboundedReceiver<PluginEvent>) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let listener = listener(move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event).map_err(|e| e.to_string())?;
                Ok(())
            }
        });
        (listener, rx)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::with_defaults();
        let (listener, mut rx) = recording_listener();
        bus.subscribe(EventKind::Loaded, listener);

        for name in ["a", "b", "c"] {
            bus.publish(PluginEvent::new(EventKind::Loaded, name, "test"));
        }

        for expected in ["a", "b", "c"] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.plugin_name, expected);
        }
    }

    #[tokio::test]
    async fn listener_error_republishes_plugin_error() {
        let mut config = EventBusConfig::default();
        config.max_delivery_attempts = 1;
        let bus = EventBus::new(config);

        let (error_listener, mut errors) = recording_listener();
        bus.subscribe(EventKind::Error, error_listener);
        bus.subscribe(
            EventKind::Loaded,
            listener(|_| async { Err("boom".to_string()) }),
        );

        bus.publish(PluginEvent::new(EventKind::Loaded, "a", "test"));

        let error = errors.recv().await.unwrap();
        assert_eq!(error.kind, EventKind::Error);
        assert_eq!(error.payload["message"], "boom");
    }

    #[tokio::test]
    async fn invalid_event_is_dropped() {
        let bus = EventBus::with_defaults();
        let (listener, mut rx) = recording_listener();
        bus.subscribe(EventKind::StateChanged, listener);

        let outcome = bus.publish(PluginEvent::new(EventKind::StateChanged, "a", "test"));
        assert_eq!(outcome, PublishOutcome::DroppedInvalid);
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.stats().bus.dropped_invalid, 1);
    }

    #[tokio::test]
    async fn batched_kind_flushes_synthetic_then_individuals() {
        let mut config = EventBusConfig::default();
        config.batching.insert(
            EventKind::LoadingProgress,
            BatchConfig {
                max_batch_size: 2,
                flush_interval: Duration::from_secs(3600),
            },
        );
        let bus = EventBus::new(config);
        let (listener, mut rx) = recording_listener();
        bus.subscribe(EventKind::LoadingProgress, listener);

        assert_eq!(
            bus.publish(PluginEvent::new(EventKind::LoadingProgress, "a", "test")),
            PublishOutcome::Batched
        );
        bus.publish(PluginEvent::new(EventKind::LoadingProgress, "b", "test"));

        let synthetic = rx.recv().await.unwrap();
        assert_eq!(synthetic.payload["type"], "plugin.loading.progress.batch");
        assert_eq!(synthetic.payload["count"], 2);
        assert_eq!(rx.recv().await.unwrap().plugin_name, "a");
        assert_eq!(rx.recv().await.unwrap().plugin_name, "b");
    }

    #[tokio::test]
    async fn remove_listeners_cancels_delivery() {
        let bus = EventBus::with_defaults();
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        bus.subscribe(
            EventKind::Loaded,
            listener(|_| async {
                SEEN.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.remove_listeners(EventKind::Loaded);
        let outcome = bus.publish(PluginEvent::new(EventKind::Loaded, "a", "test"));
        assert_eq!(outcome, PublishOutcome::Delivered(0));
    }

    #[tokio::test]
    async fn backpressure_surfaces_as_error() {
        let mut config = EventBusConfig::default();
        config.backpressure_threshold = 2;
        config.rate_limits.insert(
            EventKind::SecurityViolation,
            RateLimitConfig {
                rate: 0.0001,
                burst: 1.0,
            },
        );
        config.batching.clear();
        let bus = EventBus::new(config);
        let event = || {
            PluginEvent::new(EventKind::SecurityViolation, "a", "test")
                .with_payload(json!({"severity": "high"}))
        };

        // the burst token, then two quiet drops
        assert!(bus.try_publish(event()).is_ok());
        assert!(bus.try_publish(event()).is_ok());
        assert!(bus.try_publish(event()).is_ok());
        // the third drop crosses the threshold
        let err = bus.try_publish(event()).unwrap_err();
        assert!(matches!(err, HostError::BackpressureActive { .. }));
        // plain publish keeps absorbing the rejection into an outcome
        assert_eq!(bus.publish(event()), PublishOutcome::DroppedRateLimited);
    }

    #[tokio::test]
    async fn rate_limited_kind_reports_drop() {
        let mut config = EventBusConfig::default();
        config.rate_limits.insert(
            EventKind::SecurityViolation,
            RateLimitConfig {
                rate: 0.0001,
                burst: 1.0,
            },
        );
        config.batching.clear();
        let bus = EventBus::new(config);

        let allowed = bus.publish(
            PluginEvent::new(EventKind::SecurityViolation, "a", "test")
                .with_payload(json!({"severity": "high"})),
        );
        assert!(matches!(allowed, PublishOutcome::Delivered(_)));
        let dropped = bus.publish(
            PluginEvent::new(EventKind::SecurityViolation, "a", "test")
                .with_payload(json!({"severity": "high"})),
        );
        assert_eq!(dropped, PublishOutcome::DroppedRateLimited);
        assert_eq!(bus.stats().bus.dropped_rate_limited, 1);
    }
}
