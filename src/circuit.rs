//! Per-plugin circuit breaker.
//!
//! Every plugin gets its own failure counter. After `max_failures`
//! consecutive failures the circuit opens and `execute` fails immediately
//! with [`HostError::CircuitOpen`] until `reset_timeout` elapses; the first
//! call after the cooldown runs in half-open mode, where one success closes
//! the circuit and one failure reopens it. Wrapped operations are also
//! bounded by `operation_timeout`; a timeout counts as a failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{HostError, HostResult};
use crate::events::{EventBus, EventKind, PluginEvent};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Breaker tuning; the defaults match the loader's expectations.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub operation_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(5),
            half_open_max_calls: 3,
        }
    }
}

/// Time source seam so tests can drive the cooldown deterministically.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Point-in-time counters for one plugin's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at_ms: Option<u64>,
    pub last_failure_ms: Option<u64>,
    pub total_calls: u64,
    pub half_open_calls: u32,
}

#[derive(Debug)]
struct PluginCircuit {
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    open_until_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    total_calls: AtomicU64,
    half_open_calls: AtomicU32,
    half_open_permits: Arc<Semaphore>,
}

impl PluginCircuit {
    fn new(config: &CircuitConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            total_calls: AtomicU64::new(0),
            half_open_calls: AtomicU32::new(0),
            half_open_permits: Arc::new(Semaphore::new(config.half_open_max_calls as usize)),
        }
    }

    fn state(&self) -> CircuitState {
        self.state.load(Relaxed).into()
    }

    fn refill_permits(&self, config: &CircuitConfig) {
        let target = config.half_open_max_calls as usize;
        let available = self.half_open_permits.available_permits();
        if available < target {
            self.half_open_permits.add_permits(target - available);
        }
    }
}

/// Admission token for a manually tracked operation. Dropping it releases
/// any half-open permit it holds.
#[derive(Debug)]
pub struct CircuitAdmission {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

/// Registry of per-plugin breakers.
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, Arc<PluginCircuit>>>,
    bus: Arc<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig, bus: Arc<EventBus>) -> Self {
        Self::with_clock(config, bus, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitConfig, bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn circuit(&self, plugin: &str) -> Arc<PluginCircuit> {
        let mut circuits = self.circuits.lock().unwrap();
        Arc::clone(
            circuits
                .entry(plugin.to_string())
                .or_insert_with(|| Arc::new(PluginCircuit::new(&self.config))),
        )
    }

    /// Current state for a plugin; `Closed` if the plugin has no history.
    pub fn state(&self, plugin: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap();
        circuits
            .get(plugin)
            .map(|c| c.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Run `operation` under the plugin's breaker and operation timeout.
    pub async fn execute<T, F, Fut>(&self, plugin: &str, operation: F) -> HostResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HostResult<T>>,
    {
        let circuit = self.circuit(plugin);
        circuit.total_calls.fetch_add(1, Relaxed);

        let permit = match self.acquire(plugin, &circuit) {
            Ok(permit) => permit,
            Err(err) => return Err(err),
        };
        if permit.is_some() {
            circuit.half_open_calls.fetch_add(1, Relaxed);
        }

        let result = tokio::time::timeout(self.config.operation_timeout, operation()).await;
        let outcome = match result {
            Ok(Ok(value)) => {
                self.on_success(plugin, &circuit);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure(plugin, &circuit);
                Err(err)
            }
            Err(_) => {
                self.on_failure(plugin, &circuit);
                Err(HostError::OperationTimeout {
                    operation: format!("circuit:{plugin}"),
                    timeout_ms: self.config.operation_timeout.as_millis() as u64,
                })
            }
        };
        drop(permit);
        outcome
    }

    /// Admission check for a manually tracked operation such as a plugin
    /// load, where the caller reports the outcome later via
    /// [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure). Holds a half-open permit
    /// for the admission's lifetime.
    pub fn admit(&self, plugin: &str) -> HostResult<CircuitAdmission> {
        let circuit = self.circuit(plugin);
        circuit.total_calls.fetch_add(1, Relaxed);
        let permit = self.acquire(plugin, &circuit)?;
        if permit.is_some() {
            circuit.half_open_calls.fetch_add(1, Relaxed);
        }
        Ok(CircuitAdmission { _permit: permit })
    }

    /// Report success for a manually tracked operation.
    pub fn record_success(&self, plugin: &str) {
        let circuit = self.circuit(plugin);
        self.on_success(plugin, &circuit);
    }

    /// Report failure for a manually tracked operation.
    pub fn record_failure(&self, plugin: &str) {
        let circuit = self.circuit(plugin);
        self.on_failure(plugin, &circuit);
    }

    /// Clear one plugin's counters and timers.
    pub fn reset_plugin(&self, plugin: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        if circuits.remove(plugin).is_some() {
            debug!(plugin, "circuit breaker reset");
        }
    }

    /// Clear every breaker.
    pub fn reset_all(&self) {
        self.circuits.lock().unwrap().clear();
    }

    /// Per-plugin stats snapshot.
    pub fn stats(&self, plugin: &str) -> Option<CircuitStats> {
        let circuits = self.circuits.lock().unwrap();
        circuits.get(plugin).map(|circuit| CircuitStats {
            state: circuit.state(),
            failure_count: circuit.failures.load(Relaxed),
            success_count: circuit.successes.load(Relaxed),
            opened_at_ms: match circuit.opened_at_ms.load(Relaxed) {
                0 => None,
                at => Some(at),
            },
            last_failure_ms: match circuit.last_failure_ms.load(Relaxed) {
                0 => None,
                at => Some(at),
            },
            total_calls: circuit.total_calls.load(Relaxed),
            half_open_calls: circuit.half_open_calls.load(Relaxed),
        })
    }

    /// Stats for every plugin with a breaker.
    pub fn all_stats(&self) -> HashMap<String, CircuitStats> {
        let names: Vec<String> = self.circuits.lock().unwrap().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.stats(&name).map(|stats| (name, stats)))
            .collect()
    }

    fn acquire(
        &self,
        plugin: &str,
        circuit: &PluginCircuit,
    ) -> HostResult<Option<tokio::sync::OwnedSemaphorePermit>> {
        match circuit.state() {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let now = self.clock.now_ms();
                if now >= circuit.open_until_ms.load(Relaxed) {
                    circuit.state.store(CircuitState::HalfOpen as u8, Relaxed);
                    self.emit(plugin, CircuitState::HalfOpen);
                    self.acquire(plugin, circuit)
                } else {
                    Err(HostError::CircuitOpen {
                        plugin: plugin.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                match Arc::clone(&circuit.half_open_permits).try_acquire_owned() {
                    Ok(permit) => Ok(Some(permit)),
                    Err(_) => Err(HostError::CircuitOpen {
                        plugin: plugin.to_string(),
                    }),
                }
            }
        }
    }

    fn on_success(&self, plugin: &str, circuit: &PluginCircuit) {
        circuit.successes.fetch_add(1, Relaxed);
        match circuit.state() {
            CircuitState::Closed => {
                circuit.failures.store(0, Relaxed);
            }
            CircuitState::HalfOpen => {
                // One trial success closes the circuit and fully resets it.
                circuit.state.store(CircuitState::Closed as u8, Relaxed);
                circuit.failures.store(0, Relaxed);
                circuit.opened_at_ms.store(0, Relaxed);
                circuit.refill_permits(&self.config);
                self.emit(plugin, CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, plugin: &str, circuit: &PluginCircuit) {
        circuit.last_failure_ms.store(self.clock.now_ms(), Relaxed);
        match circuit.state() {
            CircuitState::Closed => {
                let failures = circuit.failures.fetch_add(1, Relaxed) + 1;
                if failures >= self.config.max_failures {
                    self.trip_open(plugin, circuit);
                }
            }
            CircuitState::HalfOpen => self.trip_open(plugin, circuit),
            CircuitState::Open => {}
        }
    }

    fn trip_open(&self, plugin: &str, circuit: &PluginCircuit) {
        let now = self.clock.now_ms();
        circuit.state.store(CircuitState::Open as u8, Relaxed);
        circuit.opened_at_ms.store(now, Relaxed);
        circuit
            .open_until_ms
            .store(now + self.config.reset_timeout.as_millis() as u64, Relaxed);
        circuit.refill_permits(&self.config);
        warn!(plugin, "circuit opened");
        self.emit(plugin, CircuitState::Open);
    }

    fn emit(&self, plugin: &str, state: CircuitState) {
        self.bus.publish(
            PluginEvent::new(EventKind::CircuitBreaker, plugin, "circuit-breaker")
                .with_payload(json!({ "state": state })),
        );
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .finish()
    }
}
