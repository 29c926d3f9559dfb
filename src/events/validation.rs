//! Event schema validation.
//!
//! Every published event is checked against a per-kind schema: required
//! payload fields plus enum domains where a field has one. Identical payload
//! shapes skip re-validation through a lazy shape cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use super::types::{EventKind, PluginEvent};

const PLUGIN_STATES: &[&str] = &["discovered", "loading", "loaded", "failed", "unloaded"];
const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];

/// Required fields and enum domains for one event kind.
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    /// Payload fields that must be present.
    pub required: &'static [&'static str],
    /// Fields whose string value must come from a fixed domain.
    pub domains: &'static [(&'static str, &'static [&'static str])],
}

/// Validator with a shape-keyed cache of already-accepted structures.
#[derive(Debug)]
pub struct EventValidator {
    schemas: HashMap<EventKind, EventSchema>,
    shape_cache: Mutex<HashSet<u64>>,
    counters: Mutex<ValidationCounters>,
}

/// Validation counters, surfaced through bus statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationCounters {
    pub checked: u64,
    pub failed: u64,
    pub cache_hits: u64,
}

impl EventValidator {
    pub fn new() -> Self {
        let mut schemas = HashMap::new();
        schemas.insert(
            EventKind::StateChanged,
            EventSchema {
                required: &["fromState", "toState"],
                domains: &[("fromState", PLUGIN_STATES), ("toState", PLUGIN_STATES)],
            },
        );
        schemas.insert(
            EventKind::LoadFailed,
            EventSchema {
                required: &["reason"],
                domains: &[],
            },
        );
        schemas.insert(
            EventKind::DependencyFailed,
            EventSchema {
                required: &["reason"],
                domains: &[],
            },
        );
        schemas.insert(
            EventKind::SecurityViolation,
            EventSchema {
                required: &["severity"],
                domains: &[("severity", SEVERITIES)],
            },
        );
        schemas.insert(
            EventKind::Error,
            EventSchema {
                required: &["message"],
                domains: &[],
            },
        );
        Self {
            schemas,
            shape_cache: Mutex::new(HashSet::new()),
            counters: Mutex::new(ValidationCounters::default()),
        }
    }

    /// Validate one event. Events of kinds without a schema always pass.
    pub fn validate(&self, event: &PluginEvent) -> Result<(), String> {
        {
            let mut counters = self.counters.lock().unwrap();
            counters.checked += 1;
        }

        let Some(schema) = self.schemas.get(&event.kind) else {
            return Ok(());
        };

        let shape = shape_key(event);
        if self.shape_cache.lock().unwrap().contains(&shape) {
            self.counters.lock().unwrap().cache_hits += 1;
            // Shapes only cache structure; enum domains are value checks.
            return self.check_domains(event, schema);
        }

        let object = match event.payload.as_object() {
            Some(object) => object,
            None if schema.required.is_empty() => {
                self.shape_cache.lock().unwrap().insert(shape);
                return Ok(());
            }
            None => {
                self.counters.lock().unwrap().failed += 1;
                return Err(format!("{} payload must be an object", event.kind));
            }
        };

        for field in schema.required {
            if !object.contains_key(*field) {
                self.counters.lock().unwrap().failed += 1;
                return Err(format!("{} payload missing field '{field}'", event.kind));
            }
        }

        self.check_domains(event, schema)?;
        self.shape_cache.lock().unwrap().insert(shape);
        Ok(())
    }

    fn check_domains(&self, event: &PluginEvent, schema: &EventSchema) -> Result<(), String> {
        let Some(object) = event.payload.as_object() else {
            return Ok(());
        };
        for (field, domain) in schema.domains {
            if let Some(value) = object.get(*field).and_then(|v| v.as_str()) {
                if !domain.contains(&value) {
                    self.counters.lock().unwrap().failed += 1;
                    return Err(format!(
                        "{} field '{field}' has value '{value}' outside {domain:?}",
                        event.kind
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn counters(&self) -> ValidationCounters {
        *self.counters.lock().unwrap()
    }
}

impl Default for EventValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash of (kind, sorted payload field names): the validation cache key.
fn shape_key(event: &PluginEvent) -> u64 {
    let mut hasher = DefaultHasher::new();
    event.kind.hash(&mut hasher);
    if let Some(object) = event.payload.as_object() {
        let mut keys: Vec<&str> = object.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventKind, PluginEvent};
    use serde_json::json;

    #[test]
    fn missing_required_field_fails() {
        let validator = EventValidator::new();
        let event = PluginEvent::new(EventKind::StateChanged, "a", "test")
            .with_payload(json!({"fromState": "discovered"}));
        assert!(validator.validate(&event).is_err());
        assert_eq!(validator.counters().failed, 1);
    }

    #[test]
    fn enum_domain_is_enforced() {
        let validator = EventValidator::new();
        let event = PluginEvent::new(EventKind::StateChanged, "a", "test")
            .with_payload(json!({"fromState": "discovered", "toState": "exploded"}));
        assert!(validator.validate(&event).is_err());
    }

    #[test]
    fn identical_shapes_hit_the_cache() {
        let validator = EventValidator::new();
        let make = || {
            PluginEvent::new(EventKind::StateChanged, "a", "test")
                .with_payload(json!({"fromState": "discovered", "toState": "loading", "transition": "start"}))
        };
        assert!(validator.validate(&make()).is_ok());
        assert!(validator.validate(&make()).is_ok());
        let counters = validator.counters();
        assert_eq!(counters.cache_hits, 1);
        assert_eq!(counters.failed, 0);
    }

    #[test]
    fn kinds_without_schema_pass() {
        let validator = EventValidator::new();
        let event = PluginEvent::new(EventKind::LoadingProgress, "a", "test");
        assert!(validator.validate(&event).is_ok());
    }
}
