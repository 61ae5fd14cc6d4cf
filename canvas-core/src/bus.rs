//! # Event Dispatch Bus
//!
//! Turns graph-surface events into a priority-ordered handler pipeline.
//!
//! ```text
//! emit(type, payload)
//!   → filters (registration order, first `false` vetoes)
//!   → history (bounded, FIFO eviction)
//!   → handlers (ascending priority, stable on ties)
//! ```
//!
//! A handler error is logged and the chain continues. A handler returning
//! [`Propagation::Stop`] ends the chain for that emission only.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::current_timestamp_ms;
use crate::event::GraphEvent;
use crate::id::{EventId, FilterId, HandlerId};
use crate::CanvasResult;

/// Handler priority. Lower values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Engine-internal mirroring; runs before everything else.
    pub const CRITICAL: Self = Self(0);
    /// Runs before normal handlers.
    pub const HIGH: Self = Self(10);
    /// Default priority.
    pub const NORMAL: Self = Self(50);
    /// Runs after normal handlers.
    pub const LOW: Self = Self(100);
    /// Runs last.
    pub const IDLE: Self = Self(1000);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// What a handler wants the bus to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Keep running later handlers.
    Continue,
    /// Skip the remaining handlers of this emission.
    Stop,
}

/// Result returned by a handler.
pub type HandlerResult = CanvasResult<Propagation>;

/// What a handler sees of an emission.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    /// Id of this emission.
    pub id: EventId,
    /// Event type the handler was registered for.
    pub event_type: &'a str,
    /// Event payload.
    pub payload: &'a Value,
    /// Priority the event was emitted with.
    pub priority: Priority,
    /// Emission time (ms since epoch).
    pub timestamp: u64,
}

type Handler = Box<dyn FnMut(&EventContext<'_>) -> HandlerResult + Send>;
type FilterFn = Box<dyn Fn(&Value, &str) -> CanvasResult<bool> + Send>;

struct Registration {
    id: HandlerId,
    handler: Handler,
    priority: Priority,
    once: bool,
    executed: u64,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

struct Filter {
    id: FilterId,
    predicate: FilterFn,
}

/// Options for [`DispatchBus::register`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Handler priority.
    pub priority: Priority,
    /// Unregister after the first invocation.
    pub once: bool,
}

impl HandlerOptions {
    /// Options with the given priority.
    #[must_use]
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            once: false,
        }
    }

    /// Mark the handler as one-shot.
    #[must_use]
    pub const fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// An entry in the bounded event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Emission id.
    pub id: EventId,
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub payload: Value,
    /// Priority it was emitted with.
    pub priority: Priority,
    /// Emission time (ms since epoch).
    pub timestamp: u64,
}

/// What happened to one emission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitOutcome {
    /// Emission id, if the event passed filters.
    pub event_id: Option<EventId>,
    /// Whether the event reached the handler stage.
    pub delivered: bool,
    /// Whether a filter vetoed the event.
    pub vetoed: bool,
    /// Handlers invoked, including ones that failed.
    pub handlers_run: usize,
    /// Whether a handler stopped propagation.
    pub stopped: bool,
    /// Handlers that returned an error.
    pub errors: usize,
}

/// Bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum history length.
    pub history_limit: usize,
    /// Whether the bus starts enabled.
    pub enabled: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            enabled: true,
        }
    }
}

/// Diagnostic snapshot of the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatus {
    /// Whether emission is enabled.
    pub enabled: bool,
    /// Registered handlers per event type.
    pub handlers: BTreeMap<String, usize>,
    /// Registered filters per event type.
    pub filters: BTreeMap<String, usize>,
    /// Current history length.
    pub history_len: usize,
    /// Events that reached the handler stage.
    pub emitted: u64,
    /// Events dropped by a filter.
    pub vetoed: u64,
    /// Handler errors caught.
    pub handler_errors: u64,
    /// Filter errors treated as pass-through.
    pub filter_errors: u64,
}

#[derive(Debug, Default)]
struct BusStats {
    emitted: u64,
    vetoed: u64,
    handler_errors: u64,
    filter_errors: u64,
}

/// Priority-ordered event dispatcher.
pub struct DispatchBus {
    handlers: HashMap<String, Vec<Registration>>,
    filters: HashMap<String, Vec<Filter>>,
    history: VecDeque<EventRecord>,
    config: BusConfig,
    enabled: bool,
    stats: BusStats,
}

impl std::fmt::Debug for DispatchBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBus")
            .field("handlers", &self.handlers)
            .field("history_len", &self.history.len())
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl Default for DispatchBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl DispatchBus {
    /// Create a bus.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            filters: HashMap::new(),
            history: VecDeque::new(),
            enabled: config.enabled,
            config,
            stats: BusStats::default(),
        }
    }

    /// Register a handler for an event type.
    ///
    /// Handlers run in ascending priority; equal priorities run in
    /// registration order.
    pub fn register<F>(
        &mut self,
        event_type: &str,
        options: HandlerOptions,
        handler: F,
    ) -> HandlerId
    where
        F: FnMut(&EventContext<'_>) -> HandlerResult + Send + 'static,
    {
        let id = HandlerId::new();
        let list = self.handlers.entry(event_type.to_string()).or_default();
        let at = list.partition_point(|r| r.priority <= options.priority);
        list.insert(
            at,
            Registration {
                id,
                handler: Box::new(handler),
                priority: options.priority,
                once: options.once,
                executed: 0,
            },
        );
        tracing::debug!(
            "Registered handler {id} for {event_type} at priority {}",
            options.priority.0
        );
        id
    }

    /// Register a handler with default options.
    pub fn on<F>(&mut self, event_type: &str, handler: F) -> HandlerId
    where
        F: FnMut(&EventContext<'_>) -> HandlerResult + Send + 'static,
    {
        self.register(event_type, HandlerOptions::default(), handler)
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn unregister(&mut self, event_type: &str, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(event_type);
        }
        removed
    }

    /// Add a filter for an event type.
    ///
    /// A filter that returns `Ok(false)` vetoes the event. A filter that
    /// returns an error is logged and treated as pass-through.
    pub fn add_filter<F>(&mut self, event_type: &str, predicate: F) -> FilterId
    where
        F: Fn(&Value, &str) -> CanvasResult<bool> + Send + 'static,
    {
        let id = FilterId::new();
        self.filters
            .entry(event_type.to_string())
            .or_default()
            .push(Filter {
                id,
                predicate: Box::new(predicate),
            });
        id
    }

    /// Remove a filter. Returns whether it was registered.
    pub fn remove_filter(&mut self, event_type: &str, id: FilterId) -> bool {
        let Some(list) = self.filters.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|f| f.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.filters.remove(event_type);
        }
        removed
    }

    /// Emit an event.
    pub fn emit(&mut self, event_type: &str, payload: Value, priority: Priority) -> EmitOutcome {
        if !self.enabled {
            tracing::trace!("Bus disabled, dropping {event_type}");
            return EmitOutcome::default();
        }

        if !self.passes_filters(event_type, &payload) {
            self.stats.vetoed += 1;
            tracing::debug!("Event {event_type} vetoed by filter");
            return EmitOutcome {
                vetoed: true,
                ..EmitOutcome::default()
            };
        }

        let record = EventRecord {
            id: EventId::new(),
            event_type: event_type.to_string(),
            payload,
            priority,
            timestamp: current_timestamp_ms(),
        };
        self.push_history(record.clone());
        self.stats.emitted += 1;

        let mut outcome = EmitOutcome {
            event_id: Some(record.id),
            delivered: true,
            ..EmitOutcome::default()
        };

        let Some(list) = self.handlers.get_mut(event_type) else {
            return outcome;
        };

        let ctx = EventContext {
            id: record.id,
            event_type,
            payload: &record.payload,
            priority,
            timestamp: record.timestamp,
        };

        let mut spent = Vec::new();
        for registration in list.iter_mut() {
            registration.executed += 1;
            outcome.handlers_run += 1;
            if registration.once {
                spent.push(registration.id);
            }
            match (registration.handler)(&ctx) {
                Ok(Propagation::Continue) => {}
                Ok(Propagation::Stop) => {
                    tracing::debug!(
                        "Handler {} stopped propagation of {event_type}",
                        registration.id
                    );
                    outcome.stopped = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Handler {} failed on {event_type}: {e}", registration.id);
                    self.stats.handler_errors += 1;
                    outcome.errors += 1;
                }
            }
        }

        if !spent.is_empty() {
            list.retain(|r| !spent.contains(&r.id));
            if list.is_empty() {
                self.handlers.remove(event_type);
            }
        }

        outcome
    }

    /// Normalize a graph event and emit it at normal priority.
    pub fn dispatch(&mut self, event: &GraphEvent) -> EmitOutcome {
        self.emit(event.name(), event.payload(), Priority::NORMAL)
    }

    /// Resume emission.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Suspend emission; `emit` becomes a no-op.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Whether emission is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Event history, oldest first.
    ///
    /// `event_type` restricts to one type; `limit` keeps the most recent
    /// `limit` records.
    #[must_use]
    pub fn history(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<EventRecord> {
        let matching: Vec<_> = self
            .history
            .iter()
            .filter(|r| event_type.is_none_or(|t| r.event_type == t))
            .cloned()
            .collect();
        match limit {
            Some(n) if n < matching.len() => matching[matching.len() - n..].to_vec(),
            _ => matching,
        }
    }

    /// Drop the history.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Handlers registered for an event type.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn status(&self) -> BusStatus {
        BusStatus {
            enabled: self.enabled,
            handlers: self
                .handlers
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            filters: self
                .filters
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
            history_len: self.history.len(),
            emitted: self.stats.emitted,
            vetoed: self.stats.vetoed,
            handler_errors: self.stats.handler_errors,
            filter_errors: self.stats.filter_errors,
        }
    }

    /// Clear handlers, filters and history.
    pub fn destroy(&mut self) {
        self.handlers.clear();
        self.filters.clear();
        self.history.clear();
        tracing::debug!("Dispatch bus destroyed");
    }

    fn passes_filters(&mut self, event_type: &str, payload: &Value) -> bool {
        let Some(filters) = self.filters.get(event_type) else {
            return true;
        };
        for filter in filters {
            match (filter.predicate)(payload, event_type) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    tracing::warn!(
                        "Filter {} failed on {event_type}, passing through: {e}",
                        filter.id
                    );
                    self.stats.filter_errors += 1;
                }
            }
        }
        true
    }

    fn push_history(&mut self, record: EventRecord) {
        if self.config.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.config.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CanvasError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type BoxedHandler = Box<dyn FnMut(&EventContext<'_>) -> HandlerResult + Send>;
    type Calls = Arc<Mutex<Vec<&'static str>>>;

    fn recorder() -> (Calls, impl Fn(&'static str) -> BoxedHandler) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&calls);
        let make = move |name: &'static str| -> BoxedHandler {
            let calls = Arc::clone(&shared);
            Box::new(move |_ctx: &EventContext<'_>| {
                calls.lock().expect("lock").push(name);
                Ok(Propagation::Continue)
            })
        };
        (calls, make)
    }

    #[test]
    fn test_high_runs_before_low() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.register("node:clicked", HandlerOptions::priority(Priority::LOW), make("h2"));
        bus.register("node:clicked", HandlerOptions::priority(Priority::HIGH), make("h1"));

        bus.emit("node:clicked", json!({}), Priority::NORMAL);
        assert_eq!(*calls.lock().expect("lock"), vec!["h1", "h2"]);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.on("evt", make("a"));
        bus.on("evt", make("b"));
        bus.register("evt", HandlerOptions::priority(Priority::HIGH), make("first"));
        bus.on("evt", make("c"));

        bus.emit("evt", Value::Null, Priority::NORMAL);
        assert_eq!(*calls.lock().expect("lock"), vec!["first", "a", "b", "c"]);
    }

    #[test]
    fn test_stop_short_circuits_one_emission() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        let stops = Arc::new(Mutex::new(true));
        let flag = Arc::clone(&stops);
        bus.register("evt", HandlerOptions::priority(Priority::HIGH), move |_ctx| {
            if *flag.lock().expect("lock") {
                Ok(Propagation::Stop)
            } else {
                Ok(Propagation::Continue)
            }
        });
        bus.on("evt", make("later"));

        let outcome = bus.emit("evt", Value::Null, Priority::NORMAL);
        assert!(outcome.stopped);
        assert!(calls.lock().expect("lock").is_empty());

        *stops.lock().expect("lock") = false;
        bus.emit("evt", Value::Null, Priority::NORMAL);
        assert_eq!(*calls.lock().expect("lock"), vec!["later"]);
    }

    #[test]
    fn test_handler_error_does_not_stop_chain() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.register("evt", HandlerOptions::priority(Priority::HIGH), |_ctx| {
            Err(CanvasError::Handler("boom".to_string()))
        });
        bus.on("evt", make("after"));

        let outcome = bus.emit("evt", Value::Null, Priority::NORMAL);
        assert_eq!(outcome.errors, 1);
        assert_eq!(outcome.handlers_run, 2);
        assert_eq!(*calls.lock().expect("lock"), vec!["after"]);
        assert_eq!(bus.status().handler_errors, 1);
    }

    #[test]
    fn test_filter_veto_runs_no_handlers() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.on("evt", make("h"));
        bus.add_filter("evt", |payload, _ty| Ok(payload["allowed"] == json!(true)));

        let outcome = bus.emit("evt", json!({"allowed": false}), Priority::NORMAL);
        assert!(outcome.vetoed);
        assert!(calls.lock().expect("lock").is_empty());
        assert!(bus.history(None, None).is_empty());

        bus.emit("evt", json!({"allowed": true}), Priority::NORMAL);
        assert_eq!(*calls.lock().expect("lock"), vec!["h"]);
    }

    #[test]
    fn test_filter_error_passes_through() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.on("evt", make("h"));
        bus.add_filter("evt", |_payload, _ty| {
            Err(CanvasError::InvalidOperation("bad filter".to_string()))
        });

        let outcome = bus.emit("evt", Value::Null, Priority::NORMAL);
        assert!(outcome.delivered);
        assert_eq!(*calls.lock().expect("lock"), vec!["h"]);
        assert_eq!(bus.status().filter_errors, 1);
    }

    #[test]
    fn test_remove_filter() {
        let mut bus = DispatchBus::default();
        let id = bus.add_filter("evt", |_p, _t| Ok(false));
        assert!(bus.emit("evt", Value::Null, Priority::NORMAL).vetoed);
        assert!(bus.remove_filter("evt", id));
        assert!(!bus.remove_filter("evt", id));
        assert!(bus.emit("evt", Value::Null, Priority::NORMAL).delivered);
    }

    #[test]
    fn test_once_handler_unregisters() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.register("evt", HandlerOptions::default().once(), make("once"));
        bus.on("evt", make("always"));

        bus.emit("evt", Value::Null, Priority::NORMAL);
        bus.emit("evt", Value::Null, Priority::NORMAL);
        assert_eq!(
            *calls.lock().expect("lock"),
            vec!["once", "always", "always"]
        );
        assert_eq!(bus.handler_count("evt"), 1);
    }

    #[test]
    fn test_unregister() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        let id = bus.on("evt", make("h"));
        assert!(bus.unregister("evt", id));
        assert!(!bus.unregister("evt", id));
        bus.emit("evt", Value::Null, Priority::NORMAL);
        assert!(calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_disabled_bus_is_noop() {
        let mut bus = DispatchBus::default();
        let (calls, make) = recorder();
        bus.on("evt", make("h"));
        bus.disable();
        let outcome = bus.emit("evt", Value::Null, Priority::NORMAL);
        assert!(!outcome.delivered);
        assert!(bus.history(None, None).is_empty());
        bus.enable();
        bus.emit("evt", Value::Null, Priority::NORMAL);
        assert_eq!(calls.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let mut bus = DispatchBus::new(BusConfig {
            history_limit: 3,
            enabled: true,
        });
        for i in 0..5 {
            bus.emit("evt", json!(i), Priority::NORMAL);
        }
        let payloads: Vec<_> = bus.history(None, None).into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_history_filter_and_limit() {
        let mut bus = DispatchBus::default();
        bus.emit("a", json!(1), Priority::NORMAL);
        bus.emit("b", json!(2), Priority::NORMAL);
        bus.emit("a", json!(3), Priority::NORMAL);
        bus.emit("a", json!(4), Priority::NORMAL);

        let only_a = bus.history(Some("a"), Some(2));
        let payloads: Vec<_> = only_a.into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![json!(3), json!(4)]);
        assert_eq!(bus.history(Some("b"), None).len(), 1);
    }

    #[test]
    fn test_destroy_clears_everything() {
        let mut bus = DispatchBus::default();
        let (_calls, make) = recorder();
        bus.on("evt", make("h"));
        bus.add_filter("evt", |_p, _t| Ok(true));
        bus.emit("evt", Value::Null, Priority::NORMAL);

        bus.destroy();
        let status = bus.status();
        assert!(status.handlers.is_empty());
        assert!(status.filters.is_empty());
        assert_eq!(status.history_len, 0);
    }

    #[test]
    fn test_dispatch_graph_event() {
        let mut bus = DispatchBus::default();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        bus.on("node:clicked", move |ctx| {
            *sink.lock().expect("lock") = Some(ctx.payload.clone());
            Ok(Propagation::Continue)
        });
        bus.dispatch(&GraphEvent::custom("node:clicked", json!({"id": "n1"})));
        assert_eq!(*seen.lock().expect("lock"), Some(json!({"id": "n1"})));
    }
}
