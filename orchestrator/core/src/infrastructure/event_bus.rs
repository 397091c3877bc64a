// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - Pub/Sub for Domain Events
//
// Handler-registry bus: every emit fans out concurrently to the handlers of
// the event type plus the wildcard handlers, each raced against the
// configured timeout and the whole fan-out against twice that.
//
// In-memory only: history is a bounded ring buffer used for inspection and
// tests, not for delivery guarantees.

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::config::EventBusConfig;
use crate::domain::events::{EventRecord, WILDCARD};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Event handler. Errors are logged by the bus and never reach the emitter.
pub type EventHandler = Arc<dyn Fn(EventRecord) -> HandlerFuture + Send + Sync>;

/// Continuation handed to middleware; calling it delivers the event.
pub type Next = Box<dyn FnOnce(EventRecord) -> BoxFuture<'static, EmitReport> + Send>;

pub type Middleware = Arc<dyn Fn(EventRecord, Next) -> BoxFuture<'static, EmitReport> + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Maximum handlers ({limit}) reached for event type: {event_type}")]
    HandlerLimitReached { event_type: String, limit: usize },

    #[error("Timeout waiting for event: {event_type} after {timeout:?}")]
    WaitTimeout { event_type: String, timeout: Duration },

    #[error("Event bus closed before {event_type} arrived")]
    Closed { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerFailure {
    pub handler_id: u64,
    pub error: String,
}

/// Per-emit delivery outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitReport {
    pub event_type: String,
    pub handler_count: usize,
    pub delivered: Vec<u64>,
    pub failed: Vec<HandlerFailure>,
    pub timed_out: Vec<u64>,
    /// The fan-out as a whole exceeded twice the handler timeout; per-handler
    /// outcomes are unknown.
    pub fanout_timed_out: bool,
    /// Middleware dropped the event before delivery.
    pub suppressed: bool,
}

impl EmitReport {
    fn empty(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            ..Self::default()
        }
    }

    /// Report for an event a middleware chose not to deliver.
    pub fn suppressed(event_type: &str) -> Self {
        Self {
            suppressed: true,
            ..Self::empty(event_type)
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty() && !self.fanout_timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBusStats {
    pub registered_event_types: Vec<String>,
    pub total_handlers: usize,
    pub history_size: usize,
    pub events_emitted: u64,
    pub max_handlers: usize,
    pub max_history: usize,
}

struct HandlerEntry {
    id: u64,
    handler: EventHandler,
    once: bool,
}

enum Outcome {
    Delivered,
    Failed(String),
    TimedOut,
}

struct Inner {
    config: EventBusConfig,
    registry: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    history: Mutex<VecDeque<EventRecord>>,
    middleware: RwLock<Option<Middleware>>,
    next_handler_id: AtomicU64,
    events_emitted: AtomicU64,
}

impl Inner {
    fn record(&self, event: &EventRecord) {
        if self.config.max_history == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.push_back(event.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    /// Snapshot the handlers for `event_type` (then wildcard), removing
    /// once-handlers under the same write lock so they fire at most once.
    fn take_targets(&self, event_type: &str) -> Vec<(u64, EventHandler)> {
        let mut registry = self.registry.write();
        let mut targets = Vec::new();

        let mut keys = vec![event_type];
        if event_type != WILDCARD {
            keys.push(WILDCARD);
        }

        for key in keys {
            let mut now_empty = false;
            if let Some(entries) = registry.get_mut(key) {
                targets.extend(entries.iter().map(|e| (e.id, e.handler.clone())));
                entries.retain(|e| !e.once);
                now_empty = entries.is_empty();
            }
            if now_empty {
                registry.remove(key);
            }
        }

        targets
    }

    fn remove_handler(&self, event_type: &str, handler_id: u64) -> bool {
        let mut registry = self.registry.write();
        let Some(entries) = registry.get_mut(event_type) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != handler_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            registry.remove(event_type);
        }
        removed
    }

    async fn deliver(self: Arc<Self>, event: EventRecord) -> EmitReport {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.record(&event);

        let targets = self.take_targets(&event.event_type);
        let mut report = EmitReport::empty(&event.event_type);
        report.handler_count = targets.len();

        if targets.is_empty() {
            if self.config.enable_logging {
                debug!(event_type = %event.event_type, "No handlers registered for event");
            }
            return report;
        }

        if self.config.enable_logging {
            debug!(
                event_type = %event.event_type,
                handlers = targets.len(),
                "Emitting event"
            );
        }

        let per_handler = self.config.timeout;
        let deliveries: Vec<_> = targets
            .into_iter()
            .map(|(id, handler)| {
                // A handler may panic while building its future, not only while running it.
                let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone())));
                async move {
                    let fut = match started {
                        Ok(fut) => fut,
                        Err(_) => return (id, Outcome::Failed("handler panicked".to_string())),
                    };
                    let outcome =
                        match tokio::time::timeout(per_handler, AssertUnwindSafe(fut).catch_unwind())
                            .await
                        {
                            Ok(Ok(Ok(()))) => Outcome::Delivered,
                            Ok(Ok(Err(e))) => Outcome::Failed(e.to_string()),
                            Ok(Err(_)) => Outcome::Failed("handler panicked".to_string()),
                            Err(_) => Outcome::TimedOut,
                        };
                    (id, outcome)
                }
            })
            .collect();

        match tokio::time::timeout(per_handler * 2, join_all(deliveries)).await {
            Ok(outcomes) => {
                for (id, outcome) in outcomes {
                    match outcome {
                        Outcome::Delivered => report.delivered.push(id),
                        Outcome::Failed(error) => {
                            warn!(
                                event_type = %event.event_type,
                                handler_id = id,
                                error = %error,
                                "Error in event handler"
                            );
                            report.failed.push(HandlerFailure { handler_id: id, error });
                        }
                        Outcome::TimedOut => {
                            warn!(
                                event_type = %event.event_type,
                                handler_id = id,
                                timeout_ms = per_handler.as_millis() as u64,
                                "Event handler timed out"
                            );
                            report.timed_out.push(id);
                        }
                    }
                }
            }
            Err(_) => {
                warn!(
                    event_type = %event.event_type,
                    timeout_ms = (per_handler * 2).as_millis() as u64,
                    "Event fan-out timed out"
                );
                report.fanout_timed_out = true;
            }
        }

        report
    }
}

/// Handle returned by [`EventBus::on`]. Unsubscribing is idempotent; dropping
/// the handle leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    event_type: String,
    handler_id: u64,
    bus: Weak<Inner>,
    active: AtomicBool,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.handler_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether the handler is still registered (once-handlers drop out after
    /// their first delivery).
    pub fn is_active(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        self.bus.upgrade().is_some_and(|inner| {
            inner
                .registry
                .read()
                .get(&self.event_type)
                .is_some_and(|entries| entries.iter().any(|e| e.id == self.handler_id))
        })
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.remove_handler(&self.event_type, self.handler_id);
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                middleware: RwLock::new(None),
                next_handler_id: AtomicU64::new(1),
                events_emitted: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    fn register(
        &self,
        event_type: String,
        handler: EventHandler,
        once: bool,
    ) -> Result<Subscription, EventBusError> {
        let limit = self.inner.config.max_handlers;
        let mut registry = self.inner.registry.write();

        let current = registry.get(&event_type).map_or(0, Vec::len);
        if current >= limit {
            return Err(EventBusError::HandlerLimitReached { event_type, limit });
        }

        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        registry
            .entry(event_type.clone())
            .or_default()
            .push(HandlerEntry { id, handler, once });
        drop(registry);

        if self.inner.config.enable_logging {
            debug!(event_type = %event_type, handler_id = id, once, "Handler registered");
        }

        Ok(Subscription {
            event_type,
            handler_id: id,
            bus: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        })
    }

    pub fn on(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> Result<Subscription, EventBusError> {
        self.register(event_type.into(), handler, false)
    }

    /// Register a handler that is removed before its first invocation.
    pub fn once(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> Result<Subscription, EventBusError> {
        self.register(event_type.into(), handler, true)
    }

    pub fn on_any(&self, handler: EventHandler) -> Result<Subscription, EventBusError> {
        self.on(WILDCARD, handler)
    }

    pub fn off(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Drop the handlers of `event_type`, or every handler when `None`.
    pub fn remove_all_handlers(&self, event_type: Option<&str>) {
        let mut registry = self.inner.registry.write();
        match event_type {
            Some(event_type) => {
                registry.remove(event_type);
            }
            None => registry.clear(),
        }
    }

    /// Install the single global interceptor, replacing any previous one.
    pub fn create_middleware<F, Fut>(&self, middleware: F)
    where
        F: Fn(EventRecord, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EmitReport> + Send + 'static,
    {
        let middleware: Middleware = Arc::new(move |event, next| middleware(event, next).boxed());
        let previous = self.inner.middleware.write().replace(middleware);
        if previous.is_some() {
            debug!("Replacing existing event bus middleware");
        }
    }

    pub fn clear_middleware(&self) {
        self.inner.middleware.write().take();
    }

    /// Emit and wait for every handler to settle (or time out).
    pub async fn emit(&self, event: EventRecord) -> EmitReport {
        let middleware = self.inner.middleware.read().clone();
        match middleware {
            Some(middleware) => {
                let inner = self.inner.clone();
                let next: Next = Box::new(move |event| inner.deliver(event).boxed());
                middleware(event, next).await
            }
            None => self.inner.clone().deliver(event).await,
        }
    }

    /// Fire-and-forget emit on a spawned task. Must be called from within a
    /// tokio runtime.
    pub fn emit_async(&self, event: EventRecord) -> JoinHandle<EmitReport> {
        let bus = self.clone();
        tokio::spawn(async move { bus.emit(event).await })
    }

    /// Emit several events concurrently.
    pub async fn emit_batch(&self, events: Vec<EventRecord>) -> Vec<EmitReport> {
        join_all(events.into_iter().map(|event| self.emit(event))).await
    }

    pub async fn emit_if(&self, condition: bool, event: EventRecord) -> Option<EmitReport> {
        if condition {
            Some(self.emit(event).await)
        } else {
            None
        }
    }

    /// Resolve with the next event of `event_type`.
    ///
    /// The listener is registered immediately, before the returned future is
    /// first polled, so an event emitted right after this call is not missed.
    pub fn wait_for(
        &self,
        event_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<EventRecord, EventBusError>> + Send + 'static {
        let event_type = event_type.into();
        let (tx, rx) = oneshot::channel::<EventRecord>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let registration = self.once(
            event_type.clone(),
            handler(move |event| {
                let tx = tx.clone();
                async move {
                    let sender = tx.lock().take();
                    if let Some(sender) = sender {
                        let _ = sender.send(event);
                    }
                    Ok(())
                }
            }),
        );

        async move {
            let subscription = registration?;
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(Ok(event)) => Ok(event),
                    Ok(Err(_)) => Err(EventBusError::Closed { event_type }),
                    Err(_) => {
                        subscription.unsubscribe();
                        Err(EventBusError::WaitTimeout {
                            event_type,
                            timeout: limit,
                        })
                    }
                },
                None => rx.await.map_err(|_| EventBusError::Closed { event_type }),
            }
        }
    }

    pub fn create_proxy(&self, event_type: impl Into<String>) -> EventProxy {
        EventProxy {
            bus: self.clone(),
            event_type: event_type.into(),
        }
    }

    /// Recorded events, oldest first, optionally filtered by type and
    /// limited to the most recent `limit` entries.
    pub fn history(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<EventRecord> {
        let history = self.inner.history.lock();
        let matching: Vec<EventRecord> = history
            .iter()
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .cloned()
            .collect();
        match limit {
            Some(limit) if limit < matching.len() => matching[matching.len() - limit..].to_vec(),
            _ => matching,
        }
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn has_handlers(&self, event_type: &str) -> bool {
        self.handler_count(event_type) > 0
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.inner
            .registry
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    pub fn registered_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.registry.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn stats(&self) -> EventBusStats {
        let registry = self.inner.registry.read();
        let mut registered_event_types: Vec<String> = registry.keys().cloned().collect();
        registered_event_types.sort();
        EventBusStats {
            registered_event_types,
            total_handlers: registry.values().map(Vec::len).sum(),
            history_size: self.inner.history.lock().len(),
            events_emitted: self.inner.events_emitted.load(Ordering::Relaxed),
            max_handlers: self.inner.config.max_handlers,
            max_history: self.inner.config.max_history,
        }
    }

    /// Drop every handler, the middleware and the history. Pending
    /// [`EventBus::wait_for`] futures resolve with [`EventBusError::Closed`].
    pub fn dispose(&self) {
        self.inner.registry.write().clear();
        self.inner.middleware.write().take();
        self.inner.history.lock().clear();
        debug!("Event bus disposed");
    }
}

/// Emitter bound to one event type; payloads are sent as `{ type, data }`.
#[derive(Debug, Clone)]
pub struct EventProxy {
    bus: EventBus,
    event_type: String,
}

impl EventProxy {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub async fn emit(&self, data: serde_json::Value) -> EmitReport {
        self.bus
            .emit(EventRecord::new(self.event_type.clone()).with("data", data))
            .await
    }

    pub fn emit_async(&self, data: serde_json::Value) -> JoinHandle<EmitReport> {
        self.bus
            .emit_async(EventRecord::new(self.event_type.clone()).with("data", data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        handler(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn fast_config() -> EventBusConfig {
        EventBusConfig {
            timeout: Duration::from_millis(50),
            ..EventBusConfig::default()
        }
    }

    #[tokio::test]
    async fn test_emit_without_handlers_still_records_history() {
        let bus = EventBus::default();
        let report = bus.emit(EventRecord::new("contract.created")).await;

        assert_eq!(report.handler_count, 0);
        assert!(report.is_clean());
        assert_eq!(bus.history(None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_oldest_first() {
        let bus = EventBus::new(EventBusConfig {
            max_history: 2,
            ..EventBusConfig::default()
        });
        for n in 1..=3 {
            bus.emit(EventRecord::new("x").with("n", n)).await;
        }

        let history = bus.history(Some("x"), None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].get("n"), Some(&json!(2)));
        assert_eq!(history[1].get("n"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_history_filter_and_limit() {
        let bus = EventBus::default();
        bus.emit(EventRecord::new("a").with("n", 1)).await;
        bus.emit(EventRecord::new("b")).await;
        bus.emit(EventRecord::new("a").with("n", 2)).await;
        bus.emit(EventRecord::new("a").with("n", 3)).await;

        let recent = bus.history(Some("a"), Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].get("n"), Some(&json!(2)));

        bus.clear_history();
        assert!(bus.history(None, None).is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_receives_every_event() {
        let bus = EventBus::default();
        let specific = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));

        bus.on("user.logged_in", counting_handler(specific.clone())).unwrap();
        bus.on_any(counting_handler(any.clone())).unwrap();

        let report = bus.emit(EventRecord::new("user.logged_in")).await;
        bus.emit(EventRecord::new("system.warning")).await;

        assert_eq!(report.delivered.len(), 2);
        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handlers_are_invoked_in_registration_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            bus.on(
                "ordered",
                handler(move |_| {
                    order.lock().push(label);
                    async { Ok(()) }
                }),
            )
            .unwrap();
        }

        bus.emit(EventRecord::new("ordered")).await;
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_double_unsubscribe_is_noop() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscription = bus.on("x", counting_handler(counter.clone())).unwrap();
        bus.on("x", counting_handler(counter.clone())).unwrap();

        subscription.unsubscribe();
        subscription.unsubscribe();
        bus.off(&subscription);

        assert!(!subscription.is_active());
        assert_eq!(bus.handler_count("x"), 1);
        bus.emit(EventRecord::new("x")).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_fires_a_single_time() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscription = bus.once("x", counting_handler(counter.clone())).unwrap();

        bus.emit(EventRecord::new("x")).await;
        bus.emit(EventRecord::new("x")).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_active());
        assert!(!bus.has_handlers("x"));
    }

    #[tokio::test]
    async fn test_handler_limit_fails_fast() {
        let bus = EventBus::new(EventBusConfig {
            max_handlers: 2,
            ..EventBusConfig::default()
        });
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on("x", counting_handler(counter.clone())).unwrap();
        bus.on("x", counting_handler(counter.clone())).unwrap();

        let err = bus.on("x", counting_handler(counter)).unwrap_err();
        assert_eq!(
            err,
            EventBusError::HandlerLimitReached {
                event_type: "x".to_string(),
                limit: 2
            }
        );
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_are_reported_not_raised() {
        let bus = EventBus::new(fast_config());
        let ok = bus.on("x", handler(|_| async { Ok(()) })).unwrap();
        let failing = bus
            .on("x", handler(|_| async { Err(anyhow::anyhow!("handler broke")) }))
            .unwrap();
        let slow = bus
            .on(
                "x",
                handler(|_| async {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Ok(())
                }),
            )
            .unwrap();

        let report = bus.emit(EventRecord::new("x")).await;

        assert_eq!(report.delivered, vec![ok.id()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].handler_id, failing.id());
        assert_eq!(report.failed[0].error, "handler broke");
        assert_eq!(report.timed_out, vec![slow.id()]);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = EventBus::default();
        fn explode() -> anyhow::Result<()> {
            panic!("boom")
        }
        bus.on("x", handler(|_| async { explode() })).unwrap();

        let report = bus.emit(EventRecord::new("x")).await;
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_panicking_before_its_future_is_contained() {
        let bus = EventBus::default();
        let eager: EventHandler = Arc::new(|event: EventRecord| -> HandlerFuture {
            panic!("missing payload for {}", event.event_type)
        });
        let broken = bus.on("x", eager).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        bus.on(
            "x",
            handler(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        let report = bus.emit(EventRecord::new("x")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].handler_id, broken.id());
        assert_eq!(report.failed[0].error, "handler panicked");
    }

    #[tokio::test]
    async fn test_wait_for_resolves_with_next_event() {
        let bus = EventBus::default();
        let waiter = bus.wait_for("contract.signed", Some(Duration::from_secs(1)));

        bus.emit(EventRecord::new("contract.signed").with("id", "c-1")).await;

        let event = waiter.await.unwrap();
        assert_eq!(event.get("id"), Some(&json!("c-1")));
        assert!(!bus.has_handlers("contract.signed"));
    }

    #[tokio::test]
    async fn test_wait_for_times_out_and_cleans_up() {
        let bus = EventBus::default();
        let err = bus
            .wait_for("never", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();

        assert!(matches!(err, EventBusError::WaitTimeout { .. }));
        assert!(!bus.has_handlers("never"));
    }

    #[tokio::test]
    async fn test_wait_for_fails_when_bus_disposed() {
        let bus = EventBus::default();
        let waiter = bus.wait_for("x", None);
        bus.dispose();
        assert!(matches!(waiter.await, Err(EventBusError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_middleware_can_transform_and_drop() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.on_any(handler(move |event| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(event);
                    Ok(())
                }
            }))
            .unwrap();
        }

        bus.create_middleware(|event: EventRecord, next: Next| async move {
            if event.event_type.starts_with("internal.") {
                return EmitReport::suppressed(&event.event_type);
            }
            next(event.with("enriched", true)).await
        });

        let dropped = bus.emit(EventRecord::new("internal.tick")).await;
        bus.emit(EventRecord::new("user.logged_in")).await;

        assert!(dropped.suppressed);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("enriched"), Some(&json!(true)));
        assert_eq!(bus.history(None, None).len(), 1);
    }

    #[tokio::test]
    async fn test_emit_batch_emit_if_and_proxy() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on("contract.created", counting_handler(counter.clone())).unwrap();

        let reports = bus
            .emit_batch(vec![
                EventRecord::new("contract.created"),
                EventRecord::new("contract.created"),
            ])
            .await;
        assert_eq!(reports.len(), 2);

        assert!(bus.emit_if(false, EventRecord::new("contract.created")).await.is_none());
        assert!(bus.emit_if(true, EventRecord::new("contract.created")).await.is_some());

        let proxy = bus.create_proxy("contract.created");
        proxy.emit(json!({"id": "c-9"})).await;
        let last = bus.history(Some("contract.created"), Some(1)).remove(0);
        assert_eq!(last.get("data"), Some(&json!({"id": "c-9"})));

        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_emit_async_delivers_in_background() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on("x", counting_handler(counter.clone())).unwrap();

        let report = bus.emit_async(EventRecord::new("x")).await.unwrap();
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_and_remove_all_handlers() {
        let bus = EventBus::default();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on("a", counting_handler(counter.clone())).unwrap();
        bus.on("b", counting_handler(counter.clone())).unwrap();
        bus.on("b", counting_handler(counter.clone())).unwrap();
        bus.emit(EventRecord::new("a")).await;

        let stats = bus.stats();
        assert_eq!(stats.registered_event_types, vec!["a", "b"]);
        assert_eq!(stats.total_handlers, 3);
        assert_eq!(stats.events_emitted, 1);
        assert_eq!(stats.history_size, 1);

        bus.remove_all_handlers(Some("b"));
        assert_eq!(bus.registered_event_types(), vec!["a"]);
        bus.remove_all_handlers(None);
        assert!(bus.registered_event_types().is_empty());
    }
}
