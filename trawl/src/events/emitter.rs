//! Event emitter with bounded asynchronous fan-out.
//!
//! Emitted events are handed to a bounded queue consumed by a dispatcher
//! task; each matching observer runs on its own task. Kind-specific
//! observers are awaited before wildcard observers for every event, so the
//! documented delivery order is observable. A full queue drops the event
//! and counts the overflow instead of blocking the emitter.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::observers::Observer;
use crate::events::types::{Event, EventKind};

/// Default capacity of the event history ring.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Default capacity of the dispatch queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// Where a subscription listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSelector {
    /// Only events of this kind.
    Kind(EventKind),
    /// Every event.
    All,
}

/// Emitter tuning knobs.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Capacity of the history ring; 0 disables history.
    pub max_history: usize,
    /// Capacity of the dispatch queue.
    pub queue_size: usize,
    pub enable_history: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            queue_size: DEFAULT_QUEUE_SIZE,
            enable_history: true,
        }
    }
}

/// Counter snapshot plus registry totals.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmitterStats {
    pub events_emitted: u64,
    pub events_processed: u64,
    pub observers_notified: u64,
    pub observer_errors: u64,
    pub queue_overflows: u64,
    pub total_observers: usize,
    pub wildcard_observers: usize,
    /// Kind names with at least one live subscription.
    pub event_kinds: Vec<String>,
    pub history_size: usize,
    pub history_enabled: bool,
}

/// Strong or weak handle to a registered observer.
///
/// Weak registrations do not keep the observer alive; a dead one is
/// silently skipped at dispatch and pruned from the registry.
enum Registration {
    Strong(Arc<dyn Observer>),
    Weak(Weak<dyn Observer>),
}

impl Registration {
    fn upgrade(&self) -> Option<Arc<dyn Observer>> {
        match self {
            Registration::Strong(observer) => Some(observer.clone()),
            Registration::Weak(weak) => weak.upgrade(),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Registration::Strong(_) => true,
            Registration::Weak(weak) => weak.strong_count() > 0,
        }
    }

    fn matches(&self, target: &Arc<dyn Observer>) -> bool {
        let target_addr = Arc::as_ptr(target) as *const ();
        match self {
            Registration::Strong(observer) => {
                std::ptr::eq(Arc::as_ptr(observer) as *const (), target_addr)
            }
            Registration::Weak(weak) => {
                std::ptr::eq(Weak::as_ptr(weak) as *const (), target_addr)
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<Registration>>,
    wildcard: Vec<Registration>,
}

impl Registry {
    fn bucket_mut(&mut self, selector: EventSelector) -> &mut Vec<Registration> {
        match selector {
            EventSelector::Kind(kind) => self.by_kind.entry(kind).or_default(),
            EventSelector::All => &mut self.wildcard,
        }
    }

    fn prune(&mut self) {
        for bucket in self.by_kind.values_mut() {
            bucket.retain(Registration::is_live);
        }
        self.wildcard.retain(Registration::is_live);
    }

    fn live_for_kind(&self, kind: EventKind) -> Vec<Arc<dyn Observer>> {
        self.by_kind
            .get(&kind)
            .map(|bucket| bucket.iter().filter_map(Registration::upgrade).collect())
            .unwrap_or_default()
    }

    fn live_wildcard(&self) -> Vec<Arc<dyn Observer>> {
        self.wildcard
            .iter()
            .filter_map(Registration::upgrade)
            .collect()
    }

    fn live_count(&self, selector: EventSelector) -> usize {
        match selector {
            EventSelector::Kind(kind) => self
                .by_kind
                .get(&kind)
                .map(|bucket| bucket.iter().filter(|r| r.is_live()).count())
                .unwrap_or(0),
            EventSelector::All => self.wildcard.iter().filter(|r| r.is_live()).count(),
        }
    }
}

#[derive(Default)]
struct Counters {
    events_emitted: AtomicU64,
    events_processed: AtomicU64,
    observers_notified: AtomicU64,
    observer_errors: AtomicU64,
    queue_overflows: AtomicU64,
}

struct Inner {
    registry: RwLock<Registry>,
    history: Mutex<VecDeque<Event>>,
    history_enabled: bool,
    max_history: usize,
    counters: Counters,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// The event bus.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`. Must be
/// created inside a Tokio runtime because the dispatcher task starts
/// immediately. Dropping the emitter closes the dispatch channel, so the
/// dispatcher exits even without an explicit [`EventEmitter::shutdown`].
pub struct EventEmitter {
    inner: Arc<Inner>,
    tx: mpsc::Sender<Event>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventEmitter {
    pub fn new(config: EmitterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let inner = Arc::new(Inner {
            registry: RwLock::new(Registry::default()),
            history: Mutex::new(VecDeque::new()),
            history_enabled: config.enable_history && config.max_history > 0,
            max_history: config.max_history,
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        let dispatcher = spawn_dispatcher(inner.clone(), rx);
        Self {
            inner,
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Register an observer for a kind or for everything.
    ///
    /// With `weak` the registry holds a non-owning handle; dropping the
    /// last `Arc` elsewhere unsubscribes the observer implicitly.
    pub fn subscribe(
        &self,
        selector: EventSelector,
        observer: &Arc<dyn Observer>,
        weak: bool,
    ) -> bool {
        let registration = if weak {
            Registration::Weak(Arc::downgrade(observer))
        } else {
            Registration::Strong(observer.clone())
        };
        let mut registry = self.inner.registry.write();
        registry.prune();
        registry.bucket_mut(selector).push(registration);
        debug!(observer = observer.name(), ?selector, weak, "Observer subscribed");
        true
    }

    /// Remove a previously registered observer by handle identity.
    ///
    /// Returns whether anything was removed.
    pub fn unsubscribe(&self, selector: EventSelector, observer: &Arc<dyn Observer>) -> bool {
        let mut registry = self.inner.registry.write();
        let bucket = registry.bucket_mut(selector);
        let before = bucket.len();
        bucket.retain(|registration| !registration.matches(observer));
        let removed = bucket.len() < before;
        if removed {
            debug!(observer = observer.name(), ?selector, "Observer unsubscribed");
        }
        removed
    }

    /// Fire-and-forget emit.
    ///
    /// Returns `false` when the emitter is shut down or the dispatch queue
    /// is full; the overflow is counted and the event dropped. Never blocks.
    pub fn emit(&self, event: Event) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.record(&event);
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.inner
                    .counters
                    .queue_overflows
                    .fetch_add(1, Ordering::Relaxed);
                warn!(kind = %event.kind(), "Dispatch queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Emit and wait until every matching observer has run.
    pub async fn emit_sync(&self, event: Event) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::EmitterClosed);
        }
        self.record(&event);
        deliver(&self.inner, event).await;
        Ok(())
    }

    /// Recent events, oldest first.
    ///
    /// `kind` filters; `limit` keeps only the most recent matches.
    pub fn history(&self, kind: Option<EventKind>, limit: Option<usize>) -> Vec<Event> {
        let history = self.inner.history.lock();
        let mut events: Vec<Event> = history
            .iter()
            .filter(|event| kind.is_none_or(|k| event.kind() == k))
            .cloned()
            .collect();
        if let Some(limit) = limit
            && events.len() > limit
        {
            events.drain(..events.len() - limit);
        }
        events
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn clear_observers(&self) {
        let mut registry = self.inner.registry.write();
        registry.by_kind.clear();
        registry.wildcard.clear();
    }

    /// Live subscription counts keyed by kind name, plus `"wildcard"`.
    pub fn observer_counts(&self, selector: Option<EventSelector>) -> HashMap<String, usize> {
        let registry = self.inner.registry.read();
        let mut counts = HashMap::new();
        match selector {
            Some(EventSelector::Kind(kind)) => {
                counts.insert(kind.to_string(), registry.live_count(EventSelector::Kind(kind)));
            }
            Some(EventSelector::All) => {
                counts.insert(
                    "wildcard".to_string(),
                    registry.live_count(EventSelector::All),
                );
            }
            None => {
                for kind in registry.by_kind.keys() {
                    counts.insert(
                        kind.to_string(),
                        registry.live_count(EventSelector::Kind(*kind)),
                    );
                }
                counts.insert(
                    "wildcard".to_string(),
                    registry.live_count(EventSelector::All),
                );
            }
        }
        counts
    }

    pub fn statistics(&self) -> EmitterStats {
        let registry = self.inner.registry.read();
        let mut event_kinds: Vec<String> = registry
            .by_kind
            .iter()
            .filter(|(_, bucket)| bucket.iter().any(|r| r.is_live()))
            .map(|(kind, _)| kind.to_string())
            .collect();
        event_kinds.sort();
        let total_observers: usize = registry
            .by_kind
            .keys()
            .map(|kind| registry.live_count(EventSelector::Kind(*kind)))
            .sum();
        let wildcard_observers = registry.live_count(EventSelector::All);
        drop(registry);

        let counters = &self.inner.counters;
        EmitterStats {
            events_emitted: counters.events_emitted.load(Ordering::Relaxed),
            events_processed: counters.events_processed.load(Ordering::Relaxed),
            observers_notified: counters.observers_notified.load(Ordering::Relaxed),
            observer_errors: counters.observer_errors.load(Ordering::Relaxed),
            queue_overflows: counters.queue_overflows.load(Ordering::Relaxed),
            total_observers,
            wildcard_observers,
            event_kinds,
            history_size: self.inner.history.lock().len(),
            history_enabled: self.inner.history_enabled,
        }
    }

    /// Stop accepting events and wait for in-flight deliveries.
    ///
    /// Idempotent. Events still sitting in the queue are dropped.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
        debug!("Event emitter shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn record(&self, event: &Event) {
        self.inner
            .counters
            .events_emitted
            .fetch_add(1, Ordering::Relaxed);
        if self.inner.history_enabled {
            let mut history = self.inner.history.lock();
            if history.len() == self.inner.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
    }
}

fn spawn_dispatcher(inner: Arc<Inner>, mut rx: mpsc::Receiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(event) => deliver(&inner, event).await,
                    None => break,
                },
            }
        }
    })
}

/// Deliver one event: kind-specific group first, wildcard group second.
async fn deliver(inner: &Arc<Inner>, event: Event) {
    let (kind_group, wildcard_group) = {
        let mut registry = inner.registry.write();
        registry.prune();
        (
            registry.live_for_kind(event.kind()),
            registry.live_wildcard(),
        )
    };
    let event = Arc::new(event);
    notify_group(inner, kind_group, &event).await;
    notify_group(inner, wildcard_group, &event).await;
    inner
        .counters
        .events_processed
        .fetch_add(1, Ordering::Relaxed);
}

/// Run one group of observers, one task each, and wait for all of them.
///
/// An observer error or panic is counted and logged; it never touches the
/// other observers' tasks.
async fn notify_group(inner: &Arc<Inner>, observers: Vec<Arc<dyn Observer>>, event: &Arc<Event>) {
    if observers.is_empty() {
        return;
    }
    let mut tasks = JoinSet::new();
    for observer in observers {
        let inner = inner.clone();
        let event = event.clone();
        tasks.spawn(async move {
            match observer.handle_event(&event).await {
                Ok(()) => {
                    inner
                        .counters
                        .observers_notified
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    inner
                        .counters
                        .observer_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        observer = observer.name(),
                        kind = %event.kind(),
                        error = %e,
                        "Observer failed to handle event"
                    );
                }
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            inner
                .counters
                .observer_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Observer task panicked");
        }
    }
}
