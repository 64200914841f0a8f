//! Typed publish/subscribe registry
//!
//! Handlers are kept per [`EventKind`] in registration order and run
//! synchronously by [`EventBus::publish`]. Each worker dispatches through its
//! own fork of the bus, so a handler list is never mutated while the owning
//! worker is inside `publish`: removals requested mid-dispatch are deferred
//! until the outermost dispatch returns.

use crate::error::HandlerError;
use crate::event::{Event, EventKind, ServerEvent};
use crate::handler::{Context, FnHandler, Handler, HandlerResult};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

/// Ids are unique across buses so one id names one subscription everywhere
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct Entry {
    id: SubscriptionId,
    handler: Arc<dyn Handler>,
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<EventKind, Vec<Entry>>,
    dispatching: usize,
    pending_removals: Vec<SubscriptionId>,
}

impl Inner {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for entries in self.handlers.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            removed |= entries.len() != before;
        }
        self.handlers.retain(|_, entries| !entries.is_empty());
        removed
    }

    fn contains(&self, id: SubscriptionId) -> bool {
        self.handlers
            .values()
            .any(|entries| entries.iter().any(|entry| entry.id == id))
    }
}

/// Event kind to ordered handler list
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for the event payload type `E`
    pub fn subscribe<E, F>(&self, f: F) -> SubscriptionId
    where
        E: ServerEvent,
        F: Fn(&mut E, &mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe_kind(E::KIND, Arc::new(FnHandler::new(f)))
    }

    /// Register an untyped handler for `kind`
    pub fn subscribe_kind(&self, kind: EventKind, handler: Arc<dyn Handler>) -> SubscriptionId {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .handlers
            .entry(kind)
            .or_default()
            .push(Entry { id, handler });
        id
    }

    /// Remove a handler. Inside a dispatch the removal takes effect once the
    /// dispatch completes. Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        if inner.dispatching > 0 {
            let exists = inner.contains(id) && !inner.pending_removals.contains(&id);
            if exists {
                inner.pending_removals.push(id);
            }
            exists
        } else {
            inner.remove(id)
        }
    }

    pub fn has_handlers(&self, kind: EventKind) -> bool {
        self.handler_count(kind) > 0
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Independent copy with the same subscriptions and ids
    pub fn fork(&self) -> EventBus {
        let inner = self.lock();
        EventBus {
            inner: Mutex::new(Inner {
                handlers: inner.handlers.clone(),
                dispatching: 0,
                pending_removals: Vec::new(),
            }),
        }
    }

    /// Run every handler for the event's kind in registration order.
    ///
    /// Stops early when a handler stops propagation. The first handler error
    /// (a contained panic included) is returned and the remaining handlers
    /// are skipped.
    pub fn publish(&self, event: &mut Event, ctx: &mut Context<'_>) -> HandlerResult {
        let snapshot: Vec<Arc<dyn Handler>> = {
            let mut inner = self.lock();
            let snapshot = match inner.handlers.get(&event.kind()) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
                None => return Ok(()),
            };
            inner.dispatching += 1;
            snapshot
        };
        let _guard = DispatchGuard { bus: self };

        for handler in snapshot {
            if event.is_propagation_stopped() {
                break;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event, ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(payload) => return Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        let mut kinds: Vec<_> = inner
            .handlers
            .iter()
            .map(|(kind, entries)| (*kind, entries.len()))
            .collect();
        kinds.sort();
        f.debug_struct("EventBus").field("handlers", &kinds).finish()
    }
}

struct DispatchGuard<'a> {
    bus: &'a EventBus,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.bus.lock();
        inner.dispatching = inner.dispatching.saturating_sub(1);
        if inner.dispatching == 0 && !inner.pending_removals.is_empty() {
            let removals = std::mem::take(&mut inner.pending_removals);
            for id in removals {
                inner.remove(id);
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The main bus plus one bus per sub-server.
///
/// Listener 0 is the main server. A sub-server with no handler for a
/// connection-scoped kind falls back to the main server's handlers.
#[derive(Debug, Default)]
pub(crate) struct Buses {
    main: EventBus,
    listeners: Vec<EventBus>,
}

impl Buses {
    pub(crate) fn new(main: EventBus, listeners: Vec<EventBus>) -> Self {
        Self { main, listeners }
    }

    pub(crate) fn main(&self) -> &EventBus {
        &self.main
    }

    /// Bus that handles `kind` for connections arriving on `listener`
    pub(crate) fn for_listener(&self, listener: usize, kind: EventKind) -> &EventBus {
        match listener.checked_sub(1).and_then(|i| self.listeners.get(i)) {
            Some(bus) if bus.has_handlers(kind) => bus,
            _ => &self.main,
        }
    }

    pub(crate) fn fork(&self) -> Buses {
        Buses {
            main: self.main.fork(),
            listeners: self.listeners.iter().map(EventBus::fork).collect(),
        }
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = self.main.unsubscribe(id);
        for bus in &self.listeners {
            removed |= bus.unsubscribe(id);
        }
        removed
    }
}
