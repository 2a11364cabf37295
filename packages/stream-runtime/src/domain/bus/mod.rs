//! Reference-Counted Event Bus
//!
//! Generic publish/subscribe primitive that ties a resource's lifecycle to
//! its subscriber count. Every connection type in this crate is an event bus
//! first; the socket (or poller) it guards is acquired when the first
//! subscriber arrives and released when the last one leaves.
//!
//! # Design
//!
//! A single generic bus type covers all variants:
//! - the event union is the `E: BusEvent` parameter,
//! - per-subscriber capabilities are the `C` parameter (`()` for plain
//!   buses), produced by a factory at subscribe time,
//! - a parallel `listen` channel receives every dispatched event without
//!   participating in reference counting, so a parent object can observe a
//!   child bus without forcing the child's resource open.
//!
//! # Dispatch policy
//!
//! `dispatch` is synchronous and never suspends. It iterates a snapshot of
//! the subscriber list taken under the table lock, in subscribe order, so a
//! callback that adds or removes subscribers mid-dispatch affects the *next*
//! dispatch only. Callback panics are not caught: a broken subscriber fails
//! loud at the dispatch site.

use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscriber or listener, monotonic for the
/// lifetime of the bus instance.
pub type SubscriberId = u64;

/// An event that can be published on an [`EventBus`].
///
/// Events expose a cheap `Copy` discriminant used for subscriber filtering.
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// Discriminant type used by kind filters.
    type Kind: Copy + Eq + Send + Sync + std::fmt::Debug + 'static;

    /// The discriminant of this event.
    fn kind(&self) -> Self::Kind;
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type LifecycleHook = Arc<dyn Fn() + Send + Sync>;
type CapabilityFactory<C> = Arc<dyn Fn(SubscriberId) -> C + Send + Sync>;

// =============================================================================
// Internal State
// =============================================================================

struct SubscriberEntry<E: BusEvent> {
    id: SubscriberId,
    filter: Option<Vec<E::Kind>>,
    callback: Callback<E>,
}

struct ListenerEntry<E: BusEvent> {
    id: SubscriberId,
    callback: Callback<E>,
}

struct Table<E: BusEvent> {
    subscribers: Vec<SubscriberEntry<E>>,
    listeners: Vec<ListenerEntry<E>>,
    next_id: SubscriberId,
}

impl<E: BusEvent> Default for Table<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            listeners: Vec::new(),
            next_id: 0,
        }
    }
}

struct Lifecycle {
    on_first_subscription: Option<LifecycleHook>,
    on_zero_subscriptions: Option<LifecycleHook>,
}

struct Shared<E: BusEvent> {
    table: Mutex<Table<E>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<E: BusEvent> Shared<E> {
    fn remove_subscriber(&self, id: SubscriberId) {
        let emptied = {
            let mut table = self.table.lock();
            let before = table.subscribers.len();
            table.subscribers.retain(|s| s.id != id);
            before > 0 && table.subscribers.is_empty()
        };

        if emptied {
            let hook = self.lifecycle.lock().on_zero_subscriptions.clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    fn remove_listener(&self, id: SubscriberId) {
        self.table.lock().listeners.retain(|l| l.id != id);
    }

    fn update_subscriber(&self, id: SubscriberId, callback: Callback<E>) {
        let mut table = self.table.lock();
        if let Some(entry) = table.subscribers.iter_mut().find(|s| s.id == id) {
            entry.callback = callback;
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Reference-counted publish/subscribe bus.
///
/// `E` is the closed event union dispatched on this bus; `C` is the
/// capability handed to each subscriber (bound, subscription-scoped methods;
/// `()` for plain buses).
///
/// The bus itself is a pure coordination primitive: it has no failure modes
/// of its own. Failures of the resource it guards are published as
/// `Error`-kind events by the resource owner.
///
/// # Example
///
/// ```rust
/// use stream_runtime::domain::bus::{BusEvent, EventBus};
///
/// #[derive(Debug, Clone)]
/// enum Tick {
///     Beat(u32),
/// }
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// enum TickKind {
///     Beat,
/// }
///
/// impl BusEvent for Tick {
///     type Kind = TickKind;
///     fn kind(&self) -> TickKind {
///         TickKind::Beat
///     }
/// }
///
/// let bus: EventBus<Tick> = EventBus::new();
/// let sub = bus.subscribe(|event| {
///     let Tick::Beat(n) = event;
///     assert_eq!(*n, 7);
/// });
/// bus.dispatch(&Tick::Beat(7));
/// sub.unsubscribe();
/// ```
pub struct EventBus<E: BusEvent, C = ()> {
    shared: Arc<Shared<E>>,
    capabilities: CapabilityFactory<C>,
}

impl<E: BusEvent, C> Clone for EventBus<E, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            capabilities: Arc::clone(&self.capabilities),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    /// Create a plain bus with no per-subscriber capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(|_| ())
    }
}

impl<E: BusEvent, C> EventBus<E, C> {
    /// Create a bus whose subscribers receive a capability produced by
    /// `factory` at subscribe time.
    ///
    /// The capability rides on the [`Subscription`] handle, so bound methods
    /// are unavailable to code that never subscribed.
    #[must_use]
    pub fn with_capabilities(factory: impl Fn(SubscriberId) -> C + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                lifecycle: Mutex::new(Lifecycle {
                    on_first_subscription: None,
                    on_zero_subscriptions: None,
                }),
            }),
            capabilities: Arc::new(factory),
        }
    }

    /// Install the resource lifecycle hooks.
    ///
    /// `on_first_subscription` runs when the subscriber count goes 0 to 1,
    /// before `subscribe` returns; `on_zero_subscriptions` runs when it goes
    /// 1 to 0. Hooks run outside the table lock and must not block.
    pub fn set_lifecycle(
        &self,
        on_first_subscription: impl Fn() + Send + Sync + 'static,
        on_zero_subscriptions: impl Fn() + Send + Sync + 'static,
    ) {
        let mut lifecycle = self.shared.lifecycle.lock();
        lifecycle.on_first_subscription = Some(Arc::new(on_first_subscription));
        lifecycle.on_zero_subscriptions = Some(Arc::new(on_zero_subscriptions));
    }

    /// Register a subscriber receiving every event kind.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription<E, C> {
        self.register(None, Arc::new(callback))
    }

    /// Register a subscriber receiving only the given event kinds.
    pub fn subscribe_to(
        &self,
        kinds: impl Into<Vec<E::Kind>>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription<E, C> {
        self.register(Some(kinds.into()), Arc::new(callback))
    }

    fn register(&self, filter: Option<Vec<E::Kind>>, callback: Callback<E>) -> Subscription<E, C> {
        let (id, first) = {
            let mut table = self.shared.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            let first = table.subscribers.is_empty();
            table.subscribers.push(SubscriberEntry {
                id,
                filter,
                callback,
            });
            (id, first)
        };

        if first {
            let hook = self.shared.lifecycle.lock().on_first_subscription.clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        let capability = (self.capabilities)(id);
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
            capability,
            active: true,
        }
    }

    /// Register a listener on the parallel, non-reference-counted channel.
    ///
    /// Listeners receive every dispatched event and never trigger the
    /// lifecycle hooks, so listening alone keeps the guarded resource
    /// released.
    pub fn listen(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Listener<E> {
        let id = {
            let mut table = self.shared.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.listeners.push(ListenerEntry {
                id,
                callback: Arc::new(callback),
            });
            id
        };

        Listener {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Deliver an event synchronously, in subscribe order, to every
    /// subscriber whose filter accepts it, then to every listener.
    ///
    /// Producer-side only: types wrapping a bus keep this method out of
    /// their consumer surface.
    pub fn dispatch(&self, event: &E) {
        let kind = event.kind();
        let targets: Vec<Callback<E>> = {
            let table = self.shared.table.lock();
            table
                .subscribers
                .iter()
                .filter(|s| s.filter.as_ref().is_none_or(|f| f.contains(&kind)))
                .map(|s| Arc::clone(&s.callback))
                .chain(table.listeners.iter().map(|l| Arc::clone(&l.callback)))
                .collect()
        };

        for callback in targets {
            callback(event);
        }
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.table.lock().subscribers.len()
    }

    /// Number of active listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.table.lock().listeners.len()
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Handle to an active subscription.
///
/// Unsubscribes on drop; [`Subscription::unsubscribe`] makes the release
/// explicit at call sites that want it visible.
pub struct Subscription<E: BusEvent, C = ()> {
    shared: Weak<Shared<E>>,
    id: SubscriberId,
    capability: C,
    active: bool,
}

impl<E: BusEvent, C> Subscription<E, C> {
    /// This subscription's bus-unique id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// The capability bound to this subscription.
    #[must_use]
    pub const fn capability(&self) -> &C {
        &self.capability
    }

    /// Replace this subscription's callback in place, keeping its id,
    /// filter, and dispatch position.
    pub fn update(&self, callback: impl Fn(&E) + Send + Sync + 'static) {
        if let Some(shared) = self.shared.upgrade() {
            shared.update_subscriber(self.id, Arc::new(callback));
        }
    }

    /// Remove this subscriber. If it was the last one, the bus's
    /// `on_zero_subscriptions` hook runs before this returns.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_subscriber(self.id);
        }
    }
}

impl<E: BusEvent, C> Drop for Subscription<E, C> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to an active listener registration. Deregisters on drop.
pub struct Listener<E: BusEvent> {
    shared: Weak<Shared<E>>,
    id: SubscriberId,
}

impl<E: BusEvent> Listener<E> {
    /// This listener's bus-unique id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove this listener.
    pub fn stop(self) {
        drop(self);
    }
}

impl<E: BusEvent> Drop for Listener<E> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_listener(self.id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
