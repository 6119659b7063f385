//! Event channels: an ordered list of subscribers plus a stored value.
//!
//! A [`Channel<T>`] is a cheap, cloneable handle to one shared channel. Every
//! clone observes the same subscribers, the same value and the same installed
//! dispatcher. A channel with no meaningful payload is a [`BasicChannel`]
//! (`Channel<()>`); the boolean channel used by toggles is a [`BoolChannel`].
//!
//! Raising a channel snapshots its subscriber list and hands the snapshot to
//! the installed [`Dispatch`] implementation. Subscribers never receive the
//! value as an argument; they read it back through the channel when they run,
//! so a deferred callback sees the latest value, not the one in effect when
//! the raise happened.

use crate::common::{BatchId, Callback, SubscriberId};
use crate::dispatch::Dispatch;
use crate::error::BrokerError;
use parking_lot::{Mutex, RwLock};
use slotmap::SlotMap;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// A channel that carries no payload.
pub type BasicChannel = Channel<()>;

/// A channel that carries a boolean payload.
pub type BoolChannel = Channel<bool>;

#[derive(Default)]
struct SubscriberList {
    callbacks: SlotMap<SubscriberId, Callback>,
    order: Vec<SubscriberId>,
}

impl SubscriberList {
    fn push(&mut self, callback: Callback) -> SubscriberId {
        let id = self.callbacks.insert(callback);
        self.order.push(id);
        id
    }

    fn remove(&mut self, id: SubscriberId) -> bool {
        if self.callbacks.remove(id).is_none() {
            return false;
        }
        self.order.retain(|existing| *existing != id);
        true
    }

    fn find(&self, callback: &Callback) -> Option<SubscriberId> {
        self.order.iter().copied().find(|id| {
            self.callbacks
                .get(*id)
                .is_some_and(|existing| Arc::ptr_eq(existing, callback))
        })
    }

    fn snapshot(&self) -> Vec<Callback> {
        self.order
            .iter()
            .filter_map(|id| self.callbacks.get(*id).cloned())
            .collect()
    }
}

struct ChannelInner<T> {
    value: RwLock<T>,
    subscribers: Mutex<SubscriberList>,
    dispatcher: RwLock<Option<Arc<dyn Dispatch>>>,
}

/// A shared handle to an event channel carrying a value of type `T`.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Channel<T> {
    /// Creates an unbound channel holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                value: RwLock::new(initial),
                subscribers: Mutex::new(SubscriberList::default()),
                dispatcher: RwLock::new(None),
            }),
        }
    }

    /// Appends a callback. The same closure may be subscribed more than once.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriberId {
        self.subscribe_callback(Arc::new(callback))
    }

    /// Appends an already shared callback, keeping its identity so it can be
    /// removed later with [`Channel::unsubscribe_callback`].
    pub fn subscribe_callback(&self, callback: Callback) -> SubscriberId {
        let id = self.inner.subscribers.lock().push(callback);
        debug!(?id, payload = type_name::<T>(), "subscribed");
        id
    }

    /// Removes a subscription. Returns `false` if it was not present.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.subscribers.lock().remove(id)
    }

    /// Removes the first subscription of this exact callback.
    pub fn unsubscribe_callback(&self, callback: &Callback) -> bool {
        self.remove_callback(callback).is_some()
    }

    /// Like `unsubscribe_callback`, but reports which subscription went away.
    pub(crate) fn remove_callback(&self, callback: &Callback) -> Option<SubscriberId> {
        let mut subscribers = self.inner.subscribers.lock();
        let id = subscribers.find(callback)?;
        subscribers.remove(id).then_some(id)
    }

    /// Hands a snapshot of the current subscribers to the dispatcher.
    ///
    /// With no dispatcher installed this logs an error and runs nothing.
    /// Neither lock is held while the dispatcher runs, so callbacks executed
    /// synchronously may subscribe, unsubscribe or raise again; none of that
    /// changes the fan-out of this raise.
    pub fn raise(&self) -> Option<BatchId> {
        let snapshot = self.inner.subscribers.lock().snapshot();
        let dispatcher = self.inner.dispatcher.read().clone();
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(snapshot),
            None => {
                let err = BrokerError::MissingDispatcher {
                    payload: type_name::<T>(),
                };
                error!(label = err.as_label(), subscribers = snapshot.len(), "{err}");
                None
            }
        }
    }

    /// Stores `value`, then raises.
    pub fn update_value(&self, value: T) -> Option<BatchId> {
        *self.inner.value.write() = value;
        self.raise()
    }

    /// Installs or replaces the dispatcher.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatch>) {
        *self.inner.dispatcher.write() = Some(dispatcher);
    }

    /// Whether a dispatcher is installed.
    pub fn is_bound(&self) -> bool {
        self.inner.dispatcher.read().is_some()
    }

    /// Number of live subscriptions, duplicates included.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().order.len()
    }

    /// Reads the current value without cloning it.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Whether both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + Sync + 'static> Channel<T> {
    /// A clone of the current value.
    pub fn value(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Subscribes a callback that receives the value current at the time it
    /// runs. The subscription only holds a weak reference to the channel.
    pub fn subscribe_value(&self, callback: impl Fn(T) + Send + Sync + 'static) -> SubscriberId {
        self.subscribe_callback(self.value_callback(callback))
    }

    /// Wraps `callback` so it reads this channel's value when it runs.
    pub(crate) fn value_callback(&self, callback: impl Fn(T) + Send + Sync + 'static) -> Callback {
        let channel: Weak<ChannelInner<T>> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = channel.upgrade() {
                let value = inner.value.read().clone();
                callback(value);
            }
        })
    }
}

impl<T: Default + Send + Sync + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("payload", &type_name::<T>())
            .field("subscribers", &self.inner.subscribers.lock().order.len())
            .field("bound", &self.inner.dispatcher.read().is_some())
            .finish()
    }
}

/// The payload-independent view of a channel the broker stores.
pub(crate) trait RawChannel: Send + Sync {
    fn subscribe_callback(&self, callback: Callback) -> SubscriberId;
    fn unsubscribe(&self, id: SubscriberId) -> bool;
    fn unsubscribe_callback(&self, callback: &Callback) -> Option<SubscriberId>;
    fn raise(&self) -> Option<BatchId>;
    fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatch>);
    fn subscriber_count(&self) -> usize;
    fn payload_type(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + Sync + 'static> RawChannel for Channel<T> {
    fn subscribe_callback(&self, callback: Callback) -> SubscriberId {
        Channel::subscribe_callback(self, callback)
    }

    fn unsubscribe(&self, id: SubscriberId) -> bool {
        Channel::unsubscribe(self, id)
    }

    fn unsubscribe_callback(&self, callback: &Callback) -> Option<SubscriberId> {
        Channel::remove_callback(self, callback)
    }

    fn raise(&self) -> Option<BatchId> {
        Channel::raise(self)
    }

    fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatch>) {
        Channel::set_dispatcher(self, dispatcher)
    }

    fn subscriber_count(&self) -> usize {
        Channel::subscriber_count(self)
    }

    fn payload_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
