//! The name-keyed channel registry.
//!
//! A [`Broker`] is an explicit context object. Components that need to talk
//! to each other are handed a clone of the same broker (clones share the
//! registry) and resolve channels by name through it. Separate brokers are
//! fully isolated from each other, which keeps tests independent.

use crate::channel::{Channel, RawChannel};
use crate::common::{BatchId, Callback, SubscriberId};
use crate::config::{BrokerConfig, ChannelConfig, PayloadKind};
use crate::dispatch::Dispatch;
use crate::error::BrokerError;
use crate::events::BrokerEvent;
use parking_lot::RwLock;
use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

type ChannelMap = HashMap<String, Arc<dyn RawChannel>>;

/// The channel registry.
///
/// Lock order is always registry first, then dispatcher slot. No broker lock
/// is held while a channel is raised, so callbacks that run synchronously may
/// call back into the broker.
#[derive(Clone)]
pub struct Broker {
    channels: Arc<RwLock<ChannelMap>>,
    dispatcher: Arc<RwLock<Option<Arc<dyn Dispatch>>>>,
    event_sender: broadcast::Sender<BrokerEvent>,
}

// Construction.
impl Broker {
    /// Creates an empty broker with no dispatcher.
    pub fn new() -> Self {
        Self::with_event_capacity(64)
    }

    /// Creates an empty broker whose event stream buffers `capacity` events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (event_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            dispatcher: Arc::new(RwLock::new(None)),
            event_sender,
        }
    }

    /// Creates a broker and registers every channel the config declares.
    ///
    /// No dispatcher is installed yet; the engine (or the caller) does that.
    pub fn from_config(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let broker = Self::with_event_capacity(config.event_capacity);
        broker.register_declared(&config.channels)?;
        Ok(broker)
    }

    /// Registers declared channels, failing on the first name already taken.
    pub fn register_declared(&self, declared: &[ChannelConfig]) -> Result<(), BrokerError> {
        for channel in declared {
            match channel.payload {
                PayloadKind::Unit => self.add(channel.name.as_str(), Channel::new(()))?,
                PayloadKind::Bool => self.add(channel.name.as_str(), Channel::new(channel.initial))?,
            }
        }
        Ok(())
    }
}

// Registry operations.
impl Broker {
    /// Registers `channel` under `name`.
    ///
    /// Fails with [`BrokerError::ChannelExists`] if the name is taken, leaving
    /// the existing channel untouched. If a dispatcher is configured it is
    /// installed on the new channel.
    pub fn add<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        channel: Channel<T>,
    ) -> Result<(), BrokerError> {
        let name = name.into();
        let mut channels = self.channels.write();
        if channels.contains_key(&name) {
            return Err(BrokerError::ChannelExists { name });
        }
        self.insert_locked(&mut channels, name, channel);
        Ok(())
    }

    /// Returns the channel registered under `name`, registering `channel`
    /// first if the name is free.
    pub fn get_or_add<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        channel: Channel<T>,
    ) -> Result<Channel<T>, BrokerError> {
        let name = name.into();
        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(&name) {
            return downcast(&name, existing.as_ref());
        }
        self.insert_locked(&mut channels, name, channel.clone());
        Ok(channel)
    }

    /// Looks up a channel by name and payload type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Channel<T>, BrokerError> {
        let channels = self.channels.read();
        let raw = channels.get(name).ok_or_else(|| not_found(name))?;
        downcast(name, raw.as_ref())
    }

    /// Subscribes a callback to the named channel.
    pub fn subscribe(
        &self,
        name: &str,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<SubscriberId, BrokerError> {
        self.subscribe_callback(name, Arc::new(callback))
    }

    /// Subscribes an already shared callback to the named channel.
    pub fn subscribe_callback(
        &self,
        name: &str,
        callback: Callback,
    ) -> Result<SubscriberId, BrokerError> {
        let id = self.resolve(name)?.subscribe_callback(callback);
        self.event_sender
            .send(BrokerEvent::Subscribed {
                name: name.to_string(),
                id,
            })
            .ok();
        Ok(id)
    }

    /// Subscribes a callback that receives the named channel's value when it
    /// runs. Fails with `PayloadMismatch` if the channel does not carry `T`.
    pub fn subscribe_value<T: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
        callback: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<SubscriberId, BrokerError> {
        let channel = self.get::<T>(name)?;
        self.subscribe_callback(name, channel.value_callback(callback))
    }

    /// Removes a subscription from the named channel.
    ///
    /// Returns `Ok(false)` if the channel exists but the subscription does not.
    pub fn unsubscribe(&self, name: &str, id: SubscriberId) -> Result<bool, BrokerError> {
        let removed = self.resolve(name)?.unsubscribe(id);
        if removed {
            self.announce_unsubscribed(name, id);
        } else {
            debug!(channel = name, ?id, "unsubscribe of unknown subscriber ignored");
        }
        Ok(removed)
    }

    /// Removes the first subscription of this exact callback from the named
    /// channel, matching by `Arc` identity.
    ///
    /// Returns `Ok(false)` if the channel exists but the callback is not
    /// subscribed to it.
    pub fn unsubscribe_callback(&self, name: &str, callback: &Callback) -> Result<bool, BrokerError> {
        match self.resolve(name)?.unsubscribe_callback(callback) {
            Some(id) => {
                self.announce_unsubscribed(name, id);
                Ok(true)
            }
            None => {
                debug!(channel = name, "unsubscribe of unknown callback ignored");
                Ok(false)
            }
        }
    }

    /// Raises the named channel without touching its value.
    pub fn raise(&self, name: &str) -> Result<Option<BatchId>, BrokerError> {
        Ok(self.resolve(name)?.raise())
    }

    /// Discards every registered channel.
    ///
    /// Handles held elsewhere keep working as standalone channels but are no
    /// longer reachable by name, and later `set_dispatcher` calls skip them.
    pub fn reset(&self) {
        let dropped = {
            let mut channels = self.channels.write();
            let dropped = channels.len();
            channels.clear();
            dropped
        };
        info!(dropped, "broker registry reset");
        self.event_sender
            .send(BrokerEvent::RegistryReset { dropped })
            .ok();
    }

    /// Records the broker-wide dispatcher and installs it on every
    /// registered channel. Channels added later receive it on `add`.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatch>) {
        let channels = self.channels.read();
        *self.dispatcher.write() = Some(dispatcher.clone());
        for channel in channels.values() {
            channel.set_dispatcher(dispatcher.clone());
        }
        info!(channels = channels.len(), "dispatcher installed");
        self.event_sender
            .send(BrokerEvent::DispatcherInstalled {
                channels: channels.len(),
            })
            .ok();
    }
}

// Introspection.
impl Broker {
    /// Whether a broker-wide dispatcher has been configured.
    pub fn is_bound(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    /// Whether a channel is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    /// Registered channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// The payload type name of the named channel, e.g. `"bool"`.
    pub fn payload_type(&self, name: &str) -> Result<&'static str, BrokerError> {
        Ok(self.resolve(name)?.payload_type())
    }

    /// Number of subscriptions on the named channel.
    pub fn subscriber_count(&self, name: &str) -> Result<usize, BrokerError> {
        Ok(self.resolve(name)?.subscriber_count())
    }

    /// Subscribes to the `BrokerEvent` stream.
    pub fn subscribe_broker_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_sender.subscribe()
    }
}

// Internal helpers.
impl Broker {
    fn insert_locked<T: Send + Sync + 'static>(
        &self,
        channels: &mut ChannelMap,
        name: String,
        channel: Channel<T>,
    ) {
        if let Some(dispatcher) = self.dispatcher.read().clone() {
            channel.set_dispatcher(dispatcher);
        }
        let payload = type_name::<T>();
        info!(channel = %name, payload, "channel added");
        self.event_sender
            .send(BrokerEvent::ChannelAdded {
                name: name.clone(),
                payload,
            })
            .ok();
        channels.insert(name, Arc::new(channel));
    }

    fn announce_unsubscribed(&self, name: &str, id: SubscriberId) {
        self.event_sender
            .send(BrokerEvent::Unsubscribed {
                name: name.to_string(),
                id,
            })
            .ok();
    }

    /// Clones the channel out so the registry lock is released before use.
    fn resolve(&self, name: &str) -> Result<Arc<dyn RawChannel>, BrokerError> {
        self.channels
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(name: &str) -> BrokerError {
    BrokerError::ChannelNotFound {
        name: name.to_string(),
    }
}

fn downcast<T: Send + Sync + 'static>(
    name: &str,
    raw: &dyn RawChannel,
) -> Result<Channel<T>, BrokerError> {
    raw.as_any()
        .downcast_ref::<Channel<T>>()
        .cloned()
        .ok_or_else(|| BrokerError::PayloadMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
            found: raw.payload_type(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BasicChannel, BoolChannel};
    use crate::dispatch::{DispatchPolicy, TickDispatcher};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_then_get_returns_the_same_channel() {
        let broker = Broker::new();
        let channel = BoolChannel::default();
        broker.add("exampleEvent", channel.clone()).unwrap();
        let fetched: BoolChannel = broker.get("exampleEvent").unwrap();
        assert!(fetched.ptr_eq(&channel));
    }

    #[test]
    fn duplicate_add_fails_and_keeps_the_original() {
        let broker = Broker::new();
        let original = BoolChannel::new(true);
        broker.add("exampleEvent", original.clone()).unwrap();

        let err = broker
            .add("exampleEvent", BoolChannel::new(false))
            .unwrap_err();
        assert_eq!(
            err,
            BrokerError::ChannelExists {
                name: "exampleEvent".into()
            }
        );
        let fetched: BoolChannel = broker.get("exampleEvent").unwrap();
        assert!(fetched.ptr_eq(&original));
        assert!(fetched.value());
    }

    #[test]
    fn get_or_add_keeps_the_first_registration() {
        let broker = Broker::new();
        let first = broker
            .get_or_add("exampleEvent", BoolChannel::default())
            .unwrap();
        let second = broker
            .get_or_add("exampleEvent", BoolChannel::default())
            .unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn wrong_payload_type_is_reported() {
        let broker = Broker::new();
        broker.add("doorOpened", BasicChannel::default()).unwrap();
        let err = broker.get::<bool>("doorOpened").unwrap_err();
        assert_eq!(
            err,
            BrokerError::PayloadMismatch {
                name: "doorOpened".into(),
                expected: "bool",
                found: "()",
            }
        );
        assert!(broker
            .get_or_add("doorOpened", BoolChannel::default())
            .is_err());
    }

    #[test]
    fn name_operations_fail_for_unknown_channels() {
        let broker = Broker::new();
        let not_found = BrokerError::ChannelNotFound {
            name: "ghost".into(),
        };
        assert_eq!(broker.get::<()>("ghost").unwrap_err(), not_found);
        assert_eq!(broker.subscribe("ghost", || {}).unwrap_err(), not_found);
        assert_eq!(
            broker
                .unsubscribe("ghost", SubscriberId::default())
                .unwrap_err(),
            not_found
        );
        assert_eq!(broker.raise("ghost").unwrap_err(), not_found);
    }

    #[test]
    fn unsubscribe_callback_removes_by_identity() {
        let broker = Broker::new();
        broker.set_dispatcher(TickDispatcher::new(DispatchPolicy::Immediate).as_dispatch());
        broker.add("doorOpened", BasicChannel::default()).unwrap();
        let mut events = broker.subscribe_broker_events();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let callback: Callback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = broker
            .subscribe_callback("doorOpened", callback.clone())
            .unwrap();

        assert!(broker.unsubscribe_callback("doorOpened", &callback).unwrap());
        broker.raise("doorOpened").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!broker.unsubscribe_callback("doorOpened", &callback).unwrap());
        assert_eq!(
            broker.unsubscribe_callback("ghost", &callback).unwrap_err(),
            not_found("ghost")
        );

        assert!(matches!(events.try_recv(), Ok(BrokerEvent::Subscribed { .. })));
        match events.try_recv() {
            Ok(BrokerEvent::Unsubscribed { name, id: removed }) => {
                assert_eq!(name, "doorOpened");
                assert_eq!(removed, id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn value_subscriptions_go_through_the_registry() {
        let broker = Broker::new();
        broker.set_dispatcher(TickDispatcher::new(DispatchPolicy::Immediate).as_dispatch());
        broker.add("exampleEvent", BoolChannel::default()).unwrap();
        broker.add("doorOpened", BasicChannel::default()).unwrap();
        let mut events = broker.subscribe_broker_events();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker
            .subscribe_value("exampleEvent", move |value: bool| sink.lock().push(value))
            .unwrap();
        assert!(matches!(events.try_recv(), Ok(BrokerEvent::Subscribed { .. })));

        broker.get::<bool>("exampleEvent").unwrap().update_value(true);
        assert_eq!(*seen.lock(), vec![true]);

        assert!(matches!(
            broker.subscribe_value("doorOpened", |_: bool| {}),
            Err(BrokerError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn reset_orphans_registered_channels() {
        let broker = Broker::new();
        let channel = BasicChannel::default();
        broker.add("doorOpened", channel.clone()).unwrap();
        broker.reset();

        assert!(broker.is_empty());
        assert!(matches!(
            broker.get::<()>("doorOpened"),
            Err(BrokerError::ChannelNotFound { .. })
        ));

        broker.set_dispatcher(TickDispatcher::new(DispatchPolicy::Immediate).as_dispatch());
        assert!(!channel.is_bound());
    }

    #[test]
    fn dispatcher_reaches_existing_and_future_channels() {
        let broker = Broker::new();
        let early = BasicChannel::default();
        broker.add("early", early.clone()).unwrap();
        assert!(!early.is_bound());

        broker.set_dispatcher(TickDispatcher::new(DispatchPolicy::Batched).as_dispatch());
        let late = BasicChannel::default();
        broker.add("late", late.clone()).unwrap();

        assert!(broker.is_bound());
        assert!(early.is_bound());
        assert!(late.is_bound());
    }

    #[test]
    fn callbacks_may_call_back_into_the_broker() {
        let broker = Broker::new();
        broker.set_dispatcher(TickDispatcher::new(DispatchPolicy::Immediate).as_dispatch());
        broker.add("spawner", BasicChannel::default()).unwrap();

        let inner = broker.clone();
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        broker
            .subscribe("spawner", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                inner
                    .add(format!("spawned-{n}"), BasicChannel::default())
                    .unwrap();
            })
            .unwrap();

        broker.raise("spawner").unwrap();
        broker.raise("spawner").unwrap();
        assert_eq!(broker.names(), vec!["spawned-0", "spawned-1", "spawner"]);
    }

    #[test]
    fn declared_channels_are_registered() {
        let config = BrokerConfig {
            channels: vec![
                ChannelConfig {
                    name: "exampleEvent".into(),
                    payload: PayloadKind::Bool,
                    initial: true,
                },
                ChannelConfig {
                    name: "doorOpened".into(),
                    payload: PayloadKind::Unit,
                    initial: false,
                },
            ],
            ..Default::default()
        };
        let broker = Broker::from_config(&config).unwrap();
        assert!(broker.get::<bool>("exampleEvent").unwrap().value());
        assert_eq!(broker.payload_type("doorOpened").unwrap(), "()");

        let mut duplicated = config.clone();
        duplicated.channels.push(duplicated.channels[0].clone());
        assert!(matches!(
            Broker::from_config(&duplicated),
            Err(BrokerError::ChannelExists { .. })
        ));
    }

    #[test]
    fn registry_changes_are_broadcast() {
        let broker = Broker::new();
        let mut events = broker.subscribe_broker_events();
        broker.add("doorOpened", BasicChannel::default()).unwrap();
        let id = broker.subscribe("doorOpened", || {}).unwrap();
        broker.unsubscribe("doorOpened", id).unwrap();
        broker.reset();

        assert!(matches!(
            events.try_recv(),
            Ok(BrokerEvent::ChannelAdded { payload: "()", .. })
        ));
        assert!(matches!(events.try_recv(), Ok(BrokerEvent::Subscribed { .. })));
        assert!(matches!(events.try_recv(), Ok(BrokerEvent::Unsubscribed { .. })));
        assert!(matches!(
            events.try_recv(),
            Ok(BrokerEvent::RegistryReset { dropped: 1 })
        ));
    }
}
