//! Defines the public event types broadcast by the broker and its engine.
//!
//! These are observational streams: nothing inside the broker depends on
//! anyone listening. Subscribe through `Broker::subscribe_broker_events` or
//! `BrokerEngine::subscribe_system_events`.

use crate::common::SubscriberId;
use crate::dispatch::TickReport;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Changes to the broker's registry.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A channel was registered under `name`.
    ChannelAdded { name: String, payload: &'static str },
    /// A callback was subscribed through the broker.
    Subscribed { name: String, id: SubscriberId },
    /// A subscription was removed through the broker.
    Unsubscribed { name: String, id: SubscriberId },
    /// A dispatcher was installed on every registered channel.
    DispatcherInstalled { channels: usize },
    /// The registry was cleared.
    RegistryReset { dropped: usize },
}

/// Events related to the lifecycle of the engine itself.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// Fired once when the engine's `run` loop begins.
    EngineStarted {
        timestamp: Instant,
        started_at: DateTime<Utc>,
    },
    /// Fired once when the engine's `run` loop is about to exit.
    EngineShutdown,
    /// Fired after a tick that executed at least one callback.
    TickDrained { tick_count: u64, report: TickReport },
}
