//! # Hyperbroker
//!
//! A tick-driven, in-process event channel broker for Rust.
//!
//! Hyperbroker lets decoupled components notify each other through named
//! channels. A component resolves a channel by name, subscribes a callback,
//! and later raises the channel (or updates its value). Raised callbacks are
//! not run on the spot: they are queued and executed by a dispatcher that the
//! host loop ticks, one step per frame.
//!
//! ## Core Concepts
//!
//! - **Channel**: An ordered list of zero-argument callbacks plus a stored
//!   value. `Channel<()>` is a plain signal, `Channel<bool>` carries a flag.
//! - **Broker**: A name-keyed registry of channels. It is an explicit context
//!   object, cloned into whoever needs it, never a global.
//! - **Dispatcher**: Receives a snapshot of subscribers on every raise. The
//!   `TickDispatcher` queues it and runs it immediately, one callback per
//!   tick, or one batch per tick depending on its `DispatchPolicy`.
//! - **Engine**: Ticks the dispatcher from a `SystemClock`, standing in for a
//!   host runtime's frame loop.
//!
//! ## Example Usage
//!
//! ```rust
//! use hyperbroker::prelude::*;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let broker = Broker::new();
//! let dispatcher = TickDispatcher::new(DispatchPolicy::OnePerTick);
//! broker.set_dispatcher(dispatcher.as_dispatch());
//!
//! let channel = broker.get_or_add("exampleEvent", BoolChannel::default())?;
//! let seen = Arc::new(AtomicBool::new(false));
//! let sink = seen.clone();
//! channel.subscribe_value(move |value| sink.store(value, Ordering::SeqCst));
//!
//! channel.update_value(true);
//! assert!(!seen.load(Ordering::SeqCst));
//! dispatcher.tick();
//! assert!(seen.load(Ordering::SeqCst));
//! # Ok::<(), hyperbroker::error::BrokerError>(())
//! ```

pub const ENGINE_NAME: &str = "Hyper Broker";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod broker;
pub mod channel;
pub mod common;
pub mod components;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod time;

/// A prelude module for easy importing of the most common Hyperbroker types.
pub mod prelude {
    pub use crate::broker::Broker;
    pub use crate::channel::{BasicChannel, BoolChannel, Channel};
    pub use crate::common::{BatchId, Callback, SubscriberId};
    pub use crate::config::{BrokerConfig, ClockResolution};
    pub use crate::dispatch::{Dispatch, DispatchPolicy, TickDispatcher, TickReport};
    pub use crate::engine::BrokerEngine;
    pub use crate::error::BrokerError;
    pub use crate::events::{BrokerEvent, SystemEvent};
}
