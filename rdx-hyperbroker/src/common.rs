//! Contains common, primitive types shared across the broker.
//!
//! This module defines the key types used to identify subscriptions and
//! pending dispatch batches, along with the callback type every channel
//! stores. Using distinct key types keeps a subscriber handle from being
//! mistaken for a batch handle.

use slotmap::new_key_type;
use std::sync::Arc;

new_key_type! {
    /// Uniquely and safely identifies a subscription within a single channel.
    ///
    /// This key is returned when a callback is subscribed. It is never reused
    /// by the channel that issued it, so a stale id can never remove a newer
    /// subscriber. Ids are scoped to their channel.
    pub struct SubscriberId;

    /// Identifies a batch of callbacks queued on a `TickDispatcher`.
    ///
    /// A pending batch can be cancelled with this id before it is drained.
    pub struct BatchId;
}

/// A zero-argument subscriber callback.
///
/// Callbacks are shared (`Arc`) so a raise can snapshot the subscriber list
/// cheaply; two subscriptions are "the same callback" when their `Arc`s
/// point at the same allocation.
pub type Callback = Arc<dyn Fn() + Send + Sync>;
