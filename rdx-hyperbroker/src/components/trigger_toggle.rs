//! A component that swaps its material whenever a shared trigger fires.
//!
//! Every `TriggerToggle` woken on the same broker shares one bool channel.
//! When any of them is entered by a collider it publishes its own flag on the
//! channel; every toggle (the publisher included) then reacts by inverting
//! the published value into its flag and picking its primary material for
//! `true` or its secondary material for `false`.

use crate::broker::Broker;
use crate::channel::BoolChannel;
use crate::common::{BatchId, SubscriberId};
use crate::error::BrokerError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The channel toggles share unless told otherwise.
pub const EXAMPLE_CHANNEL: &str = "exampleEvent";

/// A named material a renderer can display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Material(String);

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct ToggleState {
    flag: bool,
    material: Option<Material>,
    reactions: u32,
}

impl ToggleState {
    fn react(&mut self, value: bool, primary: &Material, secondary: &Material) {
        self.flag = !value;
        let chosen = if value { primary } else { secondary };
        self.material = Some(chosen.clone());
        self.reactions += 1;
    }
}

/// The example consumer component.
pub struct TriggerToggle {
    label: String,
    channel_name: String,
    primary: Material,
    secondary: Material,
    state: Arc<Mutex<ToggleState>>,
    binding: Option<(BoolChannel, SubscriberId)>,
}

impl TriggerToggle {
    /// Creates a sleeping toggle. Call [`TriggerToggle::awake`] before use.
    pub fn new(label: impl Into<String>, flag: bool, primary: Material, secondary: Material) -> Self {
        Self {
            label: label.into(),
            channel_name: EXAMPLE_CHANNEL.to_string(),
            primary,
            secondary,
            state: Arc::new(Mutex::new(ToggleState {
                flag,
                material: None,
                reactions: 0,
            })),
            binding: None,
        }
    }

    /// Shares a different channel than [`EXAMPLE_CHANNEL`].
    pub fn on_channel(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    /// Resolves (or creates) the shared channel and subscribes the reaction.
    ///
    /// Waking an already awake toggle first releases its old subscription.
    /// The reaction holds only weak references, so it never keeps the
    /// component or the channel alive.
    pub fn awake(&mut self, broker: &Broker) -> Result<(), BrokerError> {
        self.sleep();
        let channel = broker.get_or_add(self.channel_name.as_str(), BoolChannel::default())?;

        let state = Arc::downgrade(&self.state);
        let label = self.label.clone();
        let primary = self.primary.clone();
        let secondary = self.secondary.clone();
        let id = channel.subscribe_value(move |value| {
            let Some(state) = state.upgrade() else {
                return;
            };
            state.lock().react(value, &primary, &secondary);
            debug!(component = %label, value, "trigger event callback");
        });

        debug!(component = %self.label, channel = %self.channel_name, ?id, "awake");
        self.binding = Some((channel, id));
        Ok(())
    }

    /// Host collision hook: publishes this toggle's flag on the channel.
    ///
    /// Returns the queued batch, if the dispatcher deferred it.
    pub fn on_trigger_enter(&self, other: &str) -> Option<BatchId> {
        info!(component = %self.label, other, "on trigger enter");
        let Some((channel, _)) = &self.binding else {
            warn!(component = %self.label, "trigger entered before awake; ignored");
            return None;
        };
        let flag = self.state.lock().flag;
        channel.update_value(flag)
    }

    /// Releases the subscription. Returns `false` if the toggle was asleep.
    pub fn sleep(&mut self) -> bool {
        match self.binding.take() {
            Some((channel, id)) => channel.unsubscribe(id),
            None => false,
        }
    }

    pub fn is_awake(&self) -> bool {
        self.binding.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The flag this toggle will publish on its next trigger.
    pub fn flag(&self) -> bool {
        self.state.lock().flag
    }

    /// The material currently shown, `None` until the first reaction.
    pub fn material(&self) -> Option<Material> {
        self.state.lock().material.clone()
    }

    /// How many times the reaction has run.
    pub fn reactions(&self) -> u32 {
        self.state.lock().reactions
    }
}

impl Drop for TriggerToggle {
    fn drop(&mut self) {
        self.sleep();
    }
}
