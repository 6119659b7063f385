//! Defines all configuration structures for the broker and its engine.
//!
//! These structs are deserialized with `serde` from a layered `config`
//! source: an optional TOML file overridden by `HYPERBROKER__*` environment
//! variables. Every field has a default, so an empty source is a valid
//! configuration.

use crate::dispatch::DispatchPolicy;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `HYPERBROKER__DISPATCH_POLICY=batched`.
pub const ENV_PREFIX: &str = "HYPERBROKER";

/// The top-level configuration for a `Broker` and its `BrokerEngine`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// The tick speed of the master `SystemClock`.
    pub resolution: ClockResolution,

    /// How raised batches are spread over ticks.
    pub dispatch_policy: DispatchPolicy,

    /// Buffer size of the broadcast event streams.
    pub event_capacity: usize,

    /// Channels registered when the broker is built from this config.
    pub channels: Vec<ChannelConfig>,
}

/// Defines the operational speed of the `SystemClock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockResolution {
    /// ~60 ticks per second, one per rendered frame.
    High,
    /// ~30 ticks per second.
    #[default]
    Medium,
    /// ~1 tick per second. Handy for watching dispatch by eye.
    Low,
    /// A user-defined speed in ticks per second.
    Custom { ticks_per_second: u64 },
}

impl ClockResolution {
    /// Time between two ticks. A custom rate of zero is treated as one, and
    /// the period never drops below one nanosecond.
    pub fn tick_period(&self) -> Duration {
        let ticks_per_second = match self {
            ClockResolution::High => 60,
            ClockResolution::Medium => 30,
            ClockResolution::Low => 1,
            ClockResolution::Custom { ticks_per_second } => (*ticks_per_second).max(1),
        };
        Duration::from_nanos((1_000_000_000 / ticks_per_second).max(1))
    }
}

/// The payload a declared channel carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    #[default]
    Unit,
    Bool,
}

/// A channel declared up front in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    /// Registry key.
    pub name: String,
    #[serde(default)]
    pub payload: PayloadKind,
    /// Starting value for `bool` channels. Ignored for `unit` channels.
    #[serde(default)]
    pub initial: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            resolution: ClockResolution::default(),
            dispatch_policy: DispatchPolicy::default(),
            event_capacity: default_event_capacity(),
            channels: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Loads the configuration from an optional TOML file, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Parses a configuration from TOML text, without environment overrides.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

// --- Default value functions for serde ---

fn default_event_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_yields_defaults() {
        let config = BrokerConfig::from_toml("").unwrap();
        assert_eq!(config.resolution, ClockResolution::Medium);
        assert_eq!(config.dispatch_policy, DispatchPolicy::OnePerTick);
        assert_eq!(config.event_capacity, 64);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn parses_a_full_document() {
        let config = BrokerConfig::from_toml(
            r#"
            resolution = { custom = { ticks_per_second = 120 } }
            dispatch_policy = "batched"
            event_capacity = 16

            [[channels]]
            name = "exampleEvent"
            payload = "bool"
            initial = true

            [[channels]]
            name = "doorOpened"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.resolution,
            ClockResolution::Custom {
                ticks_per_second: 120
            }
        );
        assert_eq!(config.dispatch_policy, DispatchPolicy::Batched);
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].payload, PayloadKind::Bool);
        assert!(config.channels[0].initial);
        assert_eq!(config.channels[1].payload, PayloadKind::Unit);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        assert!(BrokerConfig::from_toml(r#"dispatch_policy = "eventually""#).is_err());
    }

    #[test]
    fn tick_periods() {
        assert_eq!(ClockResolution::Low.tick_period(), Duration::from_secs(1));
        assert_eq!(
            ClockResolution::Custom { ticks_per_second: 0 }.tick_period(),
            Duration::from_secs(1)
        );
        assert!(ClockResolution::High.tick_period() < ClockResolution::Medium.tick_period());
    }

    #[test]
    fn extreme_custom_rates_keep_a_non_zero_period() {
        for ticks_per_second in [1_000_000_001, 2_000_000_000, u64::MAX] {
            let period = ClockResolution::Custom { ticks_per_second }.tick_period();
            assert_eq!(period, Duration::from_nanos(1));
        }
        let config = BrokerConfig::from_toml(
            "resolution = { custom = { ticks_per_second = 2000000000 } }",
        )
        .unwrap();
        assert!(!config.resolution.tick_period().is_zero());
    }
}
