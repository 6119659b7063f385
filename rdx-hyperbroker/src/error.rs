//! Error types produced by the broker.
//!
//! Name resolution failures are returned to the caller. A raise on a channel
//! without a dispatcher is never returned; it is only logged, and
//! [`BrokerError::MissingDispatcher`] exists so that log line carries the
//! same label as every other broker failure.

use thiserror::Error;

/// # Errors produced by the broker and its channels.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// A channel is already registered under this name.
    #[error("channel '{name}' already exists")]
    ChannelExists {
        /// The contested channel name.
        name: String,
    },

    /// No channel is registered under this name.
    #[error("channel '{name}' does not exist")]
    ChannelNotFound {
        /// The name that failed to resolve.
        name: String,
    },

    /// The channel exists but carries a different payload type.
    #[error("channel '{name}' carries {found}, not {expected}")]
    PayloadMismatch {
        /// The channel name.
        name: String,
        /// The payload type the caller asked for.
        expected: &'static str,
        /// The payload type the registered channel actually carries.
        found: &'static str,
    },

    /// A channel was raised before any dispatcher was installed on it.
    #[error("raise on {payload} channel with no dispatcher installed")]
    MissingDispatcher {
        /// The payload type of the unbound channel.
        payload: &'static str,
    },
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use hyperbroker::error::BrokerError;
    ///
    /// let err = BrokerError::ChannelNotFound { name: "door".into() };
    /// assert_eq!(err.as_label(), "channel_not_found");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::ChannelExists { .. } => "channel_exists",
            BrokerError::ChannelNotFound { .. } => "channel_not_found",
            BrokerError::PayloadMismatch { .. } => "payload_mismatch",
            BrokerError::MissingDispatcher { .. } => "missing_dispatcher",
        }
    }

    /// The channel name this error refers to, when there is one.
    pub fn channel_name(&self) -> Option<&str> {
        match self {
            BrokerError::ChannelExists { name }
            | BrokerError::ChannelNotFound { name }
            | BrokerError::PayloadMismatch { name, .. } => Some(name),
            BrokerError::MissingDispatcher { .. } => None,
        }
    }
}
