//! Contains example components built on top of the broker.
//!
//! Components follow a host runtime's lifecycle: they resolve their channels
//! when they wake up, react to host events such as collision triggers, and
//! release their subscriptions when they go to sleep or are dropped.

pub mod trigger_toggle;
