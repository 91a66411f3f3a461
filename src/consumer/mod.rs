//! Queue consumers
//!
//! This module provides:
//! - `Consumer`: registration, delivery loops, reconnect and disconnect
//! - `ConsumerConfig`: queue, selector, delivery and acknowledge modes
//! - `DeliveryOutcome`: what the delivery protocol did with one message
//!
//! # Delivery modes
//!
//! 1. **Push**: the broker calls the consumer from its own delivery task;
//!    the consumer is also the session's exception listener
//! 2. **Pull**: the consumer runs one receive loop task per session
//! 3. **Poll**: a timer drains a bounded snapshot of the queue per tick
//!
//! # Lifecycle
//!
//! `Unregistered → Registering → Active → Reconnecting → Active`, and
//! `Disconnecting → Disconnected` from any registered state. A broker
//! failure on an active consumer validates the held connection, resumes on
//! it when it is still usable, otherwise waits `reconnect_backoff` and
//! acquires a fresh one, at most `max_reconnect_attempts` times.

pub mod config;
#[allow(clippy::module_inception)]
pub mod consumer;
pub mod delivery;
pub mod poll;

pub use config::{AckMode, ConsumerConfig, DeliveryMode};
pub use consumer::{Consumer, ConsumerResources, ConsumerState};
pub use delivery::DeliveryOutcome;
