//! Broker session adapter
//!
//! The broker is a queueing system hosted on top of a database connection:
//! a broker connection wraps a database connection, sessions are opened
//! over it, and receivers are created from sessions for one queue and an
//! optional [`Selector`].
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryBroker`]: in-process queues, used by tests and embedders
//! - [`PgBroker`]: a PostgreSQL queue table accessed through pooled connections

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{OutgoingMessage, RawMessage};

pub mod memory;
pub mod postgres;
pub mod selector;

pub use memory::{MemoryBroker, MemoryConnection};
pub use postgres::{PgBroker, PgBrokerConfig};
pub use selector::Selector;

/// How a session acknowledges the messages it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// A message is consumed as soon as it is handed to the receiver
    AutoAcknowledge,

    /// A message stays owned by the session until acknowledged or recovered
    ClientAcknowledge,

    /// Sends join the unit of work already open on the connection
    Transacted,
}

/// Factory for broker sessions over database-backed connections
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;
    type Session: BrokerSession;

    async fn open_session(
        &self,
        connection: &Self::Connection,
        mode: SessionMode,
    ) -> Result<Self::Session>;

    /// Identity of a connection; clones of one connection share it
    fn connection_id(&self, connection: &Self::Connection) -> u64;
}

/// One broker session: the unit of acknowledgment and recovery
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    type Receiver: MessageReceiver;

    fn mode(&self) -> SessionMode;

    /// Create a receiver for `queue`, optionally filtered by a selector
    async fn create_receiver(
        &self,
        queue: &str,
        selector: Option<&Selector>,
    ) -> Result<Self::Receiver>;

    /// Count messages currently available on `queue` without consuming them
    async fn browse_count(&self, queue: &str, selector: Option<&Selector>) -> Result<u64>;

    /// Send a message; returns the broker-assigned message id
    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String>;

    async fn acknowledge(&self, message: &RawMessage) -> Result<()>;

    /// Return every unacknowledged message of this session to its queue
    async fn recover(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>);

    /// Close the session and wake any receiver blocked on it. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Receives messages from one queue
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    /// Wait for the next message; `None` once the session is closed
    async fn receive(&self) -> Result<Option<RawMessage>>;

    /// Take the next message if one is available right now
    async fn receive_no_wait(&self) -> Result<Option<RawMessage>>;

    /// Switch to push delivery: the broker calls `listener` from its own
    /// task for every message until the session closes
    fn set_message_listener(&self, listener: Arc<dyn MessageListener>) -> Result<()>;
}

/// Push-mode delivery target
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: RawMessage);
}

/// Notified when a session fails outside of a caller's request
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: Error);
}

/// Parse an optional selector string, treating blank text as no selector
pub fn parse_selector(selector: Option<&str>) -> Result<Option<Selector>> {
    match selector.map(str::trim) {
        Some(text) if !text.is_empty() => Selector::parse(text).map(Some),
        _ => Ok(None),
    }
}
