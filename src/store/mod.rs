//! Durable message store written before client acknowledgment
//!
//! A consumer in client-acknowledge mode inserts every dequeued message
//! here first and acknowledges the broker only when the message is in the
//! store. A refused insert and `Err(_)` are treated alike: the message is
//! recovered on the broker and redelivered later. A duplicate means an
//! earlier delivery attempt stored the message but never acknowledged it.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::MessageStoreRecord;

pub mod memory;
pub mod postgres;
pub mod throttling;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;
pub use throttling::{Outage, Quota, StaticThrottlingData, ThrottlingData, ThrottlingStore};

/// Default message store table name
pub const DEFAULT_STORE_TABLE: &str = "jms_msg_store";

/// Result of a message store insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The record was written
    Stored,

    /// A record with the same broker message id is already stored
    Duplicate,

    /// The store declined the record; nothing was written
    Refused,
}

impl StoreOutcome {
    /// Whether the message is now held by the store
    pub fn is_stored(self) -> bool {
        matches!(self, StoreOutcome::Stored | StoreOutcome::Duplicate)
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a record
    async fn insert(&self, record: &MessageStoreRecord) -> Result<StoreOutcome>;

    /// Whether a record with this broker message id is already stored
    async fn contains(&self, _broker_message_id: &str) -> Result<bool> {
        Ok(false)
    }

    /// Table or collection name exposed to the pipeline context
    fn table_name(&self) -> Option<&str> {
        None
    }
}
