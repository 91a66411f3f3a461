use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::{MessageStore, StoreOutcome};
use crate::types::{MessageStoreRecord, UNAVAILABLE_MESSAGE_ID};

/// Message store kept in memory, with switches to refuse or fail inserts
#[derive(Default)]
pub struct MemoryMessageStore {
    records: Mutex<Vec<MessageStoreRecord>>,
    behavior: Mutex<Behavior>,
}

#[derive(Default)]
struct Behavior {
    refuse_all: bool,
    refuse_next: usize,
    fail_next: usize,
    attempts: usize,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every insert while set
    pub fn set_refuse_all(&self, refuse: bool) {
        self.behavior.lock().refuse_all = refuse;
    }

    /// Refuse the next `count` inserts
    pub fn refuse_next(&self, count: usize) {
        self.behavior.lock().refuse_next = count;
    }

    /// Fail the next `count` inserts with an error
    pub fn fail_next(&self, count: usize) {
        self.behavior.lock().fail_next = count;
    }

    pub fn records(&self) -> Vec<MessageStoreRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Insert attempts seen so far, successful or not
    pub fn attempts(&self) -> usize {
        self.behavior.lock().attempts
    }

    pub fn count_for(&self, broker_message_id: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.broker_message_id == broker_message_id)
            .count()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, record: &MessageStoreRecord) -> Result<StoreOutcome> {
        {
            let mut behavior = self.behavior.lock();
            behavior.attempts += 1;
            if behavior.fail_next > 0 {
                behavior.fail_next -= 1;
                return Err(Error::Store("memory store unavailable".to_string()));
            }
            if behavior.refuse_next > 0 {
                behavior.refuse_next -= 1;
                return Ok(StoreOutcome::Refused);
            }
            if behavior.refuse_all {
                return Ok(StoreOutcome::Refused);
            }
        }

        let mut records = self.records.lock();
        let duplicate = record.broker_message_id != UNAVAILABLE_MESSAGE_ID
            && records
                .iter()
                .any(|r| r.broker_message_id == record.broker_message_id);
        if duplicate {
            return Ok(StoreOutcome::Duplicate);
        }
        records.push(record.clone());
        Ok(StoreOutcome::Stored)
    }

    async fn contains(&self, broker_message_id: &str) -> Result<bool> {
        Ok(broker_message_id != UNAVAILABLE_MESSAGE_ID && self.count_for(broker_message_id) > 0)
    }

    fn table_name(&self) -> Option<&str> {
        Some("memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageEnvelope, MessageProperties};

    fn record(id: &str) -> MessageStoreRecord {
        let envelope = MessageEnvelope {
            message_id: id.to_string(),
            header: MessageProperties::new(),
            body: "b".to_string(),
        };
        MessageStoreRecord::new(&envelope, "Q1", "c")
    }

    #[tokio::test]
    async fn test_duplicate_broker_id_is_reported() {
        let store = MemoryMessageStore::new();
        assert_eq!(store.insert(&record("ID:1")).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.insert(&record("ID:1")).await.unwrap(), StoreOutcome::Duplicate);
        assert!(store.contains("ID:1").await.unwrap());
        assert!(!store.contains("ID:2").await.unwrap());

        let unavailable = record(UNAVAILABLE_MESSAGE_ID);
        assert_eq!(store.insert(&unavailable).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.insert(&unavailable).await.unwrap(), StoreOutcome::Stored);
        assert!(!store.contains(UNAVAILABLE_MESSAGE_ID).await.unwrap());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_programmed_failures() {
        let store = MemoryMessageStore::new();
        store.fail_next(1);
        store.refuse_next(1);

        assert!(store.insert(&record("ID:1")).await.is_err());
        assert_eq!(store.insert(&record("ID:1")).await.unwrap(), StoreOutcome::Refused);
        assert_eq!(store.insert(&record("ID:1")).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.attempts(), 3);
        assert_eq!(store.count_for("ID:1"), 1);
    }
}
