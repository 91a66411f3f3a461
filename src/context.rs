//! Per-message context handed to the downstream pipeline
//!
//! A fresh [`RequestContext`] is built for every dequeued message and
//! dropped when the pipeline call returns, so nothing one message sets is
//! visible to the next message processed on the same worker.

use std::collections::BTreeMap;

use crate::types::UNAVAILABLE_MESSAGE_ID;

/// Well-known keys and free-form entries for one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub message_id: String,
    pub queue_name: Option<String>,
    pub message_store_table: Option<String>,
    pub customer_id: Option<String>,
    pub interface_version: Option<String>,
    pub supplier: Option<String>,
    pub transaction: Option<String>,
    pub channel_name: Option<String>,
    pub channel_name_base: Option<String>,
    extras: BTreeMap<String, String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            message_id: UNAVAILABLE_MESSAGE_ID.to_string(),
            queue_name: None,
            message_store_table: None,
            customer_id: None,
            interface_version: None,
            supplier: None,
            transaction: None,
            channel_name: None,
            channel_name_base: None,
            extras: BTreeMap::new(),
        }
    }
}

impl RequestContext {
    /// Context for one message dequeued from `queue_name`
    pub fn for_message(message_id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            queue_name: Some(queue_name.into()),
            ..Default::default()
        }
    }

    /// Set the message store table (builder pattern)
    pub fn with_message_store_table(mut self, table: impl Into<String>) -> Self {
        self.message_store_table = Some(table.into());
        self
    }

    /// Set the customer id (builder pattern)
    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extras.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn extras(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extras.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_message_id_is_unavailable() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.message_id, "UNAVAILABLE");
        assert!(ctx.queue_name.is_none());
    }

    #[test]
    fn test_for_message_and_extras() {
        let mut ctx = RequestContext::for_message("ID:7", "Q1").with_message_store_table("store");
        ctx.set("soa_callback", "http://gw/soa");

        assert_eq!(ctx.queue_name.as_deref(), Some("Q1"));
        assert_eq!(ctx.message_store_table.as_deref(), Some("store"));
        assert_eq!(ctx.get("soa_callback"), Some("http://gw/soa"));
        assert_eq!(ctx.extras().count(), 1);
    }
}
