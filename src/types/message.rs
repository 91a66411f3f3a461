use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessageProperties;

/// Broker message id used when the broker did not supply one
pub const UNAVAILABLE_MESSAGE_ID: &str = "UNAVAILABLE";

/// A message as handed out by a broker receiver
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Broker-assigned message id
    pub message_id: Option<String>,

    /// Header properties
    pub properties: MessageProperties,

    /// Message body text
    pub body: String,

    /// Whether this delivery follows a recover
    pub redelivered: bool,

    /// Broker-internal handle used to acknowledge this delivery
    pub delivery_tag: i64,
}

/// A message to be sent to a queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub properties: MessageProperties,
    pub body: String,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            properties: MessageProperties::new(),
            body: body.into(),
        }
    }

    /// Set a header property (builder pattern)
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name, value);
        self
    }

    /// Replace all header properties (builder pattern)
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// The header, body and id of one dequeued message, alive for the
/// duration of its processing only
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub header: MessageProperties,
    pub body: String,
}

impl MessageEnvelope {
    pub fn from_raw(message: &RawMessage) -> Self {
        Self {
            message_id: message
                .message_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| UNAVAILABLE_MESSAGE_ID.to_string()),
            header: message.properties.clone(),
            body: message.body.clone(),
        }
    }
}

/// Durable record of a dequeued message, written before acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStoreRecord {
    pub id: Uuid,
    pub broker_message_id: String,
    pub queue_name: String,
    pub consumer_name: String,
    pub owner_name: Option<String>,
    pub tenant_id: Option<String>,
    pub header: MessageProperties,
    pub body: String,
    pub stored_at: DateTime<Utc>,
}

impl MessageStoreRecord {
    /// Create a record for an envelope dequeued from `queue_name`
    ///
    /// # Example
    ///
    /// ```
    /// use provbus::types::{MessageEnvelope, MessageProperties, MessageStoreRecord};
    ///
    /// let envelope = MessageEnvelope {
    ///     message_id: "ID:42".to_string(),
    ///     header: MessageProperties::new().with("CustomerIdentifier", "100"),
    ///     body: "<request/>".to_string(),
    /// };
    ///
    /// let record = MessageStoreRecord::new(&envelope, "Q1", "soa-consumer")
    ///     .with_tenant_id("100")
    ///     .with_owner_name("gateway-1");
    ///
    /// assert_eq!(record.broker_message_id, "ID:42");
    /// assert_eq!(record.tenant_id.as_deref(), Some("100"));
    /// ```
    pub fn new(
        envelope: &MessageEnvelope,
        queue_name: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            broker_message_id: envelope.message_id.clone(),
            queue_name: queue_name.into(),
            consumer_name: consumer_name.into(),
            owner_name: None,
            tenant_id: None,
            header: envelope.header.clone(),
            body: envelope.body.clone(),
            stored_at: Utc::now(),
        }
    }

    /// Set the tenant id (builder pattern)
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the owner name (builder pattern)
    pub fn with_owner_name(mut self, owner_name: impl Into<String>) -> Self {
        self.owner_name = Some(owner_name.into());
        self
    }
}
