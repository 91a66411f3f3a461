use serde::Deserialize;
use std::time::Duration;

use crate::broker::parse_selector;
use crate::db::PoolKey;
use crate::error::{Error, Result};
use crate::worker_pool::WorkerPoolConfig;

/// How a consumer obtains messages from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The broker calls the consumer from its own delivery task
    Push,

    /// The consumer runs its own blocking receive loop
    Pull,

    /// The consumer drains a bounded snapshot of the queue on every tick
    Poll,
}

/// When a received message counts as consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// On handoff to the consumer
    Auto,

    /// After the message store accepted the message
    Client,
}

/// Configuration for a consumer; immutable once the consumer is built
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to consume from
    pub queue_name: String,

    /// Optional selector expression
    pub selector: Option<String>,

    pub delivery_mode: DeliveryMode,

    pub ack_mode: AckMode,

    /// Worker pool sizing; `None` dispatches inline on the receiving task
    pub worker_pool: Option<WorkerPoolConfig>,

    /// Tenant served by this consumer, for logging and store records
    pub tenant_id: Option<String>,

    /// Resource pool connections are acquired from
    pub pool_key: PoolKey,

    /// Consumer name, recorded with stored messages
    pub consumer_name: String,

    /// Owning gateway or server name
    pub owner_name: Option<String>,

    /// Message store table name exposed to the pipeline context
    pub message_store_table: Option<String>,

    /// Reconnect attempts after a broker failure before giving up
    pub max_reconnect_attempts: u32,

    /// Wait before acquiring a fresh connection during reconnect
    pub reconnect_backoff: Duration,

    /// Tick interval in poll mode
    pub poll_interval: Duration,

    /// Pause after recovering a message the store did not take, in push
    /// and pull modes
    pub recover_delay: Duration,
}

impl ConsumerConfig {
    /// Create a pull-mode, auto-acknowledge configuration with no worker pool
    ///
    /// # Example
    ///
    /// ```
    /// use provbus::consumer::{AckMode, ConsumerConfig, DeliveryMode};
    /// use provbus::worker_pool::WorkerPoolConfig;
    ///
    /// let config = ConsumerConfig::new("SOA_EVENTS", "soa-consumer")
    ///     .with_selector("CustomerIdentifier IN ('100')")
    ///     .with_delivery_mode(DeliveryMode::Push)
    ///     .with_ack_mode(AckMode::Client)
    ///     .with_worker_pool(WorkerPoolConfig::new(5, 10));
    ///
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(queue_name: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            selector: None,
            delivery_mode: DeliveryMode::Pull,
            ack_mode: AckMode::Auto,
            worker_pool: None,
            tenant_id: None,
            pool_key: PoolKey::Default,
            consumer_name: consumer_name.into(),
            owner_name: None,
            message_store_table: None,
            max_reconnect_attempts: 1,
            reconnect_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            recover_delay: Duration::from_secs(1),
        }
    }

    /// Set the selector expression (builder pattern)
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Set the delivery mode (builder pattern)
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the acknowledge mode (builder pattern)
    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    /// Dispatch through a worker pool (builder pattern)
    pub fn with_worker_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    /// Set the tenant id (builder pattern)
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Acquire connections from an alternate pool (builder pattern)
    pub fn with_pool_key(mut self, key: PoolKey) -> Self {
        self.pool_key = key;
        self
    }

    /// Set the owner name (builder pattern)
    pub fn with_owner_name(mut self, owner_name: impl Into<String>) -> Self {
        self.owner_name = Some(owner_name.into());
        self
    }

    /// Set the message store table name (builder pattern)
    pub fn with_message_store_table(mut self, table: impl Into<String>) -> Self {
        self.message_store_table = Some(table.into());
        self
    }

    /// Set the reconnect policy (builder pattern)
    pub fn with_reconnect(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_backoff = backoff;
        self
    }

    /// Set the poll tick interval (builder pattern)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the pause after a recovered delivery (builder pattern)
    pub fn with_recover_delay(mut self, delay: Duration) -> Self {
        self.recover_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::Config("consumer queue name is required".to_string()));
        }
        if self.consumer_name.trim().is_empty() {
            return Err(Error::Config("consumer name is required".to_string()));
        }
        if let Some(pool) = &self.worker_pool {
            pool.validate()?;
        }
        if self.delivery_mode == DeliveryMode::Poll && self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be greater than zero".to_string()));
        }
        parse_selector(self.selector.as_deref())?;
        Ok(())
    }
}
