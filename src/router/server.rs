//! Consumer servers: one consumer per queue (and selector), registered
//! together and torn down together.

use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::consumer::{
    AckMode, Consumer, ConsumerConfig, ConsumerResources, ConsumerState, DeliveryMode,
};
use crate::db::PoolKey;
use crate::error::{Error, Result};
use crate::router::tenants::{TenantPlan, TenantSelector};
use crate::store::DEFAULT_STORE_TABLE;
use crate::tenant::TenantDirectory;
use crate::types::names;
use crate::worker_pool::WorkerPoolConfig;

/// Defaults shared by every consumer of a server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name; consumers are named `<name>-<queue>`
    pub name: String,

    /// Owning gateway, recorded with stored messages
    pub gateway: Option<String>,

    pub delivery_mode: DeliveryMode,

    /// Store each message before acknowledging it
    pub client_ack: bool,

    /// Dispatch through a worker pool instead of the receiving task
    pub use_worker_pool: bool,

    pub core_pool_size: usize,

    pub max_pool_size: usize,

    /// Resource pool for the consumers' connections; blank means default
    pub alternate_pool_key: Option<String>,

    pub message_store_table: String,

    /// Service type consumed by a queue server, or used to look up tenants
    pub service_type: Option<String>,

    /// Queues of a queue server
    pub queues: Vec<String>,

    /// Explicit tenant list of a tenant server
    pub tenants: Vec<String>,

    /// Extra registration attempts per consumer at startup
    pub registration_retries: u32,

    #[serde(with = "crate::settings::duration_ms")]
    pub registration_backoff: Duration,

    pub max_reconnect_attempts: u32,

    #[serde(with = "crate::settings::duration_ms")]
    pub reconnect_backoff: Duration,

    #[serde(with = "crate::settings::duration_ms")]
    pub poll_interval: Duration,

    /// Pause after a message the store refused was recovered
    #[serde(with = "crate::settings::duration_ms")]
    pub recover_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "provbus".to_string(),
            gateway: None,
            delivery_mode: DeliveryMode::Push,
            client_ack: false,
            use_worker_pool: true,
            core_pool_size: 5,
            max_pool_size: 10,
            alternate_pool_key: None,
            message_store_table: DEFAULT_STORE_TABLE.to_string(),
            service_type: None,
            queues: Vec::new(),
            tenants: Vec::new(),
            registration_retries: 0,
            registration_backoff: Duration::from_secs(1),
            max_reconnect_attempts: 1,
            reconnect_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            recover_delay: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("server name must not be empty".to_string()));
        }
        if self.message_store_table.trim().is_empty() {
            return Err(Error::Config(
                "message store table name must not be empty".to_string(),
            ));
        }
        if self.use_worker_pool {
            self.worker_pool().validate()?;
        }
        Ok(())
    }

    fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.core_pool_size, self.max_pool_size)
    }

    /// Consumer configuration for `queue` carrying this server's defaults
    pub fn consumer_config(&self, queue: &str, selector: Option<String>) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(queue, format!("{}-{}", self.name, queue))
            .with_delivery_mode(self.delivery_mode)
            .with_ack_mode(if self.client_ack {
                AckMode::Client
            } else {
                AckMode::Auto
            })
            .with_pool_key(PoolKey::from_option(self.alternate_pool_key.as_deref()))
            .with_owner_name(self.gateway.clone().unwrap_or_else(|| self.name.clone()))
            .with_message_store_table(self.message_store_table.clone())
            .with_reconnect(self.max_reconnect_attempts, self.reconnect_backoff)
            .with_poll_interval(self.poll_interval)
            .with_recover_delay(self.recover_delay);
        if let Some(selector) = selector {
            config = config.with_selector(selector);
        }
        if self.use_worker_pool {
            config = config.with_worker_pool(self.worker_pool());
        }
        config
    }
}

/// Selector restricting a queue to one service type
pub fn service_type_selector(service_type: &str) -> String {
    format!(
        "{} = '{}'",
        names::SERVICE_TYPE,
        service_type.replace('\'', "''")
    )
}

struct Slot<B: Broker> {
    consumer: Consumer<B>,
    held: Mutex<Option<(PoolKey, B::Connection)>>,
}

/// A set of consumers sharing one broker, pool, store and pipeline
///
/// The server acquires one connection per push or pull consumer at
/// startup and hands it over; those connections stay the server's and are
/// released on [`ConsumerServer::shutdown`].
pub struct ConsumerServer<B: Broker> {
    config: ServerConfig,
    resources: ConsumerResources<B>,
    plan: TenantPlan,
    slots: Vec<Slot<B>>,
}

impl<B: Broker + Clone> ConsumerServer<B> {
    /// Empty server; consumers are added with [`ConsumerServer::add_consumer`]
    pub fn new(config: ServerConfig, resources: ConsumerResources<B>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resources,
            plan: TenantPlan::new(),
            slots: Vec::new(),
        })
    }

    /// One consumer per configured queue, filtered by the configured
    /// service type when there is one
    pub fn for_queues(config: ServerConfig, resources: ConsumerResources<B>) -> Result<Self> {
        let mut server = Self::new(config, resources)?;
        if server.config.queues.is_empty() {
            warn!(server = %server.config.name, "No queues configured; server has no consumers");
            return Ok(server);
        }

        let selector = server.config.service_type.as_deref().map(service_type_selector);
        for queue in server.config.queues.clone() {
            let consumer = server.config.consumer_config(&queue, selector.clone());
            server.add_consumer(consumer)?;
        }
        Ok(server)
    }

    /// One consumer per event queue, shared by every tenant of that queue
    ///
    /// Tenants come from the configured list or, when it is empty, from the
    /// directory's tenants for the configured service type.
    pub async fn for_tenants(
        config: ServerConfig,
        resources: ConsumerResources<B>,
        directory: &dyn TenantDirectory,
    ) -> Result<Self> {
        let mut server = Self::new(config, resources)?;

        let tenants = match (&server.config.tenants[..], &server.config.service_type) {
            ([], Some(service_type)) => directory.tenants_for_service(service_type).await?,
            (tenants, _) => tenants.to_vec(),
        };
        if tenants.is_empty() {
            warn!(server = %server.config.name, "No tenants configured; server has no consumers");
        }

        let plan = TenantPlan::build(directory, &tenants).await?;
        for (queue, selector) in plan.queues() {
            let consumer = server.tenant_consumer_config(queue, selector);
            server.add_consumer(consumer)?;
        }
        server.plan = plan;
        Ok(server)
    }

    fn tenant_consumer_config(&self, queue: &str, selector: &TenantSelector) -> ConsumerConfig {
        let mut config = self.config.consumer_config(queue, selector.render());
        if let [tenant] = selector.tenants() {
            config = config.with_tenant_id(tenant.clone());
        }
        config
    }

    /// Add a consumer; a second consumer for the same queue and selector is
    /// rejected
    pub fn add_consumer(&mut self, config: ConsumerConfig) -> Result<&Consumer<B>> {
        let duplicate = self.slots.iter().any(|slot| {
            slot.consumer.queue_name() == config.queue_name
                && slot.consumer.config().selector == config.selector
        });
        if duplicate {
            return Err(Error::Config(format!(
                "server '{}' already has a consumer for queue '{}' with selector {:?}",
                self.config.name, config.queue_name, config.selector
            )));
        }

        let consumer = Consumer::new(config, self.resources.clone())?;
        self.slots.push(Slot {
            consumer,
            held: Mutex::new(None),
        });
        let index = self.slots.len() - 1;
        Ok(&self.slots[index].consumer)
    }

    /// Extend the tenant selector of `queue` with `tenant`
    ///
    /// Returns `false` when the tenant is already served. A consumer that
    /// was active is disconnected and registered again with the new
    /// selector; tenants are never added to a live selector.
    pub async fn add_tenant(&mut self, queue: &str, tenant: &str) -> Result<bool> {
        if self
            .plan
            .selector(queue)
            .is_some_and(|selector| selector.contains(tenant))
        {
            return Ok(false);
        }
        self.plan.add(queue, tenant);
        let Some(selector) = self.plan.selector(queue) else {
            return Ok(false);
        };
        let config = self.tenant_consumer_config(queue, selector);
        let consumer = Consumer::new(config, self.resources.clone())?;

        let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.consumer.queue_name() == queue)
        else {
            self.slots.push(Slot {
                consumer,
                held: Mutex::new(None),
            });
            return Ok(true);
        };

        let previous = std::mem::replace(
            &mut self.slots[index],
            Slot {
                consumer,
                held: Mutex::new(None),
            },
        );
        let was_active = matches!(
            previous.consumer.state(),
            ConsumerState::Active | ConsumerState::Reconnecting
        );
        self.retire(&previous).await;
        info!(
            queue = %queue,
            tenant = %tenant,
            selector = ?self.slots[index].consumer.selector(),
            "Tenant added; consumer rebuilt"
        );
        if was_active {
            self.register_slot(&self.slots[index]).await?;
        }
        Ok(true)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Consumer<B>> {
        self.slots.iter().map(|slot| &slot.consumer)
    }

    /// First consumer registered for `queue`
    pub fn consumer(&self, queue: &str) -> Option<&Consumer<B>> {
        self.consumers().find(|consumer| consumer.queue_name() == queue)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Register every consumer in order
    ///
    /// A consumer whose registration still fails after the configured
    /// retries aborts startup: every consumer is disconnected, the
    /// server's connections are released and the error is returned.
    pub async fn start(&self) -> Result<()> {
        info!(server = %self.config.name, consumers = self.slots.len(), "Starting consumer server");
        for slot in &self.slots {
            let mut attempt = 0;
            loop {
                match self.register_slot(slot).await {
                    Ok(()) => break,
                    Err(e) if attempt < self.config.registration_retries => {
                        attempt += 1;
                        warn!(
                            queue = %slot.consumer.queue_name(),
                            attempt,
                            error = %e,
                            "Consumer registration failed; retrying"
                        );
                        tokio::time::sleep(self.config.registration_backoff).await;
                    }
                    Err(e) => {
                        error!(
                            server = %self.config.name,
                            queue = %slot.consumer.queue_name(),
                            error = %e,
                            "Consumer registration failed; aborting startup"
                        );
                        self.shutdown().await;
                        return Err(e);
                    }
                }
            }
        }
        info!(server = %self.config.name, "Consumer server started");
        Ok(())
    }

    /// Disconnect every consumer and release the server's connections.
    /// Idempotent.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            self.retire(slot).await;
        }
        info!(server = %self.config.name, "Consumer server stopped");
    }

    async fn register_slot(&self, slot: &Slot<B>) -> Result<()> {
        let consumer = &slot.consumer;
        if consumer.config().delivery_mode == DeliveryMode::Poll {
            return consumer.register(None).await;
        }

        let key = consumer.config().pool_key.clone();
        let connection = self
            .resources
            .pool
            .acquire(&key)
            .await
            .map_err(|e| Error::connectivity(&format!("acquire connection from pool '{}'", key), e))?;

        match consumer.register(Some(connection.clone())).await {
            Ok(()) => {
                *slot.held.lock() = Some((key, connection));
                Ok(())
            }
            Err(e) => {
                self.resources.pool.release(&key, connection).await;
                Err(e)
            }
        }
    }

    async fn retire(&self, slot: &Slot<B>) {
        slot.consumer.disconnect().await;
        let held = slot.held.lock().take();
        if let Some((key, connection)) = held {
            self.resources.pool.release(&key, connection).await;
        }
    }
}
