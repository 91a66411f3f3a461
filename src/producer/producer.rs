use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerSession, SessionMode};
use crate::context::RequestContext;
use crate::db::{PoolKey, ResourcePool};
use crate::error::{Error, Result};
use crate::producer::config::ProducerConfig;
use crate::producer::properties::{self, Sources};
use crate::tenant::{TenantDirectory, TenantProfile};
use crate::types::{names, MessageProperties, OutgoingMessage, UNAVAILABLE_MESSAGE_ID};

/// Result of one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { queue: String, message_id: String },

    /// The tenant is not an API customer; nothing was sent
    Skipped,
}

/// One message to send, with the context and input its properties and
/// destination are resolved from
pub struct ProduceRequest<'a, C> {
    context: &'a RequestContext,
    body: &'a str,
    input: Option<&'a MessageProperties>,
    transaction: Option<&'a C>,
}

impl<'a, C> ProduceRequest<'a, C> {
    pub fn new(context: &'a RequestContext, body: &'a str) -> Self {
        Self {
            context,
            body,
            input: None,
            transaction: None,
        }
    }

    /// Input properties plain locations are read from (builder pattern)
    pub fn with_input(mut self, input: &'a MessageProperties) -> Self {
        self.input = Some(input);
        self
    }

    /// Connection of the caller's open unit of work (builder pattern)
    pub fn with_transaction(mut self, connection: &'a C) -> Self {
        self.transaction = Some(connection);
        self
    }
}

/// Sends messages to broker queues
///
/// Plain and alternate-database sends acquire a connection, open a session,
/// send and tear everything down before returning. Transactional sends
/// open a transacted session over the caller's unit-of-work connection and
/// keep it until [`Producer::cleanup`] is called with that connection,
/// after its unit of work committed or rolled back. Sessions of other
/// units of work in flight are left open.
pub struct Producer<B: Broker> {
    config: ProducerConfig,
    broker: B,
    pool: Arc<dyn ResourcePool<Connection = B::Connection>>,
    tenants: Option<Arc<dyn TenantDirectory>>,
    /// Transacted sessions by unit-of-work connection
    deferred: Mutex<HashMap<u64, Vec<B::Session>>>,
}

impl<B: Broker> Producer<B> {
    pub fn new(
        config: ProducerConfig,
        broker: B,
        pool: Arc<dyn ResourcePool<Connection = B::Connection>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            broker,
            pool,
            tenants: None,
            deferred: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve tenant queues, API flags and service types (builder pattern)
    pub fn with_tenant_directory(mut self, tenants: Arc<dyn TenantDirectory>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Transacted sessions waiting for [`Producer::cleanup`]
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().values().map(Vec::len).sum()
    }

    pub async fn send(&self, request: ProduceRequest<'_, B::Connection>) -> Result<SendOutcome> {
        let empty = MessageProperties::new();
        let sources = Sources::new(request.context, request.input.unwrap_or(&empty));
        let customer = request
            .context
            .customer_id
            .as_deref()
            .filter(|c| !c.is_empty());
        let profile = self.profile(customer).await?;

        if self.config.lookup_domain_api_flag && !profile.as_ref().is_some_and(|p| p.api_enabled) {
            warn!(
                customer = ?customer,
                "Tenant is not configured as an API customer; skipping send"
            );
            return Ok(SendOutcome::Skipped);
        }

        let queue = self.resolve_queue(&sources, profile.as_ref())?;
        let mut header = properties::compose(&self.config, &sources, customer)?;
        if self.config.use_customer_id && !self.config.configures_customer_id() {
            if let Some(customer) = customer {
                header.insert(names::CUSTOMER_IDENTIFIER, customer);
            }
        }
        if request.context.message_id != UNAVAILABLE_MESSAGE_ID {
            header.insert(names::MESSAGE_ID, request.context.message_id.clone());
        }
        if self.config.set_service_type {
            match profile.as_ref().and_then(|p| p.service_type.as_deref()) {
                Some(service_type) => {
                    header.insert(names::SERVICE_TYPE, service_type);
                }
                None => warn!(customer = ?customer, "Unable to resolve service type for customer"),
            }
        }
        let message = OutgoingMessage::new(request.body).with_properties(header);

        let alternate = self
            .config
            .alternate_pool_key_location
            .as_deref()
            .and_then(|location| sources.first(location, &self.config.separator));

        let message_id = match alternate {
            Some(key) => self.send_pooled(&PoolKey::named(key), &queue, message).await?,
            None if self.config.transactional => {
                self.send_transacted(request.transaction, &queue, message)
                    .await?
            }
            None => self.send_pooled(&PoolKey::Default, &queue, message).await?,
        };

        info!(queue = %queue, message_id = %message_id, customer = ?customer, "Message sent");
        Ok(SendOutcome::Sent { queue, message_id })
    }

    /// Close the transacted sessions opened over `connection`, once its
    /// unit of work has committed or rolled back
    pub async fn cleanup(&self, connection: &B::Connection) {
        let id = self.broker.connection_id(connection);
        let sessions = self.deferred.lock().remove(&id).unwrap_or_default();
        Self::close_sessions(sessions).await;
    }

    /// Close every transacted session still held, for shutdown
    pub async fn cleanup_all(&self) {
        let sessions: Vec<_> = self.deferred.lock().drain().flat_map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            warn!(sessions = sessions.len(), "Closing transacted sessions of unfinished units of work");
        }
        Self::close_sessions(sessions).await;
    }

    async fn close_sessions(sessions: Vec<B::Session>) {
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Ignoring error closing transacted producer session");
            }
        }
    }

    async fn profile(&self, customer: Option<&str>) -> Result<Option<TenantProfile>> {
        let (Some(directory), Some(customer)) = (&self.tenants, customer) else {
            return Ok(None);
        };
        match directory.profile(customer).await {
            Ok(profile) => Ok(profile),
            Err(e) if self.config.lookup_domain_api_flag => Err(e),
            Err(e) => {
                warn!(customer = %customer, error = %e, "Tenant profile lookup failed");
                Ok(None)
            }
        }
    }

    /// Destination queue: location, then static name, then the tenant's
    /// event queue
    fn resolve_queue(&self, sources: &Sources<'_>, profile: Option<&TenantProfile>) -> Result<String> {
        let from_location = self
            .config
            .queue_name_location
            .as_deref()
            .and_then(|location| sources.first(location, &self.config.separator));
        let configured = self
            .config
            .queue_name
            .clone()
            .filter(|q| !q.trim().is_empty());
        let from_tenant = profile
            .and_then(|p| p.event_queue.clone())
            .filter(|q| !q.trim().is_empty());

        from_location.or(configured).or(from_tenant).ok_or_else(|| {
            Error::Config(format!(
                "no destination queue: nothing at {:?}, no queue name configured and no tenant event queue",
                self.config.queue_name_location
            ))
        })
    }

    async fn send_pooled(&self, key: &PoolKey, queue: &str, message: OutgoingMessage) -> Result<String> {
        let connection = self.pool.acquire(key).await?;
        let result = self.send_once(&connection, queue, message).await;
        self.pool.release(key, connection).await;
        result
    }

    async fn send_once(
        &self,
        connection: &B::Connection,
        queue: &str,
        message: OutgoingMessage,
    ) -> Result<String> {
        let session = self
            .broker
            .open_session(connection, SessionMode::AutoAcknowledge)
            .await?;
        let result = session.send(queue, message).await;
        if let Err(e) = session.close().await {
            debug!(queue = %queue, error = %e, "Ignoring error closing producer session");
        }
        result
    }

    async fn send_transacted(
        &self,
        connection: Option<&B::Connection>,
        queue: &str,
        message: OutgoingMessage,
    ) -> Result<String> {
        let connection = connection.ok_or_else(|| {
            Error::Transaction(
                "transactional send needs the connection of an open unit of work".to_string(),
            )
        })?;
        let session = self
            .broker
            .open_session(connection, SessionMode::Transacted)
            .await?;
        match session.send(queue, message).await {
            Ok(message_id) => {
                let id = self.broker.connection_id(connection);
                self.deferred.lock().entry(id).or_default().push(session);
                Ok(message_id)
            }
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    debug!(queue = %queue, error = %close_error, "Ignoring error closing producer session");
                }
                Err(e)
            }
        }
    }
}
