use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::broker::{
    parse_selector, Broker, BrokerSession, ExceptionListener, MessageListener, MessageReceiver,
    Selector, SessionMode,
};
use crate::consumer::config::{AckMode, ConsumerConfig, DeliveryMode};
use crate::consumer::delivery::DeliveryOutcome;
use crate::db::ResourcePool;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::store::MessageStore;
use crate::types::RawMessage;
use crate::worker_pool::WorkerPool;

pub(super) type ReceiverOf<B> = <<B as Broker>::Session as BrokerSession>::Receiver;

/// Lifecycle state of a [`Consumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unregistered,
    Registering,
    Active,
    Reconnecting,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Unregistered => "unregistered",
            ConsumerState::Registering => "registering",
            ConsumerState::Active => "active",
            ConsumerState::Reconnecting => "reconnecting",
            ConsumerState::Disconnecting => "disconnecting",
            ConsumerState::Disconnected => "disconnected",
        };
        write!(f, "{}", name)
    }
}

/// Collaborators shared by every consumer of a server
pub struct ConsumerResources<B: Broker> {
    pub broker: B,
    pub pool: Arc<dyn ResourcePool<Connection = B::Connection>>,
    pub store: Arc<dyn MessageStore>,
    pub pipeline: Arc<dyn Pipeline>,
}

impl<B: Broker + Clone> Clone for ConsumerResources<B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            pool: Arc::clone(&self.pool),
            store: Arc::clone(&self.store),
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<B: Broker> ConsumerResources<B> {
    pub fn new(
        broker: B,
        pool: Arc<dyn ResourcePool<Connection = B::Connection>>,
        store: Arc<dyn MessageStore>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        Self {
            broker,
            pool,
            store,
            pipeline,
        }
    }
}

/// Session and receiver currently held by a consumer
pub(super) struct SessionLink<B: Broker> {
    pub(super) session: Arc<B::Session>,
    pub(super) receiver: Arc<ReceiverOf<B>>,
}

impl<B: Broker> Clone for SessionLink<B> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

pub(super) struct ConsumerShared<B: Broker> {
    pub(super) config: ConsumerConfig,
    pub(super) selector: Option<Selector>,
    pub(super) resources: ConsumerResources<B>,
    pub(super) workers: Mutex<Option<WorkerPool>>,
    pub(super) disconnecting: AtomicBool,
    pub(super) stop: Notify,
    state: Mutex<ConsumerState>,
    link: Mutex<Option<SessionLink<B>>>,
    connection: Mutex<Option<B::Connection>>,
    owns_connection: AtomicBool,
    reconnecting: AtomicBool,
    generation: AtomicU64,
}

/// Queue consumer running the store-then-acknowledge delivery protocol
///
/// A consumer owns one broker session and receiver (push and pull modes)
/// or opens a fresh one on every tick (poll mode). Dequeued messages are
/// stored before they are acknowledged when client acknowledgment is
/// configured, then dispatched to the pipeline inline or through a bounded
/// [`WorkerPool`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use provbus::broker::MemoryBroker;
/// use provbus::consumer::{AckMode, Consumer, ConsumerConfig, ConsumerResources, DeliveryMode};
/// use provbus::pipeline::pipeline_fn;
/// use provbus::store::MemoryMessageStore;
///
/// # tokio_test::block_on(async {
/// let broker = MemoryBroker::new();
/// let resources = ConsumerResources::new(
///     broker.clone(),
///     Arc::new(broker.clone()),
///     Arc::new(MemoryMessageStore::new()),
///     pipeline_fn(|_ctx, _header, _body| async { Ok(()) }),
/// );
///
/// let config = ConsumerConfig::new("SOA_EVENTS", "soa-consumer")
///     .with_delivery_mode(DeliveryMode::Push)
///     .with_ack_mode(AckMode::Client);
///
/// let consumer = Consumer::new(config, resources).unwrap();
/// consumer.register(None).await.unwrap();
/// consumer.disconnect().await;
/// # });
/// ```
pub struct Consumer<B: Broker> {
    pub(super) shared: Arc<ConsumerShared<B>>,
}

impl<B: Broker> Clone for Consumer<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Broker> Consumer<B> {
    /// Create an unregistered consumer; fails on invalid configuration
    pub fn new(config: ConsumerConfig, resources: ConsumerResources<B>) -> Result<Self> {
        config.validate()?;
        let selector = parse_selector(config.selector.as_deref())?;
        Ok(Self {
            shared: Arc::new(ConsumerShared {
                config,
                selector,
                resources,
                workers: Mutex::new(None),
                disconnecting: AtomicBool::new(false),
                stop: Notify::new(),
                state: Mutex::new(ConsumerState::Unregistered),
                link: Mutex::new(None),
                connection: Mutex::new(None),
                owns_connection: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.config
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.config.queue_name
    }

    /// Selector expression this consumer filters with, if any
    pub fn selector(&self) -> Option<&str> {
        self.shared.selector.as_ref().map(Selector::source)
    }

    pub fn state(&self) -> ConsumerState {
        *self.shared.state.lock()
    }

    /// Worker pool tasks currently running
    pub fn active_worker_count(&self) -> Result<usize> {
        self.shared
            .workers
            .lock()
            .as_ref()
            .map(WorkerPool::active_count)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "consumer for queue '{}' has no worker pool",
                    self.shared.config.queue_name
                ))
            })
    }

    /// Register with the broker and start delivery
    ///
    /// With `None` the consumer acquires its own connection from the
    /// configured pool and releases it on disconnect; a connection handed
    /// in by the owner stays the owner's. Poll consumers open a fresh
    /// connection on every tick and ignore the argument.
    ///
    /// Any failure is reported as a connectivity error and leaves the
    /// consumer unregistered. A `disconnect()` that lands while
    /// registration is in flight wins: whatever was opened is torn down and
    /// [`Error::Closed`] is returned.
    pub async fn register(&self, connection: Option<B::Connection>) -> Result<()> {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.state.lock();
            if !matches!(
                *state,
                ConsumerState::Unregistered | ConsumerState::Disconnected
            ) {
                return Err(Error::Validation(format!(
                    "consumer for queue '{}' is already {}",
                    shared.config.queue_name, *state
                )));
            }
            *state = ConsumerState::Registering;
            shared.disconnecting.store(false, Ordering::SeqCst);
            shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!(
            queue = %shared.config.queue_name,
            consumer = %shared.config.consumer_name,
            mode = ?shared.config.delivery_mode,
            selector = ?self.selector(),
            "Registering consumer"
        );

        if let Err(e) = shared.establish(connection).await {
            shared.set_state(ConsumerState::Unregistered);
            shared.release_connection().await;
            error!(queue = %shared.config.queue_name, error = %e, "Consumer registration failed");
            return Err(if e.is_connectivity() {
                e
            } else {
                Error::connectivity(
                    &format!("register consumer for queue '{}'", shared.config.queue_name),
                    e,
                )
            });
        }

        let activated = {
            let mut state = shared.state.lock();
            let activated = !shared.disconnecting.load(Ordering::SeqCst);
            if activated {
                *state = ConsumerState::Active;
            }
            activated
        };
        if !activated {
            warn!(queue = %shared.config.queue_name, "Consumer disconnected during registration");
            shared.teardown().await;
            return Err(Error::Closed(format!(
                "consumer for queue '{}' was disconnected during registration",
                shared.config.queue_name
            )));
        }

        match shared.config.delivery_mode {
            DeliveryMode::Pull => {
                tokio::spawn(Arc::clone(shared).receive_loop(generation));
            }
            DeliveryMode::Poll => {
                tokio::spawn(Arc::clone(shared).poll_loop(generation));
            }
            DeliveryMode::Push => {}
        }
        debug!(
            queue = %shared.config.queue_name,
            "Scheduling priority hint is not available for async tasks"
        );
        Ok(())
    }

    /// Stop delivery and release resources. Idempotent.
    ///
    /// The disconnect flag is raised before the session is closed, so a
    /// failure observed during teardown never starts a reconnect. Running
    /// worker tasks are allowed to finish.
    pub async fn disconnect(&self) {
        if matches!(
            self.state(),
            ConsumerState::Disconnecting | ConsumerState::Disconnected
        ) {
            debug!(queue = %self.shared.config.queue_name, "Consumer already disconnected");
            return;
        }
        self.shared.teardown().await;
        info!(
            queue = %self.shared.config.queue_name,
            consumer = %self.shared.config.consumer_name,
            "Consumer disconnected"
        );
    }

    /// Run one received message through the delivery protocol on `session`
    pub async fn deliver(&self, session: &B::Session, message: RawMessage) -> DeliveryOutcome {
        self.shared.deliver(session, message).await
    }
}

impl<B: Broker> ConsumerShared<B> {
    pub(super) fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    pub(super) fn session_mode(&self) -> SessionMode {
        match self.config.ack_mode {
            AckMode::Client => SessionMode::ClientAcknowledge,
            AckMode::Auto => SessionMode::AutoAcknowledge,
        }
    }

    /// Whether a loop started for `generation` should keep running
    pub(super) fn is_current(&self, generation: u64) -> bool {
        !self.disconnecting.load(Ordering::SeqCst)
            && self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_connection(&self, connection: B::Connection, owned: bool) {
        *self.connection.lock() = Some(connection);
        self.owns_connection.store(owned, Ordering::SeqCst);
    }

    async fn establish(self: &Arc<Self>, connection: Option<B::Connection>) -> Result<()> {
        if self.config.delivery_mode == DeliveryMode::Poll {
            if connection.is_some() {
                debug!(queue = %self.config.queue_name, "Poll consumer ignores the supplied connection");
            }
            return self.ensure_workers();
        }

        let connection = match connection {
            Some(connection) => {
                self.set_connection(connection.clone(), false);
                connection
            }
            None => {
                let connection = self.resources.pool.acquire(&self.config.pool_key).await?;
                self.set_connection(connection.clone(), true);
                connection
            }
        };
        self.open_link(&connection).await
    }

    /// Create the worker pool unless a live one already exists
    pub(super) fn ensure_workers(&self) -> Result<()> {
        let Some(pool_config) = &self.config.worker_pool else {
            return Ok(());
        };
        let mut workers = self.workers.lock();
        if workers.as_ref().map_or(true, WorkerPool::is_shutdown) {
            *workers = Some(WorkerPool::new(
                format!("{}-workers", self.config.consumer_name),
                pool_config.clone(),
            )?);
        }
        Ok(())
    }

    async fn open_link(self: &Arc<Self>, connection: &B::Connection) -> Result<()> {
        let session = Arc::new(
            self.resources
                .broker
                .open_session(connection, self.session_mode())
                .await?,
        );

        let attached = self.attach(&session).await;
        match attached {
            Ok(receiver) => {
                *self.link.lock() = Some(SessionLink { session, receiver });
                Ok(())
            }
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    debug!(error = %close_error, "Ignoring error closing half-open session");
                }
                Err(e)
            }
        }
    }

    async fn attach(self: &Arc<Self>, session: &Arc<B::Session>) -> Result<Arc<ReceiverOf<B>>> {
        let receiver = Arc::new(
            session
                .create_receiver(&self.config.queue_name, self.selector.as_ref())
                .await?,
        );
        self.ensure_workers()?;

        if self.config.delivery_mode == DeliveryMode::Push {
            session.set_exception_listener(Arc::new(FailureListener {
                consumer: Arc::downgrade(self),
            }));
            receiver.set_message_listener(Arc::new(DeliveryListener {
                consumer: Arc::downgrade(self),
                session: Arc::clone(session),
            }))?;
        }
        Ok(receiver)
    }

    async fn release_connection(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            if self.owns_connection.swap(false, Ordering::SeqCst) {
                self.resources
                    .pool
                    .release(&self.config.pool_key, connection)
                    .await;
            } else {
                debug!(queue = %self.config.queue_name, "Leaving owner-provided connection with its owner");
            }
        }
    }

    async fn close_link(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            if let Err(e) = link.session.close().await {
                debug!(queue = %self.config.queue_name, error = %e, "Ignoring error closing session");
            }
        }
    }

    pub(super) async fn teardown(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
        self.set_state(ConsumerState::Disconnecting);
        self.stop.notify_waiters();

        self.close_link().await;
        let workers = self.workers.lock().clone();
        if let Some(workers) = workers {
            workers.shutdown();
        }
        self.release_connection().await;
        self.set_state(ConsumerState::Disconnected);
    }

    async fn receive_loop(self: Arc<Self>, generation: u64) {
        debug!(queue = %self.config.queue_name, "Receive loop started");
        while self.is_current(generation) {
            let link = self.link.lock().clone();
            let Some(link) = link else {
                break;
            };

            let resumed = match link.receiver.receive().await {
                Ok(Some(message)) => match self.deliver(link.session.as_ref(), message).await {
                    DeliveryOutcome::AcknowledgeFailed => {
                        self.recover_link(Error::Connectivity("acknowledge failed".to_string()))
                            .await
                    }
                    DeliveryOutcome::Recovered => {
                        self.pause_after_recover().await;
                        true
                    }
                    _ => true,
                },
                Ok(None) => {
                    self.is_current(generation)
                        && self
                            .recover_link(Error::Closed(format!(
                                "session for queue '{}' closed",
                                self.config.queue_name
                            )))
                            .await
                }
                Err(e) => self.recover_link(e).await,
            };
            if !resumed {
                break;
            }
        }
        debug!(queue = %self.config.queue_name, "Receive loop stopped");
    }

    /// Wait `recover_delay` before the recovered message comes back, or
    /// until the consumer is stopped
    pub(super) async fn pause_after_recover(&self) {
        let stopped = self.stop.notified();
        if self.disconnecting.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = stopped => {}
            _ = tokio::time::sleep(self.config.recover_delay) => {}
        }
    }

    /// Reconnect after a broker failure; `true` once delivery resumed
    ///
    /// Failures seen while disconnecting are ignored. After
    /// `max_reconnect_attempts` failed attempts the consumer is torn down.
    pub(super) async fn recover_link(self: &Arc<Self>, failure: Error) -> bool {
        if self.disconnecting.load(Ordering::SeqCst) {
            debug!(queue = %self.config.queue_name, error = %failure, "Ignoring broker failure during disconnect");
            return false;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.config.queue_name, "Reconnect already in progress");
            return false;
        }

        error!(queue = %self.config.queue_name, error = %failure, "Broker failure on consumer");
        self.set_state(ConsumerState::Reconnecting);

        let max_attempts = self.config.max_reconnect_attempts;
        let mut resumed = false;
        for attempt in 1..=max_attempts {
            if self.disconnecting.load(Ordering::SeqCst) {
                break;
            }
            match self.reconnect_once().await {
                Ok(()) => {
                    info!(queue = %self.config.queue_name, attempt, "Consumer reconnected");
                    resumed = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        queue = %self.config.queue_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);

        if resumed {
            self.set_state(ConsumerState::Active);
            return true;
        }
        if !self.disconnecting.load(Ordering::SeqCst) {
            error!(
                queue = %self.config.queue_name,
                max_attempts,
                "Giving up on consumer after failed reconnect attempts"
            );
            self.teardown().await;
        }
        false
    }

    async fn reconnect_once(self: &Arc<Self>) -> Result<()> {
        self.close_link().await;

        let current = self.connection.lock().clone();
        let mut reusable = None;
        if let Some(connection) = current {
            if self.resources.pool.is_valid(&connection).await {
                reusable = Some(connection);
            }
        }

        let connection = match reusable {
            Some(connection) => {
                debug!(queue = %self.config.queue_name, "Resuming on existing connection");
                connection
            }
            None => {
                self.release_connection().await;
                tokio::time::sleep(self.config.reconnect_backoff).await;
                if self.disconnecting.load(Ordering::SeqCst) {
                    return Err(Error::Closed("consumer is disconnecting".to_string()));
                }
                let connection = self.resources.pool.acquire(&self.config.pool_key).await?;
                self.set_connection(connection.clone(), true);
                connection
            }
        };

        self.open_link(&connection).await?;
        if self.disconnecting.load(Ordering::SeqCst) {
            self.close_link().await;
            return Err(Error::Closed("consumer is disconnecting".to_string()));
        }
        Ok(())
    }
}

/// Push-mode delivery target attached to a session's receiver
struct DeliveryListener<B: Broker> {
    consumer: Weak<ConsumerShared<B>>,
    session: Arc<B::Session>,
}

#[async_trait]
impl<B: Broker> MessageListener for DeliveryListener<B> {
    async fn on_message(&self, message: RawMessage) {
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        match consumer.deliver(self.session.as_ref(), message).await {
            DeliveryOutcome::AcknowledgeFailed => {
                consumer
                    .recover_link(Error::Connectivity("acknowledge failed".to_string()))
                    .await;
            }
            DeliveryOutcome::Recovered => consumer.pause_after_recover().await,
            _ => {}
        }
    }
}

/// Push-mode exception target; starts the reconnect path
struct FailureListener<B: Broker> {
    consumer: Weak<ConsumerShared<B>>,
}

impl<B: Broker> ExceptionListener for FailureListener<B> {
    fn on_exception(&self, failure: Error) {
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    consumer.recover_link(failure).await;
                });
            }
            Err(_) => {
                error!(
                    queue = %consumer.config.queue_name,
                    error = %failure,
                    "Broker failure reported outside of a runtime; consumer not reconnected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::pipeline::pipeline_fn;
    use crate::store::MemoryMessageStore;
    use crate::types::OutgoingMessage;
    use std::time::Duration;

    fn resources(broker: &MemoryBroker) -> ConsumerResources<MemoryBroker> {
        ConsumerResources::new(
            broker.clone(),
            Arc::new(broker.clone()),
            Arc::new(MemoryMessageStore::new()),
            pipeline_fn(|_, _, _| async { Ok(()) }),
        )
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let broker = MemoryBroker::new();
        let config = ConsumerConfig::new("Q1", "c").with_selector("a IN (");
        assert!(Consumer::new(config, resources(&broker)).is_err());
    }

    #[tokio::test]
    async fn test_register_and_disconnect_own_connection() {
        let broker = MemoryBroker::new();
        let consumer = Consumer::new(ConsumerConfig::new("Q1", "c"), resources(&broker)).unwrap();
        assert_eq!(consumer.state(), ConsumerState::Unregistered);

        consumer.register(None).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Active);
        assert_eq!(broker.acquired_count(), 1);
        assert_eq!(broker.open_session_count(), 1);
        assert!(consumer.register(None).await.is_err());

        consumer.disconnect().await;
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
        assert_eq!(broker.open_session_count(), 0);
        assert_eq!(broker.released_count(), 1);
    }

    #[tokio::test]
    async fn test_owner_connection_is_not_released() {
        let broker = MemoryBroker::new();
        let connection = broker.acquire(&crate::db::PoolKey::Default).await.unwrap();
        let consumer = Consumer::new(
            ConsumerConfig::new("Q1", "c").with_delivery_mode(DeliveryMode::Push),
            resources(&broker),
        )
        .unwrap();

        consumer.register(Some(connection)).await.unwrap();
        consumer.disconnect().await;
        assert_eq!(broker.released_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_failure_is_connectivity_error() {
        let broker = MemoryBroker::new();
        broker.fail_session_opens(1);
        let consumer = Consumer::new(ConsumerConfig::new("Q1", "c"), resources(&broker)).unwrap();

        let error = consumer.register(None).await.unwrap_err();
        assert!(error.is_connectivity());
        assert_eq!(consumer.state(), ConsumerState::Unregistered);
        assert_eq!(broker.released_count(), 1);

        consumer.register(None).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Active);
        consumer.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_during_registration_wins() {
        let broker = MemoryBroker::new();
        broker.delay_session_opens(Duration::from_millis(100));
        let consumer = Consumer::new(ConsumerConfig::new("Q1", "c"), resources(&broker)).unwrap();

        let registering = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.register(None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(consumer.state(), ConsumerState::Registering);
        assert!(matches!(
            consumer.register(None).await,
            Err(Error::Validation(_))
        ));

        consumer.disconnect().await;
        let result = registering.await.unwrap();

        assert!(matches!(result, Err(Error::Closed(_))));
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
        assert_eq!(broker.open_session_count(), 0);
        assert_eq!(broker.acquired_count(), 1);
        assert_eq!(broker.released_count(), 1);

        broker.delay_session_opens(Duration::ZERO);
        consumer.register(None).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Active);
        consumer.disconnect().await;
    }

    #[tokio::test]
    async fn test_active_worker_count_requires_pool() {
        let broker = MemoryBroker::new();
        let consumer = Consumer::new(ConsumerConfig::new("Q1", "c"), resources(&broker)).unwrap();
        assert!(consumer.active_worker_count().is_err());

        let pooled = Consumer::new(
            ConsumerConfig::new("Q1", "c")
                .with_worker_pool(crate::worker_pool::WorkerPoolConfig::new(1, 2)),
            resources(&broker),
        )
        .unwrap();
        pooled.register(None).await.unwrap();
        assert_eq!(pooled.active_worker_count().unwrap(), 0);
        pooled.disconnect().await;
    }

    #[tokio::test]
    async fn test_pull_loop_delivers_and_stops() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryMessageStore::new());
        let resources = ConsumerResources::new(
            broker.clone(),
            Arc::new(broker.clone()),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            pipeline_fn(|_, _, _| async { Ok(()) }),
        );
        let consumer = Consumer::new(
            ConsumerConfig::new("Q1", "c").with_ack_mode(AckMode::Client),
            resources,
        )
        .unwrap();
        consumer.register(None).await.unwrap();

        broker.enqueue("Q1", OutgoingMessage::new("a"));
        broker.enqueue("Q1", OutgoingMessage::new("b"));

        for _ in 0..100 {
            if store.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 2);
        assert_eq!(broker.acknowledged_count(), 2);

        consumer.disconnect().await;
        broker.enqueue("Q1", OutgoingMessage::new("c"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.queue_depth("Q1"), 1);
    }
}
