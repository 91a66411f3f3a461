use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerSession, ExceptionListener, MessageListener, MessageReceiver, Selector,
    SessionMode,
};
use crate::db::{PoolKey, ResourcePool};
use crate::error::{Error, Result};
use crate::types::{MessageProperties, OutgoingMessage, RawMessage};

const WAKE_INTERVAL: Duration = Duration::from_millis(50);

/// In-process broker with the same session semantics as [`super::PgBroker`]
///
/// The broker doubles as its own [`ResourcePool`]: connections are cheap
/// handles carrying an id and a buffer for transacted sends. Counters and
/// fault switches make delivery behavior observable in tests.
///
/// # Example
///
/// ```
/// use provbus::broker::{Broker, BrokerSession, MemoryBroker, MessageReceiver, SessionMode};
/// use provbus::db::{PoolKey, ResourcePool};
/// use provbus::types::OutgoingMessage;
///
/// # tokio_test::block_on(async {
/// let broker = MemoryBroker::new();
/// broker.enqueue("Q1", OutgoingMessage::new("<hello/>"));
///
/// let conn = broker.acquire(&PoolKey::Default).await.unwrap();
/// let session = broker.open_session(&conn, SessionMode::AutoAcknowledge).await.unwrap();
/// let receiver = session.create_receiver("Q1", None).await.unwrap();
///
/// let message = receiver.receive_no_wait().await.unwrap().unwrap();
/// assert_eq!(message.body, "<hello/>");
/// # });
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, VecDeque<StoredMessage>>>,
    arrivals: Notify,
    next_tag: AtomicI64,
    next_connection: AtomicU64,
    sessions: Mutex<Vec<Weak<SessionCore>>>,
    faults: Mutex<Faults>,
    stats: Stats,
}

#[derive(Default)]
struct Faults {
    failing_session_opens: usize,
    failing_acquires: usize,
    invalid_connections: HashSet<u64>,
    session_open_delay: Duration,
}

#[derive(Default)]
struct Stats {
    acknowledged: AtomicUsize,
    recover_calls: AtomicUsize,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    browse_calls: AtomicUsize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    tag: i64,
    message_id: String,
    properties: MessageProperties,
    body: String,
    redelivered: bool,
}

impl StoredMessage {
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            message_id: Some(self.message_id.clone()),
            properties: self.properties.clone(),
            body: self.body.clone(),
            redelivered: self.redelivered,
            delivery_tag: self.tag,
        }
    }
}

/// Connection handle issued by [`MemoryBroker`]
///
/// Transacted sessions opened over a connection buffer their sends on it;
/// [`MemoryConnection::commit`] publishes them and
/// [`MemoryConnection::rollback`] discards them, standing in for the
/// enclosing database transaction.
#[derive(Clone)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    pending: Arc<Mutex<Vec<(String, StoredMessage)>>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publish every transacted send buffered on this connection
    pub fn commit(&self) {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        {
            let mut queues = self.state.queues.lock();
            for (queue, message) in pending {
                queues.entry(queue).or_default().push_back(message);
            }
        }
        self.state.arrivals.notify_waiters();
    }

    /// Discard every transacted send buffered on this connection
    pub fn rollback(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message directly on a queue; returns its message id
    pub fn enqueue(&self, queue: &str, message: OutgoingMessage) -> String {
        let stored = self.state.stored(message);
        let id = stored.message_id.clone();
        self.state
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(stored);
        self.state.arrivals.notify_waiters();
        id
    }

    /// Messages currently available on a queue
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// Bodies of the messages currently on a queue, head first
    pub fn queued_bodies(&self, queue: &str) -> Vec<String> {
        self.state
            .queues
            .lock()
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Header properties of the messages currently on a queue, head first
    pub fn queued_properties(&self, queue: &str) -> Vec<MessageProperties> {
        self.state
            .queues
            .lock()
            .get(queue)
            .map(|q| q.iter().map(|m| m.properties.clone()).collect())
            .unwrap_or_default()
    }

    pub fn acknowledged_count(&self) -> usize {
        self.state.stats.acknowledged.load(Ordering::SeqCst)
    }

    pub fn recover_count(&self) -> usize {
        self.state.stats.recover_calls.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.stats.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions_opened() - self.state.stats.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn acquired_count(&self) -> usize {
        self.state.stats.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.state.stats.released.load(Ordering::SeqCst)
    }

    pub fn browse_count_calls(&self) -> usize {
        self.state.stats.browse_calls.load(Ordering::SeqCst)
    }

    /// Make the next `count` session opens fail with a connectivity error
    pub fn fail_session_opens(&self, count: usize) {
        self.state.faults.lock().failing_session_opens = count;
    }

    /// Hold every session open for `delay` before it completes
    pub fn delay_session_opens(&self, delay: Duration) {
        self.state.faults.lock().session_open_delay = delay;
    }

    /// Make the next `count` connection acquisitions fail
    pub fn fail_acquires(&self, count: usize) {
        self.state.faults.lock().failing_acquires = count;
    }

    /// Mark a connection as no longer usable for broker traffic
    pub fn invalidate_connection(&self, connection: &MemoryConnection) {
        self.state.faults.lock().invalid_connections.insert(connection.id);
    }

    /// Break every open session: blocked receivers fail and exception
    /// listeners are notified
    pub fn break_sessions(&self) {
        let sessions: Vec<Arc<SessionCore>> = self
            .state
            .sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for core in sessions {
            if core.closed.load(Ordering::SeqCst) {
                continue;
            }
            core.broken.store(true, Ordering::SeqCst);
            core.wake.notify_waiters();
            let listener = core.exception_listener.lock().clone();
            if let Some(listener) = listener {
                listener.on_exception(Error::Connectivity("broker session lost".to_string()));
            }
        }
    }
}

impl BrokerState {
    fn stored(&self, message: OutgoingMessage) -> StoredMessage {
        StoredMessage {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            message_id: format!("ID:{}", Uuid::new_v4().simple()),
            properties: message.properties,
            body: message.body,
            redelivered: false,
        }
    }
}

#[async_trait]
impl ResourcePool for MemoryBroker {
    type Connection = MemoryConnection;

    async fn acquire(&self, key: &PoolKey) -> Result<MemoryConnection> {
        {
            let mut faults = self.state.faults.lock();
            if faults.failing_acquires > 0 {
                faults.failing_acquires -= 1;
                return Err(Error::Connectivity(format!(
                    "resource pool '{}' unavailable",
                    key
                )));
            }
        }
        self.state.stats.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id: self.state.next_connection.fetch_add(1, Ordering::SeqCst) + 1,
            state: Arc::clone(&self.state),
            pending: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn release(&self, key: &PoolKey, connection: MemoryConnection) {
        debug!(pool = %key, connection = connection.id, "Releasing memory connection");
        self.state.stats.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn is_valid(&self, connection: &MemoryConnection) -> bool {
        !self
            .state
            .faults
            .lock()
            .invalid_connections
            .contains(&connection.id)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;
    type Session = MemorySession;

    async fn open_session(
        &self,
        connection: &MemoryConnection,
        mode: SessionMode,
    ) -> Result<MemorySession> {
        let delay = self.state.faults.lock().session_open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut faults = self.state.faults.lock();
            if faults.failing_session_opens > 0 {
                faults.failing_session_opens -= 1;
                return Err(Error::Connectivity("session open refused".to_string()));
            }
            if faults.invalid_connections.contains(&connection.id) {
                return Err(Error::Connectivity(format!(
                    "connection {} is no longer valid",
                    connection.id
                )));
            }
        }

        let core = Arc::new(SessionCore {
            state: Arc::clone(&self.state),
            connection: connection.clone(),
            mode,
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            wake: Notify::new(),
            unacked: Mutex::new(Vec::new()),
            exception_listener: Mutex::new(None),
        });

        {
            let mut sessions = self.state.sessions.lock();
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.push(Arc::downgrade(&core));
        }
        self.state.stats.sessions_opened.fetch_add(1, Ordering::SeqCst);

        Ok(MemorySession { core })
    }

    fn connection_id(&self, connection: &MemoryConnection) -> u64 {
        connection.id
    }
}

struct SessionCore {
    state: Arc<BrokerState>,
    connection: MemoryConnection,
    mode: SessionMode,
    closed: AtomicBool,
    broken: AtomicBool,
    wake: Notify,
    unacked: Mutex<Vec<(String, StoredMessage)>>,
    exception_listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
}

impl SessionCore {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("memory session is closed".to_string()));
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Connectivity("broker session lost".to_string()));
        }
        Ok(())
    }

    fn take(&self, queue: &str, selector: Option<&Selector>) -> Option<RawMessage> {
        let message = {
            let mut queues = self.state.queues.lock();
            let entries = queues.get_mut(queue)?;
            let index = entries
                .iter()
                .position(|m| selector.map_or(true, |s| s.matches(&m.properties)))?;
            entries.remove(index)?
        };

        let raw = message.to_raw();
        match self.mode {
            SessionMode::ClientAcknowledge => {
                self.unacked.lock().push((queue.to_string(), message));
            }
            _ => {
                self.state.stats.acknowledged.fetch_add(1, Ordering::SeqCst);
            }
        }
        Some(raw)
    }

    fn return_unacked(&self) -> usize {
        let returned: Vec<_> = self.unacked.lock().drain(..).collect();
        let count = returned.len();
        if count > 0 {
            let mut queues = self.state.queues.lock();
            for (queue, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queues.entry(queue).or_default().push_front(message);
            }
        }
        if count > 0 {
            self.state.arrivals.notify_waiters();
        }
        count
    }
}

/// Session over a [`MemoryConnection`]
pub struct MemorySession {
    core: Arc<SessionCore>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    type Receiver = MemoryReceiver;

    fn mode(&self) -> SessionMode {
        self.core.mode
    }

    async fn create_receiver(
        &self,
        queue: &str,
        selector: Option<&Selector>,
    ) -> Result<MemoryReceiver> {
        self.core.check_open()?;
        Ok(MemoryReceiver {
            core: Arc::clone(&self.core),
            queue: queue.to_string(),
            selector: selector.cloned(),
            listening: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn browse_count(&self, queue: &str, selector: Option<&Selector>) -> Result<u64> {
        self.core.check_open()?;
        self.core.state.stats.browse_calls.fetch_add(1, Ordering::SeqCst);
        let queues = self.core.state.queues.lock();
        let count = queues.get(queue).map_or(0, |entries| {
            entries
                .iter()
                .filter(|m| selector.map_or(true, |s| s.matches(&m.properties)))
                .count()
        });
        Ok(count as u64)
    }

    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String> {
        self.core.check_open()?;
        let stored = self.core.state.stored(message);
        let id = stored.message_id.clone();
        if self.core.mode == SessionMode::Transacted {
            self.core
                .connection
                .pending
                .lock()
                .push((queue.to_string(), stored));
        } else {
            self.core
                .state
                .queues
                .lock()
                .entry(queue.to_string())
                .or_default()
                .push_back(stored);
            self.core.state.arrivals.notify_waiters();
        }
        Ok(id)
    }

    async fn acknowledge(&self, message: &RawMessage) -> Result<()> {
        self.core.check_open()?;
        if self.core.mode != SessionMode::ClientAcknowledge {
            return Ok(());
        }
        let mut unacked = self.core.unacked.lock();
        let index = unacked
            .iter()
            .position(|(_, m)| m.tag == message.delivery_tag)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "message {:?} is not owned by this session",
                    message.message_id
                ))
            })?;
        unacked.remove(index);
        self.core.state.stats.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.core.check_open()?;
        self.core.state.stats.recover_calls.fetch_add(1, Ordering::SeqCst);
        let returned = self.core.return_unacked();
        debug!(connection = self.core.connection.id, returned, "Recovered memory session");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.core.check_open()?;
        if self.core.mode != SessionMode::Transacted {
            return Err(Error::Validation("session is not transacted".to_string()));
        }
        self.core.connection.commit();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.core.check_open()?;
        if self.core.mode != SessionMode::Transacted {
            return Err(Error::Validation("session is not transacted".to_string()));
        }
        self.core.connection.rollback();
        Ok(())
    }

    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        *self.core.exception_listener.lock() = Some(listener);
    }

    async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.return_unacked();
        self.core.state.stats.sessions_closed.fetch_add(1, Ordering::SeqCst);
        self.core.wake.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

/// Receiver bound to one queue of a [`MemorySession`]
#[derive(Clone)]
pub struct MemoryReceiver {
    core: Arc<SessionCore>,
    queue: String,
    selector: Option<Selector>,
    listening: Arc<AtomicBool>,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&self) -> Result<Option<RawMessage>> {
        loop {
            if self.core.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.core.check_open()?;
            if let Some(message) = self.core.take(&self.queue, self.selector.as_ref()) {
                return Ok(Some(message));
            }
            tokio::select! {
                _ = self.core.state.arrivals.notified() => {}
                _ = self.core.wake.notified() => {}
                _ = tokio::time::sleep(WAKE_INTERVAL) => {}
            }
        }
    }

    async fn receive_no_wait(&self) -> Result<Option<RawMessage>> {
        self.core.check_open()?;
        Ok(self.core.take(&self.queue, self.selector.as_ref()))
    }

    fn set_message_listener(&self, listener: Arc<dyn MessageListener>) -> Result<()> {
        self.core.check_open()?;
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(Error::Validation(format!(
                "a message listener is already set for queue '{}'",
                self.queue
            )));
        }

        let receiver = self.clone();
        tokio::spawn(async move {
            loop {
                match receiver.receive().await {
                    Ok(Some(message)) => listener.on_message(message).await,
                    Ok(None) => break,
                    // Exception listeners were already told by break_sessions
                    Err(_) => break,
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(broker: &MemoryBroker, mode: SessionMode) -> MemorySession {
        let conn = broker.acquire(&PoolKey::Default).await.unwrap();
        broker.open_session(&conn, mode).await.unwrap()
    }

    #[tokio::test]
    async fn test_client_ack_recover_redelivers() {
        let broker = MemoryBroker::new();
        broker.enqueue("Q1", OutgoingMessage::new("a"));

        let session = session(&broker, SessionMode::ClientAcknowledge).await;
        let receiver = session.create_receiver("Q1", None).await.unwrap();

        let first = receiver.receive_no_wait().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.queue_depth("Q1"), 0);

        session.recover().await.unwrap();
        assert_eq!(broker.queue_depth("Q1"), 1);
        assert_eq!(broker.acknowledged_count(), 0);

        let again = receiver.receive_no_wait().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.message_id, first.message_id);

        session.acknowledge(&again).await.unwrap();
        assert_eq!(broker.acknowledged_count(), 1);
        assert!(session.acknowledge(&again).await.is_err());
    }

    #[tokio::test]
    async fn test_selector_filters_and_browse_does_not_consume() {
        let broker = MemoryBroker::new();
        broker.enqueue("Q1", OutgoingMessage::new("a").with_property("CustomerIdentifier", "100"));
        broker.enqueue("Q1", OutgoingMessage::new("b").with_property("CustomerIdentifier", "300"));

        let session = session(&broker, SessionMode::AutoAcknowledge).await;
        let selector = Selector::parse("CustomerIdentifier IN ('100','200')").unwrap();

        assert_eq!(session.browse_count("Q1", Some(&selector)).await.unwrap(), 1);
        assert_eq!(broker.queue_depth("Q1"), 2);

        let receiver = session.create_receiver("Q1", Some(&selector)).await.unwrap();
        assert_eq!(receiver.receive_no_wait().await.unwrap().unwrap().body, "a");
        assert!(receiver.receive_no_wait().await.unwrap().is_none());
        assert_eq!(broker.queued_bodies("Q1"), vec!["b"]);
    }

    #[tokio::test]
    async fn test_transacted_send_waits_for_connection_commit() {
        let broker = MemoryBroker::new();
        let conn = broker.acquire(&PoolKey::Default).await.unwrap();
        let session = broker.open_session(&conn, SessionMode::Transacted).await.unwrap();

        session.send("OUT", OutgoingMessage::new("x")).await.unwrap();
        assert_eq!(broker.queue_depth("OUT"), 0);
        assert_eq!(conn.pending_count(), 1);

        conn.commit();
        assert_eq!(broker.queue_depth("OUT"), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receive() {
        let broker = MemoryBroker::new();
        let session = Arc::new(session(&broker, SessionMode::AutoAcknowledge).await);
        let receiver = session.create_receiver("EMPTY", None).await.unwrap();

        let waiter = tokio::spawn(async move { receiver.receive().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await.unwrap();
        session.close().await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_none());
        assert_eq!(broker.open_session_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = MemoryBroker::new();
        broker.fail_acquires(1);
        assert!(broker.acquire(&PoolKey::Default).await.is_err());

        let conn = broker.acquire(&PoolKey::Default).await.unwrap();
        assert!(broker.is_valid(&conn).await);
        broker.invalidate_connection(&conn);
        assert!(!broker.is_valid(&conn).await);
        assert!(broker
            .open_session(&conn, SessionMode::AutoAcknowledge)
            .await
            .is_err());
    }
}
