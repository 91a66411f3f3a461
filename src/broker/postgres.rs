//! PostgreSQL-hosted broker
//!
//! Queues live in one table. Every session runs over a pooled connection
//! handed to it by the caller:
//!
//! - auto-acknowledge receive deletes the row it returns in one statement
//! - client-acknowledge receive locks the row inside a transaction;
//!   acknowledge deletes it and commits, recover rolls back so the row is
//!   visible to the next receiver
//! - transacted sends insert on the connection without beginning or ending
//!   a transaction, so they commit with the caller's unit of work

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerSession, ExceptionListener, MessageListener, MessageReceiver, Selector,
    SessionMode,
};
use crate::db::{validate_identifier, PgConnection};
use crate::error::{Error, Result};
use crate::types::{MessageProperties, OutgoingMessage, RawMessage};

/// Configuration for [`PgBroker`]
#[derive(Debug, Clone)]
pub struct PgBrokerConfig {
    /// Schema holding the queue table
    pub schema_name: String,

    /// Queue table name
    pub table_name: String,

    /// How often a blocked receive re-checks for new rows
    pub receive_interval: Duration,
}

impl Default for PgBrokerConfig {
    fn default() -> Self {
        Self {
            schema_name: "provbus".to_string(),
            table_name: "queue_messages".to_string(),
            receive_interval: Duration::from_millis(250),
        }
    }
}

impl PgBrokerConfig {
    /// Set the schema name (builder pattern)
    pub fn with_schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    /// Set the queue table name (builder pattern)
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Set the receive polling interval (builder pattern)
    pub fn with_receive_interval(mut self, interval: Duration) -> Self {
        self.receive_interval = interval;
        self
    }
}

/// Broker over a PostgreSQL queue table
#[derive(Debug, Clone)]
pub struct PgBroker {
    table: String,
    schema_name: String,
    table_name: String,
    receive_interval: Duration,
}

impl PgBroker {
    pub fn new(config: PgBrokerConfig) -> Result<Self> {
        validate_identifier(&config.schema_name)?;
        validate_identifier(&config.table_name)?;
        Ok(Self {
            table: format!("{}.{}", config.schema_name, config.table_name),
            schema_name: config.schema_name,
            table_name: config.table_name,
            receive_interval: config.receive_interval,
        })
    }

    /// Create the schema, queue table and index if they do not exist
    pub async fn install_schema(&self, connection: &PgConnection) -> Result<()> {
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {table} (
                 id BIGSERIAL PRIMARY KEY,
                 message_id UUID NOT NULL UNIQUE,
                 queue_name TEXT NOT NULL,
                 properties JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                 body TEXT NOT NULL,
                 redelivered BOOLEAN NOT NULL DEFAULT false,
                 enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
             );
             CREATE INDEX IF NOT EXISTS {name}_queue_idx ON {table} (queue_name, id);",
            schema = self.schema_name,
            table = self.table,
            name = self.table_name,
        );
        connection.batch_execute(&sql).await?;
        Ok(())
    }

    /// Fully qualified queue table name
    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl Broker for PgBroker {
    type Connection = PgConnection;
    type Session = PgSession;

    async fn open_session(&self, connection: &PgConnection, mode: SessionMode) -> Result<PgSession> {
        if connection.is_closed() {
            return Err(Error::Connectivity(
                "database connection closed before session open".to_string(),
            ));
        }

        Ok(PgSession {
            core: Arc::new(SessionCore {
                connection: Arc::clone(connection),
                table: self.table.clone(),
                mode,
                receive_interval: self.receive_interval,
                closed: AtomicBool::new(false),
                wake: Notify::new(),
                locked: tokio::sync::Mutex::new(None),
                exception_listener: Mutex::new(None),
            }),
        })
    }

    fn connection_id(&self, connection: &PgConnection) -> u64 {
        Arc::as_ptr(connection) as usize as u64
    }
}

struct SessionCore {
    connection: PgConnection,
    table: String,
    mode: SessionMode,
    receive_interval: Duration,
    closed: AtomicBool,
    wake: Notify,
    // Row ids locked by the open client-ack transaction, if one is open
    locked: tokio::sync::Mutex<Option<Vec<i64>>>,
    exception_listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
}

fn filter_sql(queue: &str, selector: Option<&Selector>) -> (String, Vec<String>) {
    let mut params = vec![queue.to_string()];
    let mut predicate = "queue_name = $1::text".to_string();
    if let Some(selector) = selector {
        predicate = format!("{} AND {}", predicate, selector.to_sql("properties", &mut params));
    }
    (predicate, params)
}

fn as_sql_params(params: &[String]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn parse_row(row: &Row) -> Result<RawMessage> {
    let tag: i64 = row.try_get("id")?;
    let message_id: Uuid = row.try_get("message_id")?;
    let properties: serde_json::Value = row.try_get("properties")?;
    Ok(RawMessage {
        message_id: Some(message_id.to_string()),
        properties: MessageProperties::from_json(&properties)?,
        body: row.try_get("body")?,
        redelivered: row.try_get("redelivered")?,
        delivery_tag: tag,
    })
}

impl SessionCore {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed("postgres session is closed".to_string()));
        }
        Ok(())
    }

    async fn take(&self, queue: &str, selector: Option<&Selector>) -> Result<Option<RawMessage>> {
        self.check_open()?;
        let (predicate, params) = filter_sql(queue, selector);

        match self.mode {
            SessionMode::ClientAcknowledge => {
                let mut locked = self.locked.lock().await;
                if locked.is_none() {
                    self.connection.batch_execute("BEGIN").await?;
                    *locked = Some(Vec::new());
                }

                let sql = format!(
                    "SELECT id, message_id, properties, body, redelivered FROM {} \
                     WHERE {} ORDER BY id FOR UPDATE SKIP LOCKED LIMIT 1",
                    self.table, predicate
                );
                let rows = match self.connection.query(&sql, &as_sql_params(&params)).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        let _ = self.connection.batch_execute("ROLLBACK").await;
                        *locked = None;
                        return Err(e.into());
                    }
                };

                let held = locked.get_or_insert_with(Vec::new);
                match rows.first() {
                    Some(row) => {
                        let message = parse_row(row)?;
                        held.push(message.delivery_tag);
                        Ok(Some(message))
                    }
                    None => {
                        if held.is_empty() {
                            self.connection.batch_execute("COMMIT").await?;
                            *locked = None;
                        }
                        Ok(None)
                    }
                }
            }
            _ => {
                let sql = format!(
                    "DELETE FROM {table} WHERE id = (\
                         SELECT id FROM {table} WHERE {predicate} \
                         ORDER BY id FOR UPDATE SKIP LOCKED LIMIT 1\
                     ) RETURNING id, message_id, properties, body, redelivered",
                    table = self.table,
                    predicate = predicate
                );
                let rows = self.connection.query(&sql, &as_sql_params(&params)).await?;
                rows.first().map(parse_row).transpose()
            }
        }
    }

    async fn end_locked_transaction(&self, statement: &str) -> Result<Vec<i64>> {
        let mut locked = self.locked.lock().await;
        match locked.take() {
            Some(ids) => {
                self.connection.batch_execute(statement).await?;
                Ok(ids)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn rollback_and_mark_redelivered(&self) -> Result<usize> {
        let ids = self.end_locked_transaction("ROLLBACK").await?;
        if !ids.is_empty() {
            let sql = format!("UPDATE {} SET redelivered = true WHERE id = ANY($1)", self.table);
            self.connection.execute(&sql, &[&ids]).await?;
        }
        Ok(ids.len())
    }
}

/// Session over a pooled PostgreSQL connection
pub struct PgSession {
    core: Arc<SessionCore>,
}

#[async_trait]
impl BrokerSession for PgSession {
    type Receiver = PgReceiver;

    fn mode(&self) -> SessionMode {
        self.core.mode
    }

    async fn create_receiver(&self, queue: &str, selector: Option<&Selector>) -> Result<PgReceiver> {
        self.core.check_open()?;
        Ok(PgReceiver {
            core: Arc::clone(&self.core),
            queue: queue.to_string(),
            selector: selector.cloned(),
            listening: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn browse_count(&self, queue: &str, selector: Option<&Selector>) -> Result<u64> {
        self.core.check_open()?;
        let (predicate, params) = filter_sql(queue, selector);
        let sql = format!("SELECT count(*) FROM {} WHERE {}", self.core.table, predicate);
        let row = self
            .core
            .connection
            .query_one(&sql, &as_sql_params(&params))
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn send(&self, queue: &str, message: OutgoingMessage) -> Result<String> {
        self.core.check_open()?;
        let message_id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO {} (message_id, queue_name, properties, body) VALUES ($1, $2, $3, $4)",
            self.core.table
        );
        let properties = message.properties.to_json();
        self.core
            .connection
            .execute(&sql, &[&message_id, &queue, &properties, &message.body])
            .await?;
        Ok(message_id.to_string())
    }

    async fn acknowledge(&self, message: &RawMessage) -> Result<()> {
        self.core.check_open()?;
        if self.core.mode != SessionMode::ClientAcknowledge {
            return Ok(());
        }

        let mut locked = self.core.locked.lock().await;
        let held = locked.as_mut().ok_or_else(|| {
            Error::Validation(format!(
                "message {:?} is not owned by this session",
                message.message_id
            ))
        })?;
        let index = held
            .iter()
            .position(|id| *id == message.delivery_tag)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "message {:?} is not owned by this session",
                    message.message_id
                ))
            })?;

        let sql = format!("DELETE FROM {} WHERE id = $1", self.core.table);
        self.core
            .connection
            .execute(&sql, &[&message.delivery_tag])
            .await?;
        held.remove(index);

        if held.is_empty() {
            self.core.connection.batch_execute("COMMIT").await?;
            *locked = None;
        }
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.core.check_open()?;
        let returned = self.core.rollback_and_mark_redelivered().await?;
        debug!(table = %self.core.table, returned, "Recovered postgres session");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.core.check_open()?;
        if self.core.mode != SessionMode::Transacted {
            return Err(Error::Validation("session is not transacted".to_string()));
        }
        self.core.connection.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.core.check_open()?;
        if self.core.mode != SessionMode::Transacted {
            return Err(Error::Validation("session is not transacted".to_string()));
        }
        self.core.connection.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        *self.core.exception_listener.lock() = Some(listener);
    }

    async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.wake.notify_waiters();
        if self.core.mode == SessionMode::ClientAcknowledge {
            self.core.rollback_and_mark_redelivered().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

/// Receiver bound to one queue of a [`PgSession`]
#[derive(Clone)]
pub struct PgReceiver {
    core: Arc<SessionCore>,
    queue: String,
    selector: Option<Selector>,
    listening: Arc<AtomicBool>,
}

#[async_trait]
impl MessageReceiver for PgReceiver {
    async fn receive(&self) -> Result<Option<RawMessage>> {
        loop {
            if self.core.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(message) = self.core.take(&self.queue, self.selector.as_ref()).await? {
                return Ok(Some(message));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.core.receive_interval) => {}
                _ = self.core.wake.notified() => {}
            }
        }
    }

    async fn receive_no_wait(&self) -> Result<Option<RawMessage>> {
        self.core.take(&self.queue, self.selector.as_ref()).await
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
                    Err(e) => {
                        if receiver.core.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let exception_listener = receiver.core.exception_listener.lock().clone();
                        match exception_listener {
                            Some(exception_listener) => exception_listener.on_exception(e),
                            None => warn!(queue = %receiver.queue, error = %e, "Push delivery stopped"),
                        }
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsafe_table_names() {
        assert!(PgBroker::new(PgBrokerConfig::default().with_table_name("q; drop")).is_err());
        assert!(PgBroker::new(PgBrokerConfig::default().with_schema_name("")).is_err());

        let broker = PgBroker::new(PgBrokerConfig::default()).unwrap();
        assert_eq!(broker.table(), "provbus.queue_messages");
    }

    #[test]
    fn test_filter_sql_with_selector() {
        let selector = Selector::parse("SERVICE_TYPE = 'SOA'").unwrap();
        let (predicate, params) = filter_sql("EVENTS", Some(&selector));

        assert_eq!(
            predicate,
            "queue_name = $1::text AND ((properties ->> $2::text) = $3::text)"
        );
        assert_eq!(params, vec!["EVENTS", "SERVICE_TYPE", "SOA"]);
    }

    #[test]
    fn test_filter_sql_without_selector() {
        let (predicate, params) = filter_sql("EVENTS", None);
        assert_eq!(predicate, "queue_name = $1::text");
        assert_eq!(params, vec!["EVENTS"]);
    }
}
