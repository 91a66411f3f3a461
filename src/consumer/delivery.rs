//! Store-then-acknowledge delivery and pipeline dispatch
//!
//! With client acknowledgment a message is inserted into the message store
//! before it is acknowledged. A refused or failed insert recovers the
//! session so the broker redelivers the message; it is never acknowledged
//! and never reaches the pipeline. Once stored and acknowledged, pipeline
//! failures are only logged: the stored record is the source for
//! reprocessing, not broker redelivery.
//!
//! A duplicate insert means an earlier attempt stored the message and then
//! lost its acknowledgment. The message is acknowledged and dispatched now:
//! dispatch only ever follows a successful acknowledgment, so the earlier
//! attempt never reached the pipeline.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerSession};
use crate::consumer::config::AckMode;
use crate::consumer::consumer::ConsumerShared;
use crate::context::RequestContext;
use crate::store::StoreOutcome;
use crate::types::{names, MessageEnvelope, MessageStoreRecord, RawMessage};

/// What happened to one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the worker pool
    Dispatched,

    /// Processed on the receiving task
    ProcessedInline,

    /// Not stored; the session was recovered for redelivery
    Recovered,

    /// Stored, but the acknowledgment failed; not dispatched
    AcknowledgeFailed,

    /// The worker pool could not take the message; logged and dropped
    Dropped,
}

impl<B: Broker> ConsumerShared<B> {
    pub(super) async fn deliver(&self, session: &B::Session, message: RawMessage) -> DeliveryOutcome {
        let envelope = MessageEnvelope::from_raw(&message);

        if self.config.ack_mode == AckMode::Client {
            let record = self.store_record(&envelope);
            let outcome = match self.resources.store.insert(&record).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        queue = %self.config.queue_name,
                        message_id = %envelope.message_id,
                        error = %e,
                        "Message store insert failed"
                    );
                    StoreOutcome::Refused
                }
            };

            if outcome == StoreOutcome::Duplicate {
                info!(
                    queue = %self.config.queue_name,
                    message_id = %envelope.message_id,
                    redelivered = message.redelivered,
                    "Message already stored by an unacknowledged attempt; acknowledging"
                );
            }
            if !outcome.is_stored() {
                warn!(
                    queue = %self.config.queue_name,
                    message_id = %envelope.message_id,
                    "Message not stored; recovering session for redelivery"
                );
                if let Err(e) = session.recover().await {
                    error!(queue = %self.config.queue_name, error = %e, "Session recover failed");
                }
                return DeliveryOutcome::Recovered;
            }

            if let Err(e) = session.acknowledge(&message).await {
                error!(
                    queue = %self.config.queue_name,
                    message_id = %envelope.message_id,
                    error = %e,
                    "Acknowledge failed after the message was stored"
                );
                return DeliveryOutcome::AcknowledgeFailed;
            }
        }

        self.dispatch(envelope).await
    }

    fn store_record(&self, envelope: &MessageEnvelope) -> MessageStoreRecord {
        let mut record = MessageStoreRecord::new(
            envelope,
            self.config.queue_name.clone(),
            self.config.consumer_name.clone(),
        );
        let tenant = self
            .config
            .tenant_id
            .as_deref()
            .or_else(|| envelope.header.get_non_empty(names::CUSTOMER_IDENTIFIER));
        if let Some(tenant) = tenant {
            record = record.with_tenant_id(tenant);
        }
        if let Some(owner) = &self.config.owner_name {
            record = record.with_owner_name(owner.clone());
        }
        record
    }

    async fn dispatch(&self, envelope: MessageEnvelope) -> DeliveryOutcome {
        let message_id = envelope.message_id.clone();
        let task = self.processing_task(envelope);

        let workers = self.workers.lock().clone();
        match workers {
            Some(workers) => match workers.submit(task).await {
                Ok(()) => DeliveryOutcome::Dispatched,
                Err(e) => {
                    error!(
                        queue = %self.config.queue_name,
                        message_id = %message_id,
                        error = %e,
                        "Dropping message the worker pool could not take"
                    );
                    DeliveryOutcome::Dropped
                }
            },
            None => {
                task.await;
                DeliveryOutcome::ProcessedInline
            }
        }
    }

    /// Pipeline call for one message with its own fresh context
    fn processing_task(&self, envelope: MessageEnvelope) -> impl Future<Output = ()> + Send + 'static {
        let pipeline = Arc::clone(&self.resources.pipeline);
        let queue = self.config.queue_name.clone();

        let mut ctx = RequestContext::for_message(envelope.message_id.clone(), queue.clone());
        let table = self
            .config
            .message_store_table
            .clone()
            .or_else(|| self.resources.store.table_name().map(str::to_string));
        if let Some(table) = table {
            ctx = ctx.with_message_store_table(table);
        }
        if let Some(tenant) = &self.config.tenant_id {
            ctx = ctx.with_customer_id(tenant.clone());
        }

        async move {
            let result = AssertUnwindSafe(pipeline.process(&ctx, &envelope.header, &envelope.body))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {
                    debug!(queue = %queue, message_id = %ctx.message_id, "Message processed");
                }
                Ok(Err(e)) => {
                    error!(
                        queue = %queue,
                        message_id = %ctx.message_id,
                        error = %e,
                        "Pipeline failed; message remains in the message store"
                    );
                }
                Err(_) => {
                    error!(queue = %queue, message_id = %ctx.message_id, "Pipeline panicked");
                }
            }
        }
    }
}
