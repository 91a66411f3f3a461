//! Poll-mode bounded draining
//!
//! Every tick opens a fresh connection, session and receiver, counts the
//! matching messages with a non-consuming browse and issues exactly that
//! many non-blocking receives. Messages arriving mid-drain wait for the
//! next tick. The tick's resources are released whatever the outcome.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerSession, MessageReceiver};
use crate::consumer::consumer::{Consumer, ConsumerShared};
use crate::consumer::delivery::DeliveryOutcome;
use crate::error::{Error, Result};

impl<B: Broker> Consumer<B> {
    /// Run one poll tick now; returns the number of messages received
    pub async fn poll_once(&self) -> Result<usize> {
        self.shared.poll_tick().await
    }
}

impl<B: Broker> ConsumerShared<B> {
    pub(super) async fn poll_loop(self: Arc<Self>, generation: u64) {
        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(queue = %self.config.queue_name, "Poll loop started");

        loop {
            let stopped = self.stop.notified();
            if !self.is_current(generation) {
                break;
            }
            tokio::select! {
                _ = stopped => continue,
                _ = ticker.tick() => {}
            }
            if !self.is_current(generation) {
                break;
            }

            match self.poll_tick().await {
                Ok(0) => {}
                Ok(received) => debug!(queue = %self.config.queue_name, received, "Poll tick drained"),
                Err(e) => warn!(queue = %self.config.queue_name, error = %e, "Poll tick failed"),
            }
        }
        debug!(queue = %self.config.queue_name, "Poll loop stopped");
    }

    pub(super) async fn poll_tick(&self) -> Result<usize> {
        let key = &self.config.pool_key;
        let connection = self.resources.pool.acquire(key).await?;
        let result = self.drain(&connection).await;
        self.resources.pool.release(key, connection).await;
        result
    }

    async fn drain(&self, connection: &B::Connection) -> Result<usize> {
        let session = self
            .resources
            .broker
            .open_session(connection, self.session_mode())
            .await?;
        let result = self.drain_session(&session).await;
        if let Err(e) = session.close().await {
            debug!(queue = %self.config.queue_name, error = %e, "Ignoring error closing poll session");
        }
        result
    }

    async fn drain_session(&self, session: &B::Session) -> Result<usize> {
        let queue = &self.config.queue_name;
        let receiver = session.create_receiver(queue, self.selector.as_ref()).await?;
        let available = session.browse_count(queue, self.selector.as_ref()).await?;

        let mut received = 0;
        for _ in 0..available {
            if self.disconnecting.load(Ordering::SeqCst) {
                break;
            }
            let Some(message) = receiver.receive_no_wait().await? else {
                continue;
            };
            received += 1;
            if self.deliver(session, message).await == DeliveryOutcome::AcknowledgeFailed {
                return Err(Error::Connectivity(format!(
                    "acknowledge failed while draining queue '{}'",
                    queue
                )));
            }
        }
        Ok(received)
    }
}
