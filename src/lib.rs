//! Provisioning message bus consumers and producers
//!
//! Consumers dequeue from database-hosted broker queues in push, pull or
//! poll mode, store client-acknowledged messages before acknowledging them,
//! and dispatch to a downstream [`pipeline::Pipeline`] inline or through a
//! bounded [`worker_pool::WorkerPool`]. Servers group consumers per queue or
//! per tenant event queue; producers send with plain, transactional or
//! alternate-database sessions.

pub mod broker;
pub mod consumer;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod producer;
pub mod router;
pub mod settings;
pub mod store;
pub mod tenant;
pub mod types;
pub mod worker_pool;

pub use error::{Error, Result};
