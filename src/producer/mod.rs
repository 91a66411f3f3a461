//! Queue producers
//!
//! The destination queue is resolved per message (location, static name,
//! tenant event queue), and the outgoing header is composed from configured
//! property tuples plus automatic tenant, correlation and service type
//! entries. See [`Producer`] for the session kinds.

pub mod config;
#[allow(clippy::module_inception)]
pub mod producer;
pub mod properties;

pub use config::{ProducerConfig, PropertySpec, DEFAULT_SEPARATOR};
pub use producer::{ProduceRequest, Producer, SendOutcome};
pub use properties::{Sources, CONTEXT_PREFIX};
