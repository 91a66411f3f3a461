//! Consumer servers and tenant routing
//!
//! A server owns a set of consumers built from shared defaults: either one
//! per configured queue, or one per tenant event queue with an IN-list
//! selector over the tenants sharing that queue. After dequeue,
//! [`TenantRoutingPipeline`] recovers the tenant keys from the message
//! header into the per-message context.

pub mod routing;
pub mod server;
pub mod tenants;

pub use routing::{EndpointDirectory, StaticEndpointDirectory, TenantRoutingPipeline};
pub use server::{service_type_selector, ConsumerServer, ServerConfig};
pub use tenants::{TenantPlan, TenantSelector};
