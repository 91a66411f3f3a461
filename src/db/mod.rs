//! PostgreSQL connection configuration, keyed resource pools and units of work

pub mod connection;
pub mod pool;
pub mod transaction;

pub use connection::{validate_identifier, DatabaseConfig};
pub use pool::{PgConnection, PgResourcePool, PoolKey, ResourcePool};
pub use transaction::UnitOfWork;
