use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::db::DatabaseConfig;
use crate::error::{Error, Result};

/// Selects which resource pool an acquire or release call targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKey {
    #[default]
    Default,
    Named(String),
}

impl PoolKey {
    pub fn named(name: impl Into<String>) -> Self {
        PoolKey::Named(name.into())
    }

    /// Map an optional configured key to a pool key; blank means default
    pub fn from_option(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some(name) if !name.is_empty() => PoolKey::Named(name.to_string()),
            _ => PoolKey::Default,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, PoolKey::Default)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::Default => write!(f, "default"),
            PoolKey::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Source of database connections shared by consumers and producers
///
/// The pool key is always an explicit argument, so concurrent callers
/// targeting different pools never observe each other's selection.
#[async_trait]
pub trait ResourcePool: Send + Sync {
    type Connection: Clone + Send + Sync + 'static;

    async fn acquire(&self, key: &PoolKey) -> Result<Self::Connection>;

    async fn release(&self, key: &PoolKey, connection: Self::Connection);

    /// Whether the connection can still carry broker traffic
    async fn is_valid(&self, connection: &Self::Connection) -> bool;
}

/// A pooled PostgreSQL connection shared between a broker connection and
/// the sessions opened over it
pub type PgConnection = Arc<Object>;

/// Registry of deadpool pools keyed by [`PoolKey`]
#[derive(Clone)]
pub struct PgResourcePool {
    pools: HashMap<PoolKey, Pool>,
}

impl PgResourcePool {
    pub fn new(default_pool: Pool) -> Self {
        let mut pools = HashMap::new();
        pools.insert(PoolKey::Default, default_pool);
        Self { pools }
    }

    /// Register an alternate pool (builder pattern)
    pub fn with_pool(mut self, key: PoolKey, pool: Pool) -> Self {
        self.pools.insert(key, pool);
        self
    }

    /// Build the default pool and every named alternate pool
    pub fn from_configs(
        default_config: &DatabaseConfig,
        alternates: &HashMap<String, DatabaseConfig>,
    ) -> Result<Self> {
        let mut registry = Self::new(default_config.build_pool()?);
        for (name, config) in alternates {
            registry = registry.with_pool(PoolKey::named(name.clone()), config.build_pool()?);
        }
        Ok(registry)
    }

    pub fn pool(&self, key: &PoolKey) -> Result<&Pool> {
        self.pools
            .get(key)
            .ok_or_else(|| Error::Config(format!("No resource pool registered for key '{}'", key)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &PoolKey> {
        self.pools.keys()
    }
}

#[async_trait]
impl ResourcePool for PgResourcePool {
    type Connection = PgConnection;

    async fn acquire(&self, key: &PoolKey) -> Result<PgConnection> {
        let object = self
            .pool(key)?
            .get()
            .await
            .map_err(|e| Error::connectivity(&format!("acquire from pool '{}'", key), e))?;
        Ok(Arc::new(object))
    }

    async fn release(&self, key: &PoolKey, connection: PgConnection) {
        // The object returns to its pool once the last handle drops
        debug!(pool = %key, handles = Arc::strong_count(&connection), "Releasing database connection");
        drop(connection);
    }

    async fn is_valid(&self, connection: &PgConnection) -> bool {
        !connection.is_closed() && connection.simple_query("SELECT 1").await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key_from_option() {
        assert_eq!(PoolKey::from_option(None), PoolKey::Default);
        assert_eq!(PoolKey::from_option(Some("  ")), PoolKey::Default);
        assert_eq!(PoolKey::from_option(Some("ALT_DB")), PoolKey::named("ALT_DB"));
    }

    #[test]
    fn test_pool_key_display() {
        assert_eq!(PoolKey::Default.to_string(), "default");
        assert_eq!(PoolKey::named("ALT_DB").to_string(), "ALT_DB");
        assert!(PoolKey::Default.is_default());
    }

    #[tokio::test]
    async fn test_unknown_key_is_config_error() {
        let pool = DatabaseConfig::default().build_pool().unwrap();
        let registry = PgResourcePool::new(pool);

        let result = registry.acquire(&PoolKey::named("missing")).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
