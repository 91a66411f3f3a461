//! Configuration loading
//!
//! Settings come from an optional TOML file overridden by environment
//! variables: `PROVBUS__DATABASE__URL`, `PROVBUS__SERVER__CLIENT_ACK`,
//! `PROVBUS__PRODUCER__QUEUE_NAME` and so on. Durations are given in
//! milliseconds.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::consumer::{AckMode, ConsumerConfig, DeliveryMode};
use crate::db::{DatabaseConfig, PgResourcePool, PoolKey};
use crate::error::{Error, Result};
use crate::producer::ProducerConfig;
use crate::router::ServerConfig;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "PROVBUS";

/// `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Database section: the default pool and named alternates
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Default pool URL; `postgres://` or `postgresql://`
    pub url: Option<String>,

    pub schema_name: String,

    pub max_pool_size: usize,

    /// Alternate pool URLs by pool key
    pub alternates: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            url: None,
            schema_name: defaults.schema_name,
            max_pool_size: defaults.max_pool_size,
            alternates: HashMap::new(),
        }
    }
}

impl DatabaseSettings {
    fn pool_config(&self, url: Option<&str>) -> Result<DatabaseConfig> {
        let config = match url {
            Some(url) => DatabaseConfig::from_connection_string(url)?,
            None => DatabaseConfig::default(),
        };
        Ok(config
            .with_schema_name(self.schema_name.clone())
            .with_max_pool_size(self.max_pool_size))
    }

    pub fn default_config(&self) -> Result<DatabaseConfig> {
        self.pool_config(self.url.as_deref())
    }

    pub fn alternate_configs(&self) -> Result<HashMap<String, DatabaseConfig>> {
        self.alternates
            .iter()
            .map(|(name, url)| Ok((name.clone(), self.pool_config(Some(url))?)))
            .collect()
    }

    /// Build the default and alternate connection pools
    pub fn build_resource_pool(&self) -> Result<PgResourcePool> {
        let pools = PgResourcePool::from_configs(&self.default_config()?, &self.alternate_configs()?)?;
        info!(
            pools = pools.keys().count(),
            schema = %self.schema_name,
            "Resource pools created"
        );
        Ok(pools)
    }
}

/// One explicitly configured consumer; unset fields take the server's
/// defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub selector: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub client_ack: Option<bool>,
    pub tenant_id: Option<String>,
    pub alternate_pool_key: Option<String>,
}

impl ConsumerSettings {
    pub fn to_config(&self, server: &ServerConfig) -> ConsumerConfig {
        let mut config = server.consumer_config(&self.queue_name, self.selector.clone());
        if let Some(mode) = self.delivery_mode {
            config = config.with_delivery_mode(mode);
        }
        if let Some(client_ack) = self.client_ack {
            config = config.with_ack_mode(if client_ack {
                AckMode::Client
            } else {
                AckMode::Auto
            });
        }
        if let Some(tenant) = &self.tenant_id {
            config = config.with_tenant_id(tenant.clone());
        }
        if self.alternate_pool_key.is_some() {
            config = config.with_pool_key(PoolKey::from_option(self.alternate_pool_key.as_deref()));
        }
        config
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub server: ServerConfig,
    pub consumers: Vec<ConsumerSettings>,
    pub producer: ProducerConfig,
}

impl Settings {
    /// Load from an optional file plus `PROVBUS__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load from an optional file plus `<prefix>__*` environment variables
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading settings file");
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.producer.validate()?;
        self.database.default_config()?;
        self.database.alternate_configs()?;
        for consumer in &self.consumers {
            consumer.to_config(&self.server).validate().map_err(|e| {
                Error::Config(format!("consumer for queue '{}': {}", consumer.queue_name, e))
            })?;
        }
        Ok(())
    }

    /// Consumer configurations of the explicitly listed consumers
    pub fn consumer_configs(&self) -> Vec<ConsumerConfig> {
        self.consumers
            .iter()
            .map(|consumer| consumer.to_config(&self.server))
            .collect()
    }
}
