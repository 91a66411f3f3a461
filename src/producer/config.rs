use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::names;

/// Default separator between alternative locations
pub const DEFAULT_SEPARATOR: &str = "|";

/// One configured outgoing header property
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PropertySpec {
    /// Header property name
    pub name: String,

    /// Alternative locations of the value, separated by the producer's
    /// separator; the first one holding a non-empty value wins
    #[serde(default)]
    pub location: Option<String>,

    /// Value used when no location holds one
    #[serde(default)]
    pub default: Option<String>,

    /// A missing value is an error unless the property is optional
    #[serde(default)]
    pub optional: bool,
}

impl PropertySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
            default: None,
            optional: false,
        }
    }

    /// Set the value location(s) (builder pattern)
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the default value (builder pattern)
    pub fn or_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Mark the property optional (builder pattern)
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Producer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Static destination queue
    pub queue_name: Option<String>,

    /// Location of a per-message destination queue; takes precedence
    pub queue_name_location: Option<String>,

    pub properties: Vec<PropertySpec>,

    /// Location of the previous retry count
    pub retry_count_location: Option<String>,

    /// Add the tenant identifier header automatically
    pub use_customer_id: bool,

    /// Skip sends for tenants that are not API customers
    pub lookup_domain_api_flag: bool,

    /// Add the tenant's service type header
    pub set_service_type: bool,

    /// Send inside the caller's unit of work
    #[serde(alias = "transactional_logging")]
    pub transactional: bool,

    pub separator: String,

    /// Location of the resource pool key of an alternate database
    pub alternate_pool_key_location: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue_name: None,
            queue_name_location: None,
            properties: Vec::new(),
            retry_count_location: None,
            use_customer_id: true,
            lookup_domain_api_flag: false,
            set_service_type: true,
            transactional: false,
            separator: DEFAULT_SEPARATOR.to_string(),
            alternate_pool_key_location: None,
        }
    }
}

impl ProducerConfig {
    /// Producer sending to a static queue
    pub fn for_queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
            ..Default::default()
        }
    }

    /// Add a header property (builder pattern)
    pub fn with_property(mut self, property: PropertySpec) -> Self {
        self.properties.push(property);
        self
    }

    /// Send inside the caller's unit of work (builder pattern)
    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(Error::Config("location separator must not be empty".to_string()));
        }
        if let Some(property) = self.properties.iter().find(|p| p.name.trim().is_empty()) {
            return Err(Error::Config(format!(
                "message property with location {:?} has no name",
                property.location
            )));
        }
        Ok(())
    }

    /// Whether a configured property supplies the tenant identifier itself
    pub(crate) fn configures_customer_id(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p.name == names::CUSTOMER_IDENTIFIER)
    }
}
