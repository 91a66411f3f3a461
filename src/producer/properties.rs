//! Value locations and outgoing header composition
//!
//! A location is either `@context.<key>`, read from the per-message
//! [`RequestContext`], or a plain name, read from the input properties.
//! Several alternative locations can be given in one string, separated by
//! the producer's separator.

use tracing::debug;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::producer::config::ProducerConfig;
use crate::types::{names, MessageProperties};

/// Prefix of locations read from the request context
pub const CONTEXT_PREFIX: &str = "@context.";

/// Context entry naming the gateway instance that processed the message
pub const PROCESSED_BY: &str = "PROCESSED_BY_GWS";

/// The context and input properties of one send
#[derive(Debug, Clone, Copy)]
pub struct Sources<'a> {
    pub context: &'a RequestContext,
    pub input: &'a MessageProperties,
}

impl<'a> Sources<'a> {
    pub fn new(context: &'a RequestContext, input: &'a MessageProperties) -> Self {
        Self { context, input }
    }

    /// Non-empty value at a single location
    pub fn lookup(&self, location: &str) -> Option<String> {
        let value = match location.strip_prefix(CONTEXT_PREFIX) {
            Some(key) => context_value(self.context, key),
            None => self.input.get(location),
        };
        value.filter(|v| !v.is_empty()).map(str::to_string)
    }

    /// First non-empty value among `separator`-delimited locations
    pub fn first(&self, locations: &str, separator: &str) -> Option<String> {
        locations
            .split(separator)
            .map(str::trim)
            .filter(|location| !location.is_empty())
            .find_map(|location| self.lookup(location))
    }
}

fn context_value<'c>(ctx: &'c RequestContext, key: &str) -> Option<&'c str> {
    match key {
        "message_id" => Some(ctx.message_id.as_str()),
        "queue_name" => ctx.queue_name.as_deref(),
        "message_store_table" => ctx.message_store_table.as_deref(),
        "customer_id" => ctx.customer_id.as_deref(),
        "interface_version" => ctx.interface_version.as_deref(),
        "supplier" => ctx.supplier.as_deref(),
        "transaction" => ctx.transaction.as_deref(),
        "channel_name" => ctx.channel_name.as_deref(),
        "channel_name_base" => ctx.channel_name_base.as_deref(),
        other => ctx.get(other),
    }
}

/// Configured header properties plus the retry count
///
/// Event channel names get the `_<customer>` suffix, whether resolved or
/// defaulted. A required property without any value is a validation error.
pub fn compose(
    config: &ProducerConfig,
    sources: &Sources<'_>,
    customer: Option<&str>,
) -> Result<MessageProperties> {
    let mut properties = MessageProperties::new();

    for spec in &config.properties {
        let value = spec
            .location
            .as_deref()
            .and_then(|locations| sources.first(locations, &config.separator))
            .or_else(|| spec.default.clone());

        let Some(mut value) = value else {
            if spec.optional {
                debug!(property = %spec.name, "Optional message property has no value");
                continue;
            }
            return Err(Error::Validation(format!(
                "no value for required message property '{}' (location {:?})",
                spec.name, spec.location
            )));
        };

        if spec.name == names::EVENT_CHANNEL_NAME {
            let customer = customer.ok_or_else(|| {
                Error::Validation(format!(
                    "message property '{}' needs a customer id",
                    names::EVENT_CHANNEL_NAME
                ))
            })?;
            value = format!("{}_{}", value, customer);
        }
        properties.insert(spec.name.clone(), value);
    }

    properties.insert(names::RETRY_COUNT, next_retry_count(config, sources));

    if let Some(processed_by) = sources.context.get(PROCESSED_BY) {
        properties.insert(PROCESSED_BY, processed_by);
    }
    Ok(properties)
}

fn next_retry_count(config: &ProducerConfig, sources: &Sources<'_>) -> String {
    config
        .retry_count_location
        .as_deref()
        .and_then(|location| sources.lookup(location))
        .and_then(|previous| previous.trim().parse::<i64>().ok())
        .map(|previous| (previous + 1).to_string())
        .unwrap_or_else(|| "0".to_string())
}
