//! Tenant identity recovery from message headers

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::types::{names, MessageProperties};

const EVENT_CHANNEL_MARKER: &str = "EventChannel_";
const PN_MARKER: &str = ".PN_";

/// Lookup of tenant callback endpoints
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    async fn callback_url(
        &self,
        customer: &str,
        supplier: &str,
        transaction: &str,
        interface_version: &str,
    ) -> Result<Option<String>>;
}

type EndpointKey = (String, String, String, String);

/// Endpoint directory held in memory
#[derive(Default)]
pub struct StaticEndpointDirectory {
    urls: RwLock<HashMap<EndpointKey, String>>,
}

impl StaticEndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback URL (builder pattern)
    pub fn with_url(
        self,
        customer: &str,
        supplier: &str,
        transaction: &str,
        interface_version: &str,
        url: impl Into<String>,
    ) -> Self {
        self.urls.write().insert(
            (
                customer.to_string(),
                supplier.to_string(),
                transaction.to_string(),
                interface_version.to_string(),
            ),
            url.into(),
        );
        self
    }
}

#[async_trait]
impl EndpointDirectory for StaticEndpointDirectory {
    async fn callback_url(
        &self,
        customer: &str,
        supplier: &str,
        transaction: &str,
        interface_version: &str,
    ) -> Result<Option<String>> {
        let key = (
            customer.to_string(),
            supplier.to_string(),
            transaction.to_string(),
            interface_version.to_string(),
        );
        Ok(self.urls.read().get(&key).cloned())
    }
}

/// Customer id embedded in a channel name after `EventChannel_` or `.PN_`
pub fn channel_customer_id(channel: &str) -> Option<&str> {
    let cid = match channel.find(EVENT_CHANNEL_MARKER) {
        Some(at) => &channel[at + EVENT_CHANNEL_MARKER.len()..],
        None => {
            let at = channel.find(PN_MARKER)?;
            &channel[at + PN_MARKER.len()..]
        }
    };
    (!cid.is_empty()).then_some(cid)
}

/// Channel name without its trailing `_<customer>` suffix
pub fn channel_name_base<'a>(channel: &'a str, customer: Option<&str>) -> &'a str {
    let Some(customer) = channel_customer_id(channel).or(customer) else {
        return channel;
    };
    channel
        .strip_suffix(customer)
        .and_then(|rest| rest.strip_suffix('_'))
        .unwrap_or(channel)
}

/// Pipeline decorator that fills the tenant keys of the context from the
/// message header before calling the inner pipeline
pub struct TenantRoutingPipeline {
    inner: Arc<dyn Pipeline>,
    endpoints: Option<Arc<dyn EndpointDirectory>>,
    message_store_table: Option<String>,
}

impl TenantRoutingPipeline {
    pub fn new(inner: Arc<dyn Pipeline>) -> Self {
        Self {
            inner,
            endpoints: None,
            message_store_table: None,
        }
    }

    /// Resolve callback URLs through `endpoints` (builder pattern)
    pub fn with_endpoints(mut self, endpoints: Arc<dyn EndpointDirectory>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Message store table placed into every context (builder pattern)
    pub fn with_message_store_table(mut self, table: impl Into<String>) -> Self {
        self.message_store_table = Some(table.into());
        self
    }

    async fn route(&self, ctx: &RequestContext, header: &MessageProperties) -> RequestContext {
        let mut ctx = ctx.clone();
        let text = |name: &str| header.get_non_empty(name).map(str::to_string);

        ctx.interface_version = text(names::INTERFACE_VERSION);
        ctx.supplier = text(names::SUPPLIER);
        ctx.transaction = text(names::TRANSACTION);
        if ctx.customer_id.is_none() {
            ctx.customer_id = text(names::CUSTOMER_IDENTIFIER);
        }
        if let Some(table) = &self.message_store_table {
            ctx.message_store_table = Some(table.clone());
        }

        let Some(channel) = text(names::EVENT_CHANNEL_NAME) else {
            return ctx;
        };
        let base = channel_name_base(&channel, ctx.customer_id.as_deref()).to_string();
        ctx.channel_name = Some(channel);
        ctx.channel_name_base = Some(base.clone());

        if let Some(url) = self.callback_url(&ctx).await {
            ctx.set(base.replace('.', "_"), url);
        }
        ctx
    }

    async fn callback_url(&self, ctx: &RequestContext) -> Option<String> {
        let endpoints = self.endpoints.as_ref()?;
        let (Some(customer), Some(supplier), Some(transaction), Some(version)) = (
            ctx.customer_id.as_deref(),
            ctx.supplier.as_deref(),
            ctx.transaction.as_deref(),
            ctx.interface_version.as_deref(),
        ) else {
            return None;
        };

        match endpoints
            .callback_url(customer, supplier, transaction, version)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    message_id = %ctx.message_id,
                    customer = %customer,
                    error = %e,
                    "Callback URL lookup failed"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Pipeline for TenantRoutingPipeline {
    async fn process(
        &self,
        ctx: &RequestContext,
        header: &MessageProperties,
        body: &str,
    ) -> std::result::Result<(), PipelineError> {
        let routed = self.route(ctx, header).await;
        debug!(
            message_id = %routed.message_id,
            customer = ?routed.customer_id,
            channel = ?routed.channel_name_base,
            "Routing message"
        );
        self.inner.process(&routed, header, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pipeline_fn;
    use parking_lot::Mutex;

    #[test]
    fn test_channel_customer_id() {
        assert_eq!(channel_customer_id("SOA.EventChannel_100"), Some("100"));
        assert_eq!(channel_customer_id("LSR.PN_200"), Some("200"));
        assert_eq!(channel_customer_id("LSR.EventChannel_"), None);
        assert_eq!(channel_customer_id("plain"), None);
    }

    #[test]
    fn test_channel_name_base() {
        assert_eq!(channel_name_base("SOA.EventChannel_100", None), "SOA.EventChannel");
        assert_eq!(channel_name_base("LSR.PN_200", None), "LSR.PN");
        assert_eq!(channel_name_base("notify_300", Some("300")), "notify");
        assert_eq!(channel_name_base("notify", Some("300")), "notify");
    }

    #[tokio::test]
    async fn test_routing_fills_context() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = Arc::clone(&seen);
        let inner = pipeline_fn(move |ctx, _, _| {
            let recorder = Arc::clone(&recorder);
            async move {
                *recorder.lock() = Some(ctx);
                Ok(())
            }
        });
        let endpoints = StaticEndpointDirectory::new().with_url(
            "100",
            "NEUSTAR",
            "SOA",
            "1.0",
            "http://gw/soa",
        );
        let pipeline = TenantRoutingPipeline::new(inner)
            .with_endpoints(Arc::new(endpoints))
            .with_message_store_table("jms_msg_store");

        let header = MessageProperties::new()
            .with(names::CUSTOMER_IDENTIFIER, "100")
            .with(names::SUPPLIER, "NEUSTAR")
            .with(names::TRANSACTION, "SOA")
            .with(names::INTERFACE_VERSION, "1.0")
            .with(names::EVENT_CHANNEL_NAME, "SOA.EventChannel_100");
        let ctx = RequestContext::for_message("ID:1", "Q1");
        pipeline.process(&ctx, &header, "body").await.unwrap();

        let routed = seen.lock().take().unwrap();
        assert_eq!(routed.customer_id.as_deref(), Some("100"));
        assert_eq!(routed.supplier.as_deref(), Some("NEUSTAR"));
        assert_eq!(routed.channel_name.as_deref(), Some("SOA.EventChannel_100"));
        assert_eq!(routed.channel_name_base.as_deref(), Some("SOA.EventChannel"));
        assert_eq!(routed.get("SOA_EventChannel"), Some("http://gw/soa"));
        assert_eq!(routed.message_store_table.as_deref(), Some("jms_msg_store"));
        assert!(ctx.customer_id.is_none());
    }

    #[tokio::test]
    async fn test_routing_without_channel_leaves_base_unset() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = Arc::clone(&seen);
        let inner = pipeline_fn(move |ctx, _, _| {
            let recorder = Arc::clone(&recorder);
            async move {
                *recorder.lock() = Some(ctx);
                Ok(())
            }
        });
        let pipeline = TenantRoutingPipeline::new(inner);

        let header = MessageProperties::new().with(names::SUPPLIER, "NEUSTAR");
        pipeline
            .process(&RequestContext::for_message("ID:2", "Q1"), &header, "")
            .await
            .unwrap();

        let routed = seen.lock().take().unwrap();
        assert_eq!(routed.supplier.as_deref(), Some("NEUSTAR"));
        assert!(routed.channel_name_base.is_none());
        assert_eq!(routed.extras().count(), 0);
    }
}
