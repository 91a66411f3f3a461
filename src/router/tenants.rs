//! Multi-tenant selector composition
//!
//! Tenants sharing a physical queue share one consumer whose selector is an
//! IN-list over the tenant identifier property. The list is kept as a set
//! and re-rendered on every change; adding a tenant to a running consumer
//! requires registering it again.

use std::fmt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::tenant::TenantDirectory;
use crate::types::names;

/// Ordered, duplicate-free set of tenants rendered as `<field> IN (...)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSelector {
    field: String,
    tenants: Vec<String>,
}

impl TenantSelector {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            tenants: Vec::new(),
        }
    }

    /// Selector over the `CustomerIdentifier` property
    pub fn for_customers() -> Self {
        Self::new(names::CUSTOMER_IDENTIFIER)
    }

    /// Add a tenant (builder pattern)
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.add(tenant);
        self
    }

    /// Add a tenant; `false` when it was already present
    pub fn add(&mut self, tenant: impl Into<String>) -> bool {
        let tenant = tenant.into();
        if self.tenants.contains(&tenant) {
            return false;
        }
        self.tenants.push(tenant);
        true
    }

    pub fn contains(&self, tenant: &str) -> bool {
        self.tenants.iter().any(|t| t == tenant)
    }

    pub fn tenants(&self) -> &[String] {
        &self.tenants
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Selector text, or `None` when no tenant was added
    pub fn render(&self) -> Option<String> {
        if self.tenants.is_empty() {
            return None;
        }
        let values: Vec<String> = self
            .tenants
            .iter()
            .map(|tenant| format!("'{}'", tenant.replace('\'', "''")))
            .collect();
        Some(format!("{} IN ({})", self.field, values.join(",")))
    }
}

impl fmt::Display for TenantSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render().unwrap_or_default())
    }
}

/// Queue-to-tenants assignment for a multi-tenant server, in first-seen
/// queue order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantPlan {
    queues: Vec<(String, TenantSelector)>,
}

impl TenantPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign each eligible tenant to its event queue
    ///
    /// Tenants without a profile, without an event queue, or with neither
    /// API nor notification delivery enabled are skipped with a warning;
    /// their events are not consumed.
    pub async fn build(directory: &dyn TenantDirectory, tenants: &[String]) -> Result<Self> {
        let mut plan = Self::new();
        for tenant in tenants {
            let Some(profile) = directory.profile(tenant).await? else {
                warn!(tenant = %tenant, "No profile for tenant; its events will not be consumed");
                continue;
            };
            if !profile.wants_events() {
                warn!(
                    tenant = %tenant,
                    "Tenant is neither an API nor a notification customer; its events will not be consumed"
                );
                continue;
            }
            let Some(queue) = profile.event_queue.filter(|q| !q.trim().is_empty()) else {
                warn!(tenant = %tenant, "No event queue configured for tenant; its events will not be consumed");
                continue;
            };
            plan.add(&queue, tenant);
            debug!(tenant = %tenant, queue = %queue, "Assigned tenant to queue");
        }
        Ok(plan)
    }

    /// Add `tenant` to the selector of `queue`, creating the entry if needed
    pub fn add(&mut self, queue: &str, tenant: &str) {
        match self.queues.iter_mut().find(|(name, _)| name == queue) {
            Some((_, selector)) => {
                selector.add(tenant);
            }
            None => self.queues.push((
                queue.to_string(),
                TenantSelector::for_customers().with_tenant(tenant),
            )),
        }
    }

    pub fn queues(&self) -> impl Iterator<Item = (&str, &TenantSelector)> {
        self.queues.iter().map(|(queue, selector)| (queue.as_str(), selector))
    }

    pub fn selector(&self, queue: &str) -> Option<&TenantSelector> {
        self.queues
            .iter()
            .find(|(name, _)| name == queue)
            .map(|(_, selector)| selector)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Selector;
    use crate::tenant::{StaticTenantDirectory, TenantProfile};
    use crate::types::MessageProperties;
    use proptest::prelude::*;

    fn profile(queue: &str, api: bool, notification: bool) -> TenantProfile {
        TenantProfile {
            event_queue: Some(queue.to_string()),
            api_enabled: api,
            notification_enabled: notification,
            service_type: Some("SOA".to_string()),
        }
    }

    #[test]
    fn test_render_in_list() {
        let selector = TenantSelector::for_customers()
            .with_tenant("100")
            .with_tenant("200")
            .with_tenant("100");
        assert_eq!(
            selector.render().as_deref(),
            Some("CustomerIdentifier IN ('100','200')")
        );
        assert!(TenantSelector::for_customers().render().is_none());
    }

    #[test]
    fn test_quotes_are_escaped() {
        let selector = TenantSelector::for_customers().with_tenant("o'brien");
        assert_eq!(selector.to_string(), "CustomerIdentifier IN ('o''brien')");
    }

    #[tokio::test]
    async fn test_plan_shares_queue_and_skips_ineligible() {
        let directory = StaticTenantDirectory::new()
            .with_tenant("100", profile("NOTIFY_Q", true, false))
            .with_tenant("200", profile("NOTIFY_Q", false, true))
            .with_tenant("300", profile("NOTIFY_Q", false, false))
            .with_tenant("400", profile("LSR_Q", true, false));
        let tenants: Vec<String> = ["100", "200", "300", "400", "500"]
            .iter()
            .map(|t| t.to_string())
            .collect();

        let plan = TenantPlan::build(&directory, &tenants).await.unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.selector("NOTIFY_Q").unwrap().render().as_deref(),
            Some("CustomerIdentifier IN ('100','200')")
        );
        assert_eq!(plan.selector("LSR_Q").unwrap().tenants(), ["400"]);
        let order: Vec<&str> = plan.queues().map(|(queue, _)| queue).collect();
        assert_eq!(order, vec!["NOTIFY_Q", "LSR_Q"]);
    }

    proptest! {
        #[test]
        fn prop_rendered_selector_matches_exactly_its_tenants(
            tenants in proptest::collection::vec("[a-zA-Z0-9' ]{1,8}", 1..6),
            outsider in "[a-zA-Z0-9' ]{1,8}",
        ) {
            let mut selector = TenantSelector::for_customers();
            for tenant in &tenants {
                selector.add(tenant.clone());
            }
            let parsed = Selector::parse(&selector.render().unwrap()).unwrap();

            for tenant in &tenants {
                let header = MessageProperties::new().with(names::CUSTOMER_IDENTIFIER, tenant.clone());
                prop_assert!(parsed.matches(&header));
            }
            let header = MessageProperties::new().with(names::CUSTOMER_IDENTIFIER, outsider.clone());
            prop_assert_eq!(parsed.matches(&header), tenants.contains(&outsider));
        }
    }
}
