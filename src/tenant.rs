//! Tenant (customer domain) properties consulted by servers and producers

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::Result;

/// Event delivery settings of one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantProfile {
    /// Queue the tenant's events are produced to and consumed from
    pub event_queue: Option<String>,

    /// Tenant is an API customer
    pub api_enabled: bool,

    /// Tenant receives notifications
    pub notification_enabled: bool,

    pub service_type: Option<String>,
}

impl TenantProfile {
    /// Whether events for this tenant should be consumed at all
    pub fn wants_events(&self) -> bool {
        self.api_enabled || self.notification_enabled
    }
}

/// Lookup of tenant profiles
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn profile(&self, tenant: &str) -> Result<Option<TenantProfile>>;

    /// Tenants provisioned for a service type, in a stable order
    async fn tenants_for_service(&self, service_type: &str) -> Result<Vec<String>>;
}

/// Tenant directory held in memory
#[derive(Default)]
pub struct StaticTenantDirectory {
    profiles: RwLock<BTreeMap<String, TenantProfile>>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tenant (builder pattern)
    pub fn with_tenant(self, tenant: impl Into<String>, profile: TenantProfile) -> Self {
        self.insert(tenant, profile);
        self
    }

    pub fn insert(&self, tenant: impl Into<String>, profile: TenantProfile) {
        self.profiles.write().insert(tenant.into(), profile);
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn profile(&self, tenant: &str) -> Result<Option<TenantProfile>> {
        Ok(self.profiles.read().get(tenant).cloned())
    }

    async fn tenants_for_service(&self, service_type: &str) -> Result<Vec<String>> {
        Ok(self
            .profiles
            .read()
            .iter()
            .filter(|(_, profile)| profile.service_type.as_deref() == Some(service_type))
            .map(|(tenant, _)| tenant.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(queue: &str, service_type: &str, api: bool) -> TenantProfile {
        TenantProfile {
            event_queue: Some(queue.to_string()),
            api_enabled: api,
            notification_enabled: false,
            service_type: Some(service_type.to_string()),
        }
    }

    #[tokio::test]
    async fn test_static_directory_lookups() {
        let directory = StaticTenantDirectory::new()
            .with_tenant("200", profile("NOTIFY_Q", "SOA", true))
            .with_tenant("100", profile("NOTIFY_Q", "SOA", false))
            .with_tenant("300", profile("LSR_Q", "LSR", true));

        assert_eq!(
            directory.tenants_for_service("SOA").await.unwrap(),
            vec!["100", "200"]
        );
        let found = directory.profile("300").await.unwrap().unwrap();
        assert_eq!(found.event_queue.as_deref(), Some("LSR_Q"));
        assert!(directory.profile("999").await.unwrap().is_none());
    }

    #[test]
    fn test_wants_events() {
        assert!(!TenantProfile::default().wants_events());
        assert!(TenantProfile {
            notification_enabled: true,
            ..Default::default()
        }
        .wants_events());
    }
}
