//! Supplier outage and customer quota enforcement in front of a store
//!
//! Refusing an insert makes the consumer recover the message, so a
//! throttled message waits on the broker instead of flowing downstream.
//! A message the inner store already holds is reported as a duplicate
//! without being throttled again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{MessageStore, StoreOutcome};
use crate::types::{names, MessageStoreRecord};

/// Header overrides for the outage and quota lookups
pub const TRANSACTION_FOR_OUTAGE: &str = "TransactionForOutage";
pub const SUPPLIER_FOR_OUTAGE: &str = "SupplierForOutage";
pub const TRANSACTION_FOR_QUOTA: &str = "TransactionForQuota";
pub const SUPPLIER_FOR_QUOTA: &str = "SupplierForQuota";

/// A scheduled supplier outage window
#[derive(Debug, Clone, PartialEq)]
pub struct Outage {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Outage {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

/// Maximum number of messages a customer may store for one
/// (transaction, supplier) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
}

/// Source of outage and quota definitions
#[async_trait]
pub trait ThrottlingData: Send + Sync {
    async fn outage(&self, transaction: &str, supplier: &str) -> Result<Option<Outage>>;

    async fn quota(&self, transaction: &str, supplier: &str, customer: &str)
        -> Result<Option<Quota>>;
}

/// Fixed outage and quota tables
#[derive(Debug, Clone, Default)]
pub struct StaticThrottlingData {
    outages: HashMap<(String, String), Outage>,
    quotas: HashMap<(String, String, String), Quota>,
}

impl StaticThrottlingData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an outage window (builder pattern)
    pub fn with_outage(mut self, transaction: &str, supplier: &str, outage: Outage) -> Self {
        self.outages
            .insert((transaction.to_string(), supplier.to_string()), outage);
        self
    }

    /// Add a customer quota (builder pattern)
    pub fn with_quota(mut self, transaction: &str, supplier: &str, customer: &str, limit: u64) -> Self {
        self.quotas.insert(
            (transaction.to_string(), supplier.to_string(), customer.to_string()),
            Quota { limit },
        );
        self
    }
}

#[async_trait]
impl ThrottlingData for StaticThrottlingData {
    async fn outage(&self, transaction: &str, supplier: &str) -> Result<Option<Outage>> {
        Ok(self
            .outages
            .get(&(transaction.to_string(), supplier.to_string()))
            .cloned())
    }

    async fn quota(
        &self,
        transaction: &str,
        supplier: &str,
        customer: &str,
    ) -> Result<Option<Quota>> {
        Ok(self
            .quotas
            .get(&(transaction.to_string(), supplier.to_string(), customer.to_string()))
            .copied())
    }
}

type QuotaKey = (String, String, String);

/// Store decorator that refuses inserts during supplier outages and once a
/// customer's quota is used up
pub struct ThrottlingStore<S> {
    inner: S,
    data: Arc<dyn ThrottlingData>,
    used: DashMap<QuotaKey, u64>,
    outage_wait_limit: Option<Duration>,
}

impl<S: MessageStore> ThrottlingStore<S> {
    pub fn new(inner: S, data: Arc<dyn ThrottlingData>) -> Self {
        Self {
            inner,
            data,
            used: DashMap::new(),
            outage_wait_limit: None,
        }
    }

    /// Cap how long an insert waits for an active outage to end before
    /// refusing (builder pattern). Without a cap it waits for the full window.
    pub fn with_outage_wait_limit(mut self, limit: Duration) -> Self {
        self.outage_wait_limit = Some(limit);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Messages stored so far against a quota
    pub fn quota_used(&self, transaction: &str, supplier: &str, customer: &str) -> u64 {
        self.used
            .get(&(transaction.to_string(), supplier.to_string(), customer.to_string()))
            .map_or(0, |used| *used)
    }

    /// Outage check, then the quota that applies to the record if any
    async fn check(&self, record: &MessageStoreRecord) -> Result<Option<(QuotaKey, Quota)>> {
        let header = &record.header;
        let lookup = |preferred: &str, fallback: &str| {
            header
                .get_non_empty(preferred)
                .or_else(|| header.get_non_empty(fallback))
                .unwrap_or_default()
                .to_string()
        };
        let customer = record.tenant_id.clone().unwrap_or_default();

        let transaction = lookup(TRANSACTION_FOR_OUTAGE, names::TRANSACTION);
        let supplier = lookup(SUPPLIER_FOR_OUTAGE, names::SUPPLIER);
        if let Some(outage) = self.data.outage(&transaction, &supplier).await? {
            let now = Utc::now();
            if outage.is_active(now) {
                let remaining = (outage.end - now).to_std().unwrap_or_default();
                let wait = self
                    .outage_wait_limit
                    .map_or(remaining, |limit| remaining.min(limit));
                debug!(
                    transaction = %transaction,
                    supplier = %supplier,
                    wait_ms = wait.as_millis() as u64,
                    "Supplier outage active; holding message"
                );
                tokio::time::sleep(wait).await;
                return Err(Error::Store(format!(
                    "supplier '{}' has an active outage for '{}'",
                    supplier, transaction
                )));
            }
        }

        let transaction = lookup(TRANSACTION_FOR_QUOTA, names::TRANSACTION);
        let supplier = lookup(SUPPLIER_FOR_QUOTA, names::SUPPLIER);
        let quota = self.data.quota(&transaction, &supplier, &customer).await?;
        Ok(quota.map(|quota| ((transaction, supplier, customer), quota)))
    }

    /// Take one slot of the quota under the map entry's lock
    fn reserve(&self, key: &QuotaKey, quota: Quota) -> Result<()> {
        let mut used = self.used.entry(key.clone()).or_insert(0);
        if *used >= quota.limit {
            warn!(customer = %key.2, limit = quota.limit, "Quota for customer has ended");
            return Err(Error::Store(format!("quota exhausted for customer '{}'", key.2)));
        }
        *used += 1;
        Ok(())
    }

    fn unreserve(&self, key: &QuotaKey) {
        if let Some(mut used) = self.used.get_mut(key) {
            *used = used.saturating_sub(1);
        }
    }
}

#[async_trait]
impl<S: MessageStore> MessageStore for ThrottlingStore<S> {
    async fn insert(&self, record: &MessageStoreRecord) -> Result<StoreOutcome> {
        if self.inner.contains(&record.broker_message_id).await? {
            debug!(message_id = %record.broker_message_id, "Message already stored; not throttled");
            return Ok(StoreOutcome::Duplicate);
        }

        let reserved = self.check(record).await.and_then(|quota| match quota {
            Some((key, quota)) => self.reserve(&key, quota).map(|()| Some(key)),
            None => Ok(None),
        });
        let reserved = match reserved {
            Ok(reserved) => reserved,
            Err(e) => {
                warn!(message_id = %record.broker_message_id, error = %e, "Throttled message store insert");
                return Ok(StoreOutcome::Refused);
            }
        };

        let outcome = self.inner.insert(record).await;
        if !matches!(outcome, Ok(StoreOutcome::Stored)) {
            if let Some(key) = &reserved {
                self.unreserve(key);
            }
        }
        outcome
    }

    async fn contains(&self, broker_message_id: &str) -> Result<bool> {
        self.inner.contains(broker_message_id).await
    }

    fn table_name(&self) -> Option<&str> {
        self.inner.table_name()
    }
}
