//! Read-through hydration for cold-start entitlement lookups (`spec.md`
//! §4.4.2, §9 "Cache layer"). The pricing calculator, plan/customer CRUD,
//! and primary database are explicitly out of scope (`spec.md` §1); this
//! module only names the interface the shard consumes from them.

use crate::domain::Entitlement;
use crate::error::LimiterResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait CustomerService: Send + Sync {
    /// Reads the authoritative entitlement from the primary system of
    /// record. `None` means the customer genuinely has no such entitlement.
    async fn get_active_entitlement(
        &self,
        customer_id: &str,
        project_id: &str,
        feature_slug: &str,
    ) -> LimiterResult<Option<Entitlement>>;

    /// Debounced write-back target for the shard's in-memory counters
    /// (`spec.md` §4.4.5). Default is a no-op for services that don't
    /// maintain a read-through cache of their own.
    async fn write_back(&self, _entitlement: &Entitlement) -> LimiterResult<()> {
        Ok(())
    }
}

/// In-memory test double. Also doubles as a stand-in read-through cache in
/// integration tests that exercise the write-back debouncer.
#[derive(Default)]
pub struct StaticCustomerService {
    entitlements: DashMap<String, Entitlement>,
    written_back: DashMap<String, Entitlement>,
}

impl StaticCustomerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, entitlement: Entitlement) {
        self.entitlements.insert(entitlement.key(), entitlement);
    }

    pub fn written_back_count(&self) -> usize {
        self.written_back.len()
    }
}

#[async_trait]
impl CustomerService for StaticCustomerService {
    async fn get_active_entitlement(
        &self,
        customer_id: &str,
        project_id: &str,
        feature_slug: &str,
    ) -> LimiterResult<Option<Entitlement>> {
        let key = Entitlement::kv_key(project_id, customer_id, feature_slug);
        Ok(self.entitlements.get(&key).map(|e| e.value().clone()))
    }

    async fn write_back(&self, entitlement: &Entitlement) -> LimiterResult<()> {
        self.written_back.insert(entitlement.key(), entitlement.clone());
        Ok(())
    }
}

pub type SharedCustomerService = Arc<dyn CustomerService>;
