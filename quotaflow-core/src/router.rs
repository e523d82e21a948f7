//! Front-door service (C5, `spec.md` §4.5): locates the shard for a
//! customer (with EU jurisdiction affinity), and holds the two
//! isolate-local, write-through caches that let abusive retries and
//! duplicate Reports short-circuit before ever reaching a shard.

use crate::config::LimiterConfig;
use crate::domain::{ReportRequest, ReportResponse, VerifyRequest, VerifyResponse};
use crate::error::LimiterResult;
use crate::hydrate::SharedCustomerService;
use crate::registry::ShardedRegistry;
use crate::shard::{spawn_shard, ShardHandle};
use crate::store::ShardStore;
use lru::LruCache;
use parking_lot::Mutex;
use quotaflow_sink::{non_production_idempotence_key, AnalyticsSink};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

/// Two-level namespace: production traffic for customers whose inferred
/// country is in the EU lands in the `eu` sub-namespace instead of the
/// default one, so the same customer always resolves to the same shard and
/// the same jurisdiction (`spec.md` §4.5, §9 "EU jurisdiction").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Jurisdiction {
    Default,
    Eu,
}

fn jurisdiction_for(is_production: bool, customer_is_eu: bool) -> Jurisdiction {
    if is_production && customer_is_eu {
        Jurisdiction::Eu
    } else {
        Jurisdiction::Default
    }
}

fn hash_cache_key(project_id: &str, customer_id: &str, feature_slug: &str) -> String {
    format!("{project_id}:{customer_id}:{feature_slug}")
}

fn idempotency_cache_key(
    project_id: &str,
    customer_id: &str,
    feature_slug: &str,
    idempotence_key: &str,
    timestamp: i64,
    is_production: bool,
) -> String {
    let idem = if is_production {
        idempotence_key.to_string()
    } else {
        non_production_idempotence_key(idempotence_key, timestamp)
    };
    format!("{project_id}:{customer_id}:{feature_slug}:{idem}")
}

pub struct Router {
    registries: [ShardedRegistry<String, ShardHandle>; 2],
    hash_cache: Mutex<LruCache<String, VerifyResponse>>,
    idempotency_cache: Mutex<LruCache<String, ReportResponse>>,
    sink: Arc<dyn AnalyticsSink>,
    customer_service: SharedCustomerService,
    config: Arc<LimiterConfig>,
    colo: String,
    is_production: bool,
}

impl Router {
    pub fn new(
        sink: Arc<dyn AnalyticsSink>,
        customer_service: SharedCustomerService,
        config: Arc<LimiterConfig>,
        colo: String,
        is_production: bool,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.batch.hash_cache_capacity.max(1)).unwrap();
        Self {
            registries: [ShardedRegistry::new(), ShardedRegistry::new()],
            hash_cache: Mutex::new(LruCache::new(capacity)),
            idempotency_cache: Mutex::new(LruCache::new(capacity)),
            sink,
            customer_service,
            config,
            colo,
            is_production,
        }
    }

    fn registry_for(&self, jurisdiction: Jurisdiction) -> &ShardedRegistry<String, ShardHandle> {
        match jurisdiction {
            Jurisdiction::Default => &self.registries[0],
            Jurisdiction::Eu => &self.registries[1],
        }
    }

    fn shard_data_dir(&self, jurisdiction: Jurisdiction, customer_id: &str) -> PathBuf {
        let sub = match jurisdiction {
            Jurisdiction::Default => "default",
            Jurisdiction::Eu => "eu",
        };
        PathBuf::from(&self.config.storage.data_dir).join(sub).join(customer_id)
    }

    fn get_or_spawn_shard(&self, customer_id: &str, customer_is_eu: bool) -> LimiterResult<ShardHandle> {
        let jurisdiction = jurisdiction_for(self.is_production, customer_is_eu);
        if let Some(handle) = self.registry_for(jurisdiction).get(&customer_id.to_string()) {
            return Ok(handle);
        }

        let data_dir = self.shard_data_dir(jurisdiction, customer_id);
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| crate::error::LimiterError::Durable(format!("failed to create shard data dir: {e}")))?;
        let store = ShardStore::open(&data_dir)?;
        let handle = spawn_shard(
            customer_id.to_string(),
            store,
            Arc::clone(&self.sink),
            Arc::clone(&self.customer_service),
            Arc::clone(&self.config),
            self.colo.clone(),
            self.is_production,
        )?;
        Ok(self
            .registry_for(jurisdiction)
            .get_or_insert_with(customer_id.to_string(), || handle))
    }

    /// `spec.md` §4.5's "Denial stability under flood" scenario: a denied
    /// Verify is memoized here and never reaches the shard again until the
    /// isolate restarts; allowed responses always go through.
    pub async fn verify(&self, req: VerifyRequest, customer_is_eu: bool) -> LimiterResult<VerifyResponse> {
        let cache_key = hash_cache_key(&req.project_id, &req.customer_id, &req.feature_slug);
        if let Some(cached) = self.hash_cache.lock().get(&cache_key).cloned() {
            return Ok(VerifyResponse {
                cache_hit: true,
                ..cached
            });
        }

        let handle = self.get_or_spawn_shard(&req.customer_id, customer_is_eu)?;
        let response = handle.verify(req).await?;

        if !response.allowed {
            self.hash_cache.lock().put(cache_key, response.clone());
        }
        Ok(response)
    }

    /// `spec.md` §4.5's "Idempotent Report" scenario: a cache hit returns the
    /// previously observed response without touching the shard again.
    pub async fn report(&self, req: ReportRequest, customer_is_eu: bool) -> LimiterResult<ReportResponse> {
        let cache_key = idempotency_cache_key(
            &req.project_id,
            &req.customer_id,
            &req.feature_slug,
            &req.idempotence_key,
            req.timestamp,
            self.is_production,
        );
        if let Some(cached) = self.idempotency_cache.lock().get(&cache_key).cloned() {
            return Ok(ReportResponse {
                cache_hit: true,
                ..cached
            });
        }

        let handle = self.get_or_spawn_shard(&req.customer_id, customer_is_eu)?;
        let response = handle.report(req).await?;

        self.idempotency_cache.lock().put(cache_key, response.clone());
        Ok(response)
    }

    pub async fn prewarm(&self, customer_id: &str, project_id: &str, customer_is_eu: bool) -> LimiterResult<()> {
        let handle = self.get_or_spawn_shard(customer_id, customer_is_eu)?;
        handle.prewarm(project_id.to_string()).await
    }

    pub fn shard_count(&self) -> usize {
        self.registries.iter().map(|r| r.len()).sum()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("shard_count", &self.shard_count())
            .field("is_production", &self.is_production)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FeatureType;
    use crate::hydrate::StaticCustomerService;
    use quotaflow_cycle::{Anchor, Interval};
    use rust_decimal::Decimal;

    struct NullSink;

    #[async_trait::async_trait]
    impl AnalyticsSink for NullSink {
        async fn ingest_usage(
            &self,
            batch: &[quotaflow_sink::UsageRow],
        ) -> quotaflow_sink::error::SinkResult<quotaflow_sink::IngestOutcome> {
            Ok(quotaflow_sink::IngestOutcome {
                successful: batch.len(),
                quarantined: 0,
            })
        }
        async fn ingest_verification(
            &self,
            batch: &[quotaflow_sink::VerificationRow],
        ) -> quotaflow_sink::error::SinkResult<quotaflow_sink::IngestOutcome> {
            Ok(quotaflow_sink::IngestOutcome {
                successful: batch.len(),
                quarantined: 0,
            })
        }
    }

    fn test_router(data_dir: &std::path::Path, customer_service: SharedCustomerService) -> Router {
        let mut config = LimiterConfig::default();
        config.storage.data_dir = data_dir.to_string_lossy().to_string();
        Router::new(Arc::new(NullSink), customer_service, Arc::new(config), "iad".to_string(), true)
    }

    fn seeded_entitlement(customer: &str, project: &str, feature: &str) -> crate::domain::Entitlement {
        let now = chrono::Utc::now();
        crate::domain::Entitlement {
            entitlement_id: "ent1".to_string(),
            customer_id: customer.to_string(),
            project_id: project.to_string(),
            feature_slug: feature.to_string(),
            feature_plan_version_id: "fpv1".to_string(),
            subscription_id: "sub1".to_string(),
            subscription_phase_id: "phase1".to_string(),
            subscription_item_id: "item1".to_string(),
            feature_type: FeatureType::Usage,
            current_cycle_usage: Decimal::from(0),
            accumulated_usage: Decimal::from(0),
            last_usage_update_at: now.timestamp_millis(),
            reseted_at: now - chrono::Duration::days(1),
            updated_at_m: now.timestamp_millis(),
            limit: Some(Decimal::from(0)),
            limit_type: crate::domain::LimitType::Hard,
            units: None,
            active_phase: crate::domain::SubscriptionPhase {
                start_at: now - chrono::Duration::days(10),
                end_at: None,
                trial_ends_at: None,
                billing_interval: Interval::Month,
                billing_interval_count: 1,
                billing_anchor: Anchor::DayOfCreation,
            },
        }
    }

    fn verify_req(customer: &str, project: &str, feature: &str) -> VerifyRequest {
        VerifyRequest {
            customer_id: customer.to_string(),
            project_id: project.to_string(),
            feature_slug: feature.to_string(),
            request_id: "req1".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            performance_start: chrono::Utc::now().timestamp_millis(),
            flush_time_sec: None,
            metadata: None,
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn denied_verify_is_memoized_without_reaching_shard_again() {
        let dir = tempfile::tempdir().unwrap();
        let customer_service = StaticCustomerService::new();
        customer_service.seed(seeded_entitlement("cust1", "proj1", "api-calls"));
        let router = test_router(dir.path(), Arc::new(customer_service));

        let first = router.verify(verify_req("cust1", "proj1", "api-calls"), false).await.unwrap();
        assert!(!first.allowed);
        assert!(!first.cache_hit);

        let second = router.verify(verify_req("cust1", "proj1", "api-calls"), false).await.unwrap();
        assert!(!second.allowed);
        assert!(second.cache_hit);
    }

    #[test]
    fn eu_and_non_eu_customers_land_in_different_namespaces() {
        assert_eq!(jurisdiction_for(true, true), Jurisdiction::Eu);
        assert_eq!(jurisdiction_for(true, false), Jurisdiction::Default);
        assert_eq!(jurisdiction_for(false, true), Jurisdiction::Default);
    }
}
