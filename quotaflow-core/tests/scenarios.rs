//! End-to-end scenarios exercised through the public `Router`, one process
//! boundary up from the shard-level unit tests in `src/shard.rs`.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use quotaflow_core::config::LimiterConfig;
use quotaflow_core::domain::{
    DeniedReason, Entitlement, FeatureType, LimitType, ReportRequest, SubscriptionPhase, VerifyRequest,
};
use quotaflow_core::hydrate::StaticCustomerService;
use quotaflow_core::Router;
use quotaflow_cycle::{Anchor, Interval};
use quotaflow_sink::error::SinkResult;
use quotaflow_sink::{AnalyticsSink, IngestOutcome, UsageRow, VerificationRow};
use rust_decimal::Decimal;
use std::sync::Arc;

struct NullSink;

#[async_trait]
impl AnalyticsSink for NullSink {
    async fn ingest_usage(&self, batch: &[UsageRow]) -> SinkResult<IngestOutcome> {
        Ok(IngestOutcome {
            successful: batch.len(),
            quarantined: 0,
        })
    }
    async fn ingest_verification(&self, batch: &[VerificationRow]) -> SinkResult<IngestOutcome> {
        Ok(IngestOutcome {
            successful: batch.len(),
            quarantined: 0,
        })
    }
}

fn test_router(data_dir: &std::path::Path, customer_service: Arc<StaticCustomerService>) -> Router {
    let mut config = LimiterConfig::default();
    config.storage.data_dir = data_dir.to_string_lossy().to_string();
    Router::new(Arc::new(NullSink), customer_service, Arc::new(config), "iad".to_string(), true)
}

fn base_entitlement(customer: &str, project: &str, feature: &str, limit: Option<i64>) -> Entitlement {
    let now = Utc::now();
    Entitlement {
        entitlement_id: "ent1".to_string(),
        customer_id: customer.to_string(),
        project_id: project.to_string(),
        feature_slug: feature.to_string(),
        feature_plan_version_id: "fpv1".to_string(),
        subscription_id: "sub1".to_string(),
        subscription_phase_id: "phase1".to_string(),
        subscription_item_id: "item1".to_string(),
        feature_type: FeatureType::Usage,
        current_cycle_usage: Decimal::ZERO,
        accumulated_usage: Decimal::ZERO,
        last_usage_update_at: now.timestamp_millis(),
        reseted_at: now - chrono::Duration::days(1),
        updated_at_m: now.timestamp_millis(),
        limit: limit.map(Decimal::from),
        limit_type: if limit.is_some() { LimitType::Hard } else { LimitType::None },
        units: None,
        active_phase: SubscriptionPhase {
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
        timestamp: Utc::now().timestamp_millis(),
        performance_start: Utc::now().timestamp_millis(),
        flush_time_sec: None,
        metadata: None,
        from_cache: false,
    }
}

fn report_req(customer: &str, project: &str, feature: &str, usage: i64, idem: &str, timestamp: i64) -> ReportRequest {
    ReportRequest {
        customer_id: customer.to_string(),
        project_id: project.to_string(),
        feature_slug: feature.to_string(),
        usage: Decimal::from(usage),
        idempotence_key: idem.to_string(),
        timestamp,
        flush_time_sec: None,
        request_id: "req1".to_string(),
        metadata: None,
    }
}

#[tokio::test]
async fn s1_allow_within_limit_through_router() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(StaticCustomerService::new());
    service.seed(base_entitlement("cust1", "proj1", "api-calls", Some(100)));
    let router = test_router(dir.path(), service);

    let report = router
        .report(report_req("cust1", "proj1", "api-calls", 5, "idem1", Utc::now().timestamp_millis()), false)
        .await
        .unwrap();
    assert!(report.allowed);
    assert_eq!(report.usage, Some(Decimal::from(5)));
}

#[tokio::test]
async fn s2_hard_deny_is_cached_in_router_and_never_mutates_counters() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(StaticCustomerService::new());
    service.seed(base_entitlement("cust1", "proj1", "api-calls", Some(0)));
    let router = test_router(dir.path(), service);

    let first = router.verify(verify_req("cust1", "proj1", "api-calls"), false).await.unwrap();
    assert!(!first.allowed);
    assert_eq!(first.denied_reason, Some(DeniedReason::LimitExceeded));
    assert!(!first.cache_hit);

    // 100 repeated Verify calls should hit the router's hashCache, never the
    // shard, and keep returning the same denial (`spec.md` §8 "Denial
    // stability under flood").
    for _ in 0..100 {
        let response = router.verify(verify_req("cust1", "proj1", "api-calls"), false).await.unwrap();
        assert!(!response.allowed);
        assert!(response.cache_hit);
    }
}

#[tokio::test]
async fn s4_rollover_resets_usage_at_cycle_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(StaticCustomerService::new());

    let now_ms = Utc::now().timestamp_millis();
    let next_minute_ms = ((now_ms / 60_000) + 1) * 60_000;
    let prev_minute_ms = next_minute_ms - 60_000;

    let mut entitlement = base_entitlement("cust1", "proj1", "api-calls", Some(1000));
    entitlement.active_phase.billing_interval = Interval::Minute;
    entitlement.active_phase.billing_interval_count = 1;
    entitlement.active_phase.billing_anchor = Anchor::Numeric(0);
    entitlement.active_phase.start_at = Utc.timestamp_millis_opt(prev_minute_ms - 3_600_000).unwrap();
    entitlement.reseted_at = Utc.timestamp_millis_opt(prev_minute_ms).unwrap();
    entitlement.current_cycle_usage = Decimal::ZERO;
    service.seed(entitlement);

    let router = test_router(dir.path(), service);

    let before = router
        .report(
            report_req("cust1", "proj1", "api-calls", 3, "idem-before", next_minute_ms - 1),
            false,
        )
        .await
        .unwrap();
    assert!(before.allowed);
    assert_eq!(before.usage, Some(Decimal::from(3)));

    let after = router
        .report(
            report_req("cust1", "proj1", "api-calls", 4, "idem-after", next_minute_ms + 1),
            false,
        )
        .await
        .unwrap();
    assert!(after.allowed);
    assert_eq!(after.usage, Some(Decimal::from(4)));
}

#[tokio::test]
async fn s5_placeholder_entitlement_denies_without_retry_storm() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(StaticCustomerService::new());
    let router = test_router(dir.path(), service);

    let first = router.verify(verify_req("cust1", "proj1", "unknown"), false).await.unwrap();
    assert_eq!(first.denied_reason, Some(DeniedReason::EntitlementNotFound));

    let second = router.verify(verify_req("cust1", "proj1", "unknown"), false).await.unwrap();
    assert_eq!(second.denied_reason, Some(DeniedReason::EntitlementNotFound));
}

#[tokio::test]
async fn idempotent_report_short_circuits_on_repeat() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(StaticCustomerService::new());
    service.seed(base_entitlement("cust1", "proj1", "api-calls", Some(100)));
    let router = test_router(dir.path(), service);

    let timestamp = Utc::now().timestamp_millis();
    let first = router
        .report(report_req("cust1", "proj1", "api-calls", 5, "idem-dup", timestamp), false)
        .await
        .unwrap();
    assert!(first.allowed);
    assert!(!first.cache_hit);

    let second = router
        .report(report_req("cust1", "proj1", "api-calls", 5, "idem-dup", timestamp), false)
        .await
        .unwrap();
    assert!(second.allowed);
    assert!(second.cache_hit);
    assert_eq!(second.usage, first.usage);
}

#[tokio::test]
async fn eu_and_default_jurisdictions_hold_independent_shard_state() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(StaticCustomerService::new());
    service.seed(base_entitlement("cust-eu", "proj1", "api-calls", Some(100)));
    let router = test_router(dir.path(), service);

    let default_report = router
        .report(report_req("cust-eu", "proj1", "api-calls", 5, "idem1", Utc::now().timestamp_millis()), false)
        .await
        .unwrap();
    assert_eq!(default_report.usage, Some(Decimal::from(5)));

    // Same customer id, EU jurisdiction: a fresh shard, so a fresh hydration
    // from the customer service (which still returns the zero-usage seed).
    let eu_report = router
        .report(report_req("cust-eu", "proj1", "api-calls", 5, "idem2", Utc::now().timestamp_millis()), true)
        .await
        .unwrap();
    assert_eq!(eu_report.usage, Some(Decimal::from(5)));
    assert_eq!(router.shard_count(), 2);
}
