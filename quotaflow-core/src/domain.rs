//! Entitlement, usage, and verification record types (`spec.md` §3).

use chrono::{DateTime, Utc};
use quotaflow_cycle::{Anchor, Interval};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const PLACEHOLDER_ID: &str = "placeholder";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureType {
    Flat,
    Tier,
    Package,
    Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
    Hard,
    Soft,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeniedReason {
    EntitlementNotFound,
    LimitExceeded,
    EntitlementExpired,
    EntitlementNotActive,
    DoNotInitialized,
    IncorrectUsageReporting,
    ErrorInsertingUsageDo,
    ErrorInsertingVerificationDo,
    FetchError,
    SubscriptionNotActive,
    FeatureTypeNotSupported,
    CustomerDisabled,
    ProjectDisabled,
    ErrorResettingDo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPhase {
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub billing_interval: Interval,
    pub billing_interval_count: u32,
    pub billing_anchor: Anchor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub entitlement_id: String,
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub feature_plan_version_id: String,
    pub subscription_id: String,
    pub subscription_phase_id: String,
    pub subscription_item_id: String,
    pub feature_type: FeatureType,
    pub current_cycle_usage: Decimal,
    pub accumulated_usage: Decimal,
    pub last_usage_update_at: i64,
    pub reseted_at: DateTime<Utc>,
    pub updated_at_m: i64,
    pub limit: Option<Decimal>,
    pub limit_type: LimitType,
    pub units: Option<Decimal>,
    pub active_phase: SubscriptionPhase,
}

impl Entitlement {
    pub fn is_placeholder(&self) -> bool {
        self.entitlement_id == PLACEHOLDER_ID
    }

    /// A sentinel used to memoize a not-found lookup and suppress stampedes.
    pub fn placeholder(customer_id: &str, project_id: &str, feature_slug: &str, now: DateTime<Utc>) -> Self {
        Self {
            entitlement_id: PLACEHOLDER_ID.to_string(),
            customer_id: customer_id.to_string(),
            project_id: project_id.to_string(),
            feature_slug: feature_slug.to_string(),
            feature_plan_version_id: String::new(),
            subscription_id: String::new(),
            subscription_phase_id: String::new(),
            subscription_item_id: String::new(),
            feature_type: FeatureType::Flat,
            current_cycle_usage: Decimal::ZERO,
            accumulated_usage: Decimal::ZERO,
            last_usage_update_at: now.timestamp_millis(),
            reseted_at: now,
            updated_at_m: now.timestamp_millis(),
            limit: None,
            limit_type: LimitType::None,
            units: None,
            active_phase: SubscriptionPhase {
                start_at: now,
                end_at: None,
                trial_ends_at: None,
                billing_interval: Interval::Onetime,
                billing_interval_count: 1,
                billing_anchor: Anchor::Numeric(0),
            },
        }
    }

    pub fn kv_key(project_id: &str, customer_id: &str, feature_slug: &str) -> String {
        format!("entitlement:{project_id}:{customer_id}:{feature_slug}")
    }

    pub fn key(&self) -> String {
        Self::kv_key(&self.project_id, &self.customer_id, &self.feature_slug)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub entitlement_id: String,
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub usage: Decimal,
    pub timestamp: i64,
    pub idempotence_key: String,
    pub request_id: String,
    pub subscription_id: String,
    pub subscription_item_id: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub entitlement_id: String,
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub request_id: String,
    pub timestamp: i64,
    pub success: bool,
    pub latency_ms: Decimal,
    pub denied_reason: Option<DeniedReason>,
    pub subscription_id: String,
    pub subscription_item_id: String,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShardConfig {
    pub colo: String,
    pub last_sync_usage_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub request_id: String,
    pub timestamp: i64,
    pub performance_start: i64,
    pub flush_time_sec: Option<u64>,
    pub metadata: Option<serde_json::Value>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub allowed: bool,
    pub message: Option<String>,
    pub denied_reason: Option<DeniedReason>,
    pub limit: Option<Decimal>,
    pub usage: Option<Decimal>,
    pub latency_ms: Option<i64>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub usage: Decimal,
    pub idempotence_key: String,
    pub timestamp: i64,
    pub flush_time_sec: Option<u64>,
    pub request_id: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub allowed: bool,
    pub message: Option<String>,
    pub limit: Option<Decimal>,
    pub usage: Option<Decimal>,
    pub denied_reason: Option<DeniedReason>,
    pub cache_hit: bool,
}
