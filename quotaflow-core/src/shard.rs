//! The limiter actor (C4, `spec.md` §4.4): one task per customer, owning
//! its in-memory entitlement map and its [`ShardStore`]. Callers talk to it
//! only through [`ShardHandle`]'s channel — the mailbox loop is the only
//! code that ever touches shard state, so the "single-threaded cooperative"
//! serialization the spec calls for is structural rather than lock-based,
//! shaped like the teacher's periodic `tokio::spawn(async move { loop { ...
//! } })` engine task.

use crate::alarm::AlarmState;
use crate::config::LimiterConfig;
use crate::domain::{
    DeniedReason, Entitlement, FeatureType, LimitType, ReportRequest, ReportResponse, ShardConfig, UsageRecord,
    VerificationRecord, VerifyRequest, VerifyResponse,
};
use crate::error::{LimiterError, LimiterResult};
use crate::hydrate::SharedCustomerService;
use crate::store::ShardStore;
use chrono::{DateTime, TimeZone, Utc};
use quotaflow_cycle::{calculate_cycle_window, CycleConfig};
use quotaflow_sink::{non_production_idempotence_key, AnalyticsSink, UsageRow, VerificationRow};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant as TokioInstant;
use tracing::{error, info, warn};

const SHARD_CONFIG_KEY: &str = "config";

pub enum ShardMessage {
    Verify {
        req: VerifyRequest,
        reply: oneshot::Sender<VerifyResponse>,
    },
    Report {
        req: ReportRequest,
        reply: oneshot::Sender<ReportResponse>,
    },
    Prewarm {
        project_id: String,
        reply: oneshot::Sender<LimiterResult<()>>,
    },
    Reset {
        reply: oneshot::Sender<LimiterResult<Vec<String>>>,
    },
    /// Internal: applies a background-refreshed entitlement. Never sent by
    /// [`ShardHandle`] callers, only looped back by the shard itself so the
    /// mailbox stays the sole writer of `features_usage`.
    ApplyRefresh {
        feature_slug: String,
        entitlement: Entitlement,
    },
}

#[derive(Clone)]
pub struct ShardHandle {
    tx: mpsc::Sender<ShardMessage>,
}

impl ShardHandle {
    pub async fn verify(&self, req: VerifyRequest) -> LimiterResult<VerifyResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ShardMessage::Verify { req, reply })
            .await
            .map_err(|_| LimiterError::ShardGone)?;
        rx.await.map_err(|_| LimiterError::ShardGone)
    }

    pub async fn report(&self, req: ReportRequest) -> LimiterResult<ReportResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ShardMessage::Report { req, reply })
            .await
            .map_err(|_| LimiterError::ShardGone)?;
        rx.await.map_err(|_| LimiterError::ShardGone)
    }

    pub async fn prewarm(&self, project_id: String) -> LimiterResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ShardMessage::Prewarm { project_id, reply })
            .await
            .map_err(|_| LimiterError::ShardGone)?;
        rx.await.map_err(|_| LimiterError::ShardGone)?
    }

    pub async fn reset(&self) -> LimiterResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ShardMessage::Reset { reply })
            .await
            .map_err(|_| LimiterError::ShardGone)?;
        rx.await.map_err(|_| LimiterError::ShardGone)?
    }
}

/// Spawns the actor task and returns a handle. `colo` is detected once by
/// the caller (a one-shot external probe per `spec.md` §4.4.1) and persisted
/// on first construction only.
pub fn spawn_shard(
    customer_id: String,
    store: ShardStore,
    sink: Arc<dyn AnalyticsSink>,
    customer_service: SharedCustomerService,
    config: Arc<LimiterConfig>,
    colo: String,
    is_production: bool,
) -> LimiterResult<ShardHandle> {
    let (tx, rx) = mpsc::channel(256);
    let mut shard = Shard::new(
        customer_id,
        store,
        sink,
        customer_service,
        config,
        colo,
        is_production,
        tx.clone(),
    )?;
    tokio::spawn(async move {
        shard.run(rx).await;
    });
    Ok(ShardHandle { tx })
}

struct Shard {
    customer_id: String,
    store: Arc<ShardStore>,
    sink: Arc<dyn AnalyticsSink>,
    customer_service: SharedCustomerService,
    config: Arc<LimiterConfig>,
    is_production: bool,
    initialized: bool,
    features_usage: HashMap<String, Entitlement>,
    dirty_features: HashSet<String>,
    alarm: AlarmState,
    shard_config: ShardConfig,
    last_flush_at: HashMap<String, TokioInstant>,
    self_tx: mpsc::Sender<ShardMessage>,
}

impl Shard {
    #[allow(clippy::too_many_arguments)]
    fn new(
        customer_id: String,
        store: ShardStore,
        sink: Arc<dyn AnalyticsSink>,
        customer_service: SharedCustomerService,
        config: Arc<LimiterConfig>,
        colo: String,
        is_production: bool,
        self_tx: mpsc::Sender<ShardMessage>,
    ) -> LimiterResult<Self> {
        let mut shard_config = ShardConfig {
            colo,
            last_sync_usage_at: 0,
        };
        if let Some(bytes) = store.get(SHARD_CONFIG_KEY)? {
            // colo is immutable once persisted; keep the persisted value.
            shard_config = serde_json::from_slice(&bytes).map_err(|e| LimiterError::Durable(e.to_string()))?;
        }
        Ok(Self {
            customer_id,
            store: Arc::new(store),
            sink,
            customer_service,
            config,
            is_production,
            initialized: false,
            features_usage: HashMap::new(),
            dirty_features: HashSet::new(),
            alarm: AlarmState::new(),
            shard_config,
            last_flush_at: HashMap::new(),
            self_tx,
        })
    }

    async fn run(&mut self, mut rx: mpsc::Receiver<ShardMessage>) {
        loop {
            let sleep_duration = match self.alarm.fires_at() {
                Some(at) => at.saturating_duration_since(TokioInstant::now()),
                None => tokio::time::Duration::from_secs(86_400),
            };

            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(sleep_duration) => {
                    if self.alarm.take_if_due(TokioInstant::now()) {
                        self.on_alarm().await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: ShardMessage) {
        match msg {
            ShardMessage::Verify { req, reply } => {
                let response = self.verify(req).await;
                let _ = reply.send(response);
            }
            ShardMessage::Report { req, reply } => {
                let response = self.report(req).await;
                let _ = reply.send(response);
            }
            ShardMessage::Prewarm { project_id, reply } => {
                let result = self.prewarm(&project_id).await;
                let _ = reply.send(result);
            }
            ShardMessage::Reset { reply } => {
                let result = self.reset_do().await;
                let _ = reply.send(result);
            }
            ShardMessage::ApplyRefresh { feature_slug: _, entitlement } => {
                self.persist_entitlement(&entitlement);
            }
        }
    }

    fn ensure_initialized(&mut self) -> LimiterResult<()> {
        if self.initialized {
            return Ok(());
        }
        match self.load_persisted_entitlements() {
            Ok(()) => {
                self.initialized = true;
                Ok(())
            }
            Err(e) => {
                self.features_usage.clear();
                self.initialized = false;
                let _ = self.store.delete(SHARD_CONFIG_KEY);
                Err(e)
            }
        }
    }

    fn load_persisted_entitlements(&mut self) -> LimiterResult<()> {
        for (key, bytes) in self.store.list_prefix("entitlement:")? {
            let entitlement: Entitlement =
                serde_json::from_slice(&bytes).map_err(|e| LimiterError::Durable(e.to_string()))?;
            self.features_usage.insert(feature_key(&key), entitlement);
        }
        self.store
            .put(SHARD_CONFIG_KEY, &serde_json::to_vec(&self.shard_config).unwrap())?;
        Ok(())
    }

    fn placeholder_ttl_ms(&self) -> i64 {
        (self.config.ttl.placeholder_revalidation_secs * 1000) as i64
    }

    /// Entitlement resolution (`spec.md` §4.4.2). Resolves the stale/fresh
    /// Open Question as: block only when there is no usable data at all,
    /// otherwise return the stale copy and refresh in the background.
    async fn get_entitlement(&mut self, project_id: &str, feature_slug: &str, now: DateTime<Utc>) -> Entitlement {
        if let Some(existing) = self.features_usage.get(feature_slug).cloned() {
            if self.needs_refresh(&existing, now) {
                if existing.is_placeholder() {
                    return self.revalidate_entitlement(project_id, feature_slug, now).await;
                }
                self.spawn_background_refresh(project_id.to_string(), feature_slug.to_string());
                return existing;
            }
            return existing;
        }
        self.revalidate_entitlement(project_id, feature_slug, now).await
    }

    fn needs_refresh(&self, entitlement: &Entitlement, now: DateTime<Utc>) -> bool {
        if entitlement.is_placeholder() {
            return now.timestamp_millis() - entitlement.updated_at_m >= self.placeholder_ttl_ms();
        }
        let cycle_config = to_cycle_config(&entitlement.active_phase);
        calculate_cycle_window(
            entitlement.active_phase.start_at,
            entitlement.active_phase.end_at,
            entitlement.active_phase.trial_ends_at,
            now,
            &cycle_config,
        )
        .is_none()
    }

    /// Refreshes in a detached task and loops the result back through the
    /// mailbox as [`ShardMessage::ApplyRefresh`], so `features_usage` still
    /// has exactly one writer; the caller that triggered this does not wait
    /// on it.
    fn spawn_background_refresh(&self, project_id: String, feature_slug: String) {
        let customer_service = Arc::clone(&self.customer_service);
        let customer_id = self.customer_id.clone();
        let self_tx = self.self_tx.clone();
        let now = Utc::now();
        tokio::spawn(async move {
            let entitlement = match customer_service
                .get_active_entitlement(&customer_id, &project_id, &feature_slug)
                .await
            {
                Ok(Some(entitlement)) => entitlement,
                Ok(None) => Entitlement::placeholder(&customer_id, &project_id, &feature_slug, now),
                Err(e) => {
                    warn!(error = %e, feature_slug, "background entitlement refresh failed");
                    Entitlement::placeholder(&customer_id, &project_id, &feature_slug, now)
                }
            };
            let _ = self_tx
                .send(ShardMessage::ApplyRefresh {
                    feature_slug,
                    entitlement,
                })
                .await;
        });
    }

    async fn revalidate_entitlement(&mut self, project_id: &str, feature_slug: &str, now: DateTime<Utc>) -> Entitlement {
        self.flush_feature_best_effort(feature_slug).await;

        match self
            .customer_service
            .get_active_entitlement(&self.customer_id, project_id, feature_slug)
            .await
        {
            Ok(Some(entitlement)) => {
                self.persist_entitlement(&entitlement);
                entitlement
            }
            Ok(None) => {
                let placeholder = Entitlement::placeholder(&self.customer_id, project_id, feature_slug, now);
                self.persist_entitlement(&placeholder);
                placeholder
            }
            Err(e) => {
                warn!(error = %e, feature_slug, "entitlement hydration failed, writing placeholder");
                let placeholder = Entitlement::placeholder(&self.customer_id, project_id, feature_slug, now);
                self.persist_entitlement(&placeholder);
                placeholder
            }
        }
    }

    fn persist_entitlement(&mut self, entitlement: &Entitlement) {
        self.features_usage
            .insert(entitlement.feature_slug.clone(), entitlement.clone());
        if let Ok(bytes) = serde_json::to_vec(entitlement) {
            let _ = self.store.put(&entitlement.key(), &bytes);
        }
    }

    async fn flush_feature_best_effort(&mut self, _feature_slug: &str) {
        self.flush_verifications().await;
        self.flush_usage().await;
    }

    async fn verify(&mut self, req: VerifyRequest) -> VerifyResponse {
        if self.ensure_initialized().is_err() {
            return denied(DeniedReason::DoNotInitialized);
        }
        let now = millis_to_datetime(req.timestamp);

        if req.from_cache {
            return self.verify_from_cache(req, now).await;
        }

        let mut entitlement = self.get_entitlement(&req.project_id, &req.feature_slug, now).await;

        let (allowed, denied_reason) = self.apply_limit_check(&mut entitlement, now);
        self.persist_entitlement(&entitlement);

        let latency_ms = (now.timestamp_millis() - req.performance_start).max(0);
        let verification = VerificationRecord {
            entitlement_id: entitlement.entitlement_id.clone(),
            customer_id: self.customer_id.clone(),
            project_id: req.project_id.clone(),
            feature_slug: req.feature_slug.clone(),
            request_id: req.request_id.clone(),
            timestamp: req.timestamp,
            success: allowed,
            latency_ms: Decimal::from(latency_ms),
            denied_reason,
            subscription_id: entitlement.subscription_id.clone(),
            subscription_item_id: entitlement.subscription_item_id.clone(),
            metadata: req.metadata.clone().unwrap_or(serde_json::json!({})),
            created_at: req.timestamp,
        };
        if let Err(e) = self.store.insert_verification(&verification) {
            error!(error = %e, "failed to insert verification record");
        }

        self.ensure_alarm(req.flush_time_sec);

        VerifyResponse {
            allowed,
            message: None,
            denied_reason,
            limit: entitlement.limit,
            usage: Some(entitlement.current_cycle_usage),
            latency_ms: Some(latency_ms),
            cache_hit: false,
        }
    }

    async fn verify_from_cache(&mut self, req: VerifyRequest, now: DateTime<Utc>) -> VerifyResponse {
        let fetched = self
            .customer_service
            .get_active_entitlement(&self.customer_id, &req.project_id, &req.feature_slug)
            .await
            .ok()
            .flatten();

        let (allowed, denied_reason, limit, usage) = match fetched {
            Some(mut entitlement) => {
                let (allowed, reason) = self.apply_limit_check(&mut entitlement, now);
                (allowed, reason, entitlement.limit, Some(entitlement.current_cycle_usage))
            }
            None => (false, Some(DeniedReason::EntitlementNotFound), None, None),
        };

        let store = Arc::clone(&self.store);
        let customer_id = self.customer_id.clone();
        let mut metadata = req.metadata.clone().unwrap_or(serde_json::json!({}));
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("fromCache".to_string(), serde_json::Value::Bool(true));
        }
        let record = VerificationRecord {
            entitlement_id: String::new(),
            customer_id,
            project_id: req.project_id.clone(),
            feature_slug: req.feature_slug.clone(),
            request_id: req.request_id.clone(),
            timestamp: req.timestamp,
            success: allowed,
            latency_ms: Decimal::ZERO,
            denied_reason,
            subscription_id: String::new(),
            subscription_item_id: String::new(),
            metadata,
            created_at: req.timestamp,
        };
        tokio::spawn(async move {
            let _ = store.insert_verification(&record);
        });

        VerifyResponse {
            allowed,
            message: None,
            denied_reason,
            limit,
            usage,
            latency_ms: None,
            cache_hit: false,
        }
    }

    fn apply_limit_check(&self, entitlement: &mut Entitlement, now: DateTime<Utc>) -> (bool, Option<DeniedReason>) {
        if entitlement.is_placeholder() {
            return (false, Some(DeniedReason::EntitlementNotFound));
        }

        self.apply_auto_reset(entitlement, now);

        match entitlement.feature_type {
            FeatureType::Flat => (true, None),
            FeatureType::Tier | FeatureType::Package | FeatureType::Usage => {
                let allowed = match (entitlement.limit, entitlement.limit_type) {
                    (Some(limit), LimitType::Hard) => entitlement.current_cycle_usage < limit,
                    _ => true,
                };
                if allowed {
                    (true, None)
                } else {
                    (false, Some(DeniedReason::LimitExceeded))
                }
            }
        }
    }

    fn apply_auto_reset(&self, entitlement: &mut Entitlement, now: DateTime<Utc>) {
        let cycle_config = to_cycle_config(&entitlement.active_phase);
        if let Some(window) = calculate_cycle_window(
            entitlement.active_phase.start_at,
            entitlement.active_phase.end_at,
            entitlement.active_phase.trial_ends_at,
            now,
            &cycle_config,
        ) {
            if window.start > entitlement.reseted_at {
                entitlement.current_cycle_usage = Decimal::ZERO;
                entitlement.reseted_at = window.start;
            }
        }
    }

    async fn report(&mut self, req: ReportRequest) -> ReportResponse {
        if self.ensure_initialized().is_err() {
            return ReportResponse {
                allowed: false,
                message: Some("shard not initialized".to_string()),
                limit: None,
                usage: None,
                denied_reason: Some(DeniedReason::DoNotInitialized),
                cache_hit: false,
            };
        }

        if !req.usage.is_sign_positive() && !req.usage.is_zero() {
            return ReportResponse {
                allowed: false,
                message: Some("usage must be non-negative".to_string()),
                limit: None,
                usage: None,
                denied_reason: Some(DeniedReason::IncorrectUsageReporting),
                cache_hit: false,
            };
        }

        let now = millis_to_datetime(req.timestamp);
        let mut entitlement = self.get_entitlement(&req.project_id, &req.feature_slug, now).await;

        if entitlement.is_placeholder() {
            return ReportResponse {
                allowed: false,
                message: None,
                limit: None,
                usage: None,
                denied_reason: Some(DeniedReason::EntitlementNotFound),
                cache_hit: false,
            };
        }

        self.apply_auto_reset(&mut entitlement, now);

        let stored_usage = match entitlement.feature_type {
            FeatureType::Flat => Decimal::ZERO,
            _ => req.usage,
        };
        let new_cycle_usage = entitlement.current_cycle_usage + stored_usage;

        if let (Some(limit), LimitType::Hard) = (entitlement.limit, entitlement.limit_type) {
            if new_cycle_usage > limit {
                return ReportResponse {
                    allowed: false,
                    message: None,
                    limit: Some(limit),
                    usage: Some(entitlement.current_cycle_usage),
                    denied_reason: Some(DeniedReason::LimitExceeded),
                    cache_hit: false,
                };
            }
        }

        let record = UsageRecord {
            entitlement_id: entitlement.entitlement_id.clone(),
            customer_id: self.customer_id.clone(),
            project_id: req.project_id.clone(),
            feature_slug: req.feature_slug.clone(),
            usage: stored_usage,
            timestamp: req.timestamp,
            idempotence_key: req.idempotence_key.clone(),
            request_id: req.request_id.clone(),
            subscription_id: entitlement.subscription_id.clone(),
            subscription_item_id: entitlement.subscription_item_id.clone(),
            metadata: req.metadata.clone().unwrap_or(serde_json::json!({})),
            created_at: req.timestamp,
        };
        if let Err(e) = self.store.insert_usage(&record) {
            error!(error = %e, "failed to insert usage record");
            return ReportResponse {
                allowed: false,
                message: Some(e.to_string()),
                limit: entitlement.limit,
                usage: Some(entitlement.current_cycle_usage),
                denied_reason: Some(DeniedReason::ErrorInsertingUsageDo),
                cache_hit: false,
            };
        }

        entitlement.current_cycle_usage = new_cycle_usage;
        entitlement.accumulated_usage += stored_usage;
        entitlement.last_usage_update_at = req.timestamp;
        self.persist_entitlement(&entitlement);
        self.dirty_features.insert(req.feature_slug.clone());

        self.schedule_cache_writeback(&req.feature_slug).await;
        self.ensure_alarm(req.flush_time_sec);

        ReportResponse {
            allowed: true,
            message: None,
            limit: entitlement.limit,
            usage: Some(new_cycle_usage),
            denied_reason: None,
            cache_hit: false,
        }
    }

    /// Cache write-back debouncer (`spec.md` §4.4.5): flush immediately if
    /// `MAX_FLUSH_INTERVAL` has elapsed since the last write-back for this
    /// feature, otherwise let the coalesced alarm carry it.
    async fn schedule_cache_writeback(&mut self, feature_slug: &str) {
        let now = TokioInstant::now();
        let max_interval = tokio::time::Duration::from_millis(self.config.debounce.max_flush_interval_ms);
        let due = match self.last_flush_at.get(feature_slug) {
            Some(last) => now.saturating_duration_since(*last) >= max_interval,
            None => true,
        };
        if due {
            self.write_back_feature(feature_slug).await;
            self.last_flush_at.insert(feature_slug.to_string(), now);
        } else {
            self.ensure_alarm(Some(self.config.debounce.debounce_delay_ms / 1000));
        }
    }

    async fn write_back_feature(&mut self, feature_slug: &str) {
        if let Some(entitlement) = self.features_usage.get(feature_slug).cloned() {
            if let Err(e) = self.customer_service.write_back(&entitlement).await {
                warn!(error = %e, feature_slug, "cache write-back failed");
            } else {
                self.dirty_features.remove(feature_slug);
            }
        }
    }

    fn ensure_alarm(&mut self, flush_time_sec: Option<u64>) {
        self.alarm
            .ensure_set(TokioInstant::now(), flush_time_sec, self.config.ttl.analytics_secs);
    }

    async fn prewarm(&mut self, project_id: &str) -> LimiterResult<()> {
        self.ensure_initialized()?;
        let now = Utc::now();
        let stale = (now.timestamp_millis() - self.shard_config.last_sync_usage_at)
            >= (self.config.ttl.sync_usage_secs as i64 * 1000);
        if stale {
            let slugs: Vec<String> = self.features_usage.keys().cloned().collect();
            for slug in slugs {
                let entitlement = self.revalidate_entitlement(project_id, &slug, now).await;
                self.persist_entitlement(&entitlement);
            }
            self.shard_config.last_sync_usage_at = now.timestamp_millis();
            self.store
                .put(SHARD_CONFIG_KEY, &serde_json::to_vec(&self.shard_config).unwrap())?;
        }
        Ok(())
    }

    /// Alarm-driven flush (`spec.md` §4.4.6).
    async fn on_alarm(&mut self) {
        self.flush_verifications().await;
        self.flush_usage().await;

        let dirty: Vec<String> = self.dirty_features.iter().cloned().collect();
        for slug in dirty {
            self.write_back_feature(&slug).await;
        }

        let now = Utc::now();
        if (now.timestamp_millis() - self.shard_config.last_sync_usage_at)
            >= (self.config.ttl.sync_usage_secs as i64 * 1000)
        {
            self.shard_config.last_sync_usage_at = now.timestamp_millis();
            let _ = self
                .store
                .put(SHARD_CONFIG_KEY, &serde_json::to_vec(&self.shard_config).unwrap());
        }
        info!(customer_id = %self.customer_id, "alarm flush cycle complete");
    }

    async fn flush_verifications(&mut self) {
        let batch_size = self.config.batch.batch_size;
        loop {
            let batch = match self.store.select_verification_batch(1, batch_size) {
                Ok(b) if !b.is_empty() => b,
                _ => break,
            };
            let rows: Vec<VerificationRow> = batch
                .iter()
                .map(|(_, record)| VerificationRow {
                    entitlement_id: record.entitlement_id.clone(),
                    customer_id: record.customer_id.clone(),
                    project_id: record.project_id.clone(),
                    feature_slug: record.feature_slug.clone(),
                    request_id: record.request_id.clone(),
                    timestamp: record.timestamp,
                    success: record.success,
                    latency_ms: record.latency_ms.to_string(),
                    denied_reason: record.denied_reason.map(|r| format!("{r:?}")),
                    metadata: record.metadata.clone(),
                })
                .collect();

            let first_id = batch.first().unwrap().0;
            let last_id = batch.last().unwrap().0;

            match self.sink.ingest_verification(&rows).await {
                Ok(outcome) if outcome.covers(rows.len()) => {
                    if let Err(e) = self.store.delete_verification_range(first_id, last_id) {
                        error!(error = %e, "failed to delete acknowledged verification range");
                        break;
                    }
                }
                _ => {
                    warn!("verification flush incomplete, will retry at next alarm");
                    break;
                }
            }
        }
    }

    async fn flush_usage(&mut self) {
        let batch_size = self.config.batch.batch_size;
        loop {
            let batch = match self.store.select_usage_batch(1, batch_size) {
                Ok(b) if !b.is_empty() => b,
                _ => break,
            };

            let mut seen_keys = HashSet::new();
            let mut rows = Vec::with_capacity(batch.len());
            for (_, record) in &batch {
                let key = if self.is_production {
                    record.idempotence_key.clone()
                } else {
                    non_production_idempotence_key(&record.idempotence_key, record.timestamp)
                };
                if !seen_keys.insert(key) {
                    continue;
                }
                rows.push(UsageRow {
                    entitlement_id: record.entitlement_id.clone(),
                    customer_id: record.customer_id.clone(),
                    project_id: record.project_id.clone(),
                    feature_slug: record.feature_slug.clone(),
                    usage: record.usage.to_string(),
                    timestamp: record.timestamp,
                    idempotence_key: record.idempotence_key.clone(),
                    request_id: record.request_id.clone(),
                    metadata: record.metadata.clone(),
                });
            }

            let first_id = batch.first().unwrap().0;
            let last_id = batch.last().unwrap().0;

            match self.sink.ingest_usage(&rows).await {
                Ok(outcome) if outcome.covers(rows.len()) => {
                    if let Err(e) = self.store.delete_usage_range(first_id, last_id) {
                        error!(error = %e, "failed to delete acknowledged usage range");
                        break;
                    }
                }
                _ => {
                    warn!("usage flush incomplete, will retry at next alarm");
                    break;
                }
            }
        }
    }

    /// `resetDO` (`spec.md` §4.4.7).
    async fn reset_do(&mut self) -> LimiterResult<Vec<String>> {
        self.flush_verifications().await;
        self.flush_usage().await;

        if self.store.count_all() > 0 {
            return Err(LimiterError::Durable(
                "pending records remain after flush, refusing to reset".to_string(),
            ));
        }

        let slugs: Vec<String> = self.features_usage.keys().cloned().collect();
        self.store.delete_all()?;
        self.features_usage.clear();
        self.dirty_features.clear();
        self.last_flush_at.clear();
        self.alarm.clear();
        self.initialized = false;
        Ok(slugs)
    }
}

fn feature_key(kv_key: &str) -> String {
    kv_key.rsplit(':').next().unwrap_or(kv_key).to_string()
}

fn to_cycle_config(phase: &crate::domain::SubscriptionPhase) -> CycleConfig {
    CycleConfig {
        interval: phase.billing_interval,
        interval_count: phase.billing_interval_count,
        anchor: phase.billing_anchor,
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn denied(reason: DeniedReason) -> VerifyResponse {
    VerifyResponse {
        allowed: false,
        message: None,
        denied_reason: Some(reason),
        limit: None,
        usage: None,
        latency_ms: None,
        cache_hit: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SubscriptionPhase;
    use crate::hydrate::StaticCustomerService;
    use async_trait::async_trait;
    use quotaflow_cycle::{Anchor, Interval};
    use quotaflow_sink::error::SinkResult;
    use quotaflow_sink::IngestOutcome;

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

    fn make_entitlement(customer: &str, project: &str, feature: &str, limit: Option<i64>, usage: i64) -> Entitlement {
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
            current_cycle_usage: Decimal::from(usage),
            accumulated_usage: Decimal::from(usage),
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

    async fn spawn_test_shard(customer_service: Arc<StaticCustomerService>) -> (ShardHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::open(dir.path()).unwrap();
        let handle = spawn_shard(
            "cust1".to_string(),
            store,
            Arc::new(NullSink),
            customer_service,
            Arc::new(LimiterConfig::default()),
            "iad".to_string(),
            true,
        )
        .unwrap();
        (handle, dir)
    }

    fn verify_req(feature: &str) -> VerifyRequest {
        VerifyRequest {
            customer_id: "cust1".to_string(),
            project_id: "proj1".to_string(),
            feature_slug: feature.to_string(),
            request_id: "req1".to_string(),
            timestamp: Utc::now().timestamp_millis(),
            performance_start: Utc::now().timestamp_millis(),
            flush_time_sec: None,
            metadata: None,
            from_cache: false,
        }
    }

    fn report_req(feature: &str, usage: i64, idem: &str) -> ReportRequest {
        ReportRequest {
            customer_id: "cust1".to_string(),
            project_id: "proj1".to_string(),
            feature_slug: feature.to_string(),
            usage: Decimal::from(usage),
            idempotence_key: idem.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            flush_time_sec: None,
            request_id: "req1".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn s1_allow_within_limit() {
        let service = Arc::new(StaticCustomerService::new());
        service.seed(make_entitlement("cust1", "proj1", "api-calls", Some(100), 10));
        let (handle, _dir) = spawn_test_shard(service).await;

        let report = handle.report(report_req("api-calls", 5, "idem1")).await.unwrap();
        assert!(report.allowed);
        assert_eq!(report.usage, Some(Decimal::from(15)));

        let verify = handle.verify(verify_req("api-calls")).await.unwrap();
        assert!(verify.allowed);
        assert_eq!(verify.usage, Some(Decimal::from(15)));
    }

    #[tokio::test]
    async fn s2_hard_deny_does_not_mutate_counters() {
        let service = Arc::new(StaticCustomerService::new());
        service.seed(make_entitlement("cust1", "proj1", "api-calls", Some(100), 99));
        let (handle, _dir) = spawn_test_shard(service).await;

        let report = handle.report(report_req("api-calls", 5, "idem1")).await.unwrap();
        assert!(!report.allowed);
        assert_eq!(report.denied_reason, Some(DeniedReason::LimitExceeded));
        assert_eq!(report.usage, Some(Decimal::from(99)));
    }

    #[tokio::test]
    async fn s3_flat_feature_reports_zero_usage() {
        let service = Arc::new(StaticCustomerService::new());
        let mut entitlement = make_entitlement("cust1", "proj1", "seat", None, 0);
        entitlement.feature_type = FeatureType::Flat;
        service.seed(entitlement);
        let (handle, _dir) = spawn_test_shard(service).await;

        let report = handle.report(report_req("seat", 7, "idem1")).await.unwrap();
        assert!(report.allowed);
        assert_eq!(report.usage, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn s5_placeholder_short_circuits_without_hydration_retry() {
        let service = Arc::new(StaticCustomerService::new());
        let (handle, _dir) = spawn_test_shard(service).await;

        let first = handle.verify(verify_req("unknown-feature")).await.unwrap();
        assert_eq!(first.denied_reason, Some(DeniedReason::EntitlementNotFound));

        let second = handle.verify(verify_req("unknown-feature")).await.unwrap();
        assert_eq!(second.denied_reason, Some(DeniedReason::EntitlementNotFound));
    }

    #[tokio::test]
    async fn s6_reset_returns_feature_slugs() {
        let service = Arc::new(StaticCustomerService::new());
        service.seed(make_entitlement("cust1", "proj1", "api-calls", Some(100), 10));
        let (handle, _dir) = spawn_test_shard(service).await;

        handle.verify(verify_req("api-calls")).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        let slugs = handle.reset().await.unwrap();
        assert!(slugs.contains(&"api-calls".to_string()));
    }

    /// Covers the Open Question resolution in `DESIGN.md`: a present but
    /// stale entitlement is returned immediately, and the background
    /// refresh it kicks off is visible only on a later call.
    #[tokio::test]
    async fn background_refresh_does_not_block_the_caller() {
        let service = Arc::new(StaticCustomerService::new());
        let mut expired = make_entitlement("cust1", "proj1", "api-calls", Some(100), 50);
        expired.active_phase.end_at = Some(Utc::now() - chrono::Duration::days(1));
        service.seed(expired);
        let (handle, _dir) = spawn_test_shard(Arc::clone(&service)).await;

        let first = handle.verify(verify_req("api-calls")).await.unwrap();
        assert_eq!(first.usage, Some(Decimal::from(50)));

        let mut refreshed = make_entitlement("cust1", "proj1", "api-calls", Some(100), 77);
        refreshed.active_phase.end_at = None;
        service.seed(refreshed);

        let stale = handle.verify(verify_req("api-calls")).await.unwrap();
        assert_eq!(stale.usage, Some(Decimal::from(50)));

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let caught_up = handle.verify(verify_req("api-calls")).await.unwrap();
        assert_eq!(caught_up.usage, Some(Decimal::from(77)));
    }

    #[tokio::test]
    async fn report_rejects_negative_usage() {
        let service = Arc::new(StaticCustomerService::new());
        service.seed(make_entitlement("cust1", "proj1", "api-calls", Some(100), 10));
        let (handle, _dir) = spawn_test_shard(service).await;

        let response = handle.report(report_req("api-calls", -1, "idem1")).await.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.denied_reason, Some(DeniedReason::IncorrectUsageReporting));
    }
}
