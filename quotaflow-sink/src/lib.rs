//! Batch HTTP analytics ingest client.
//!
//! The limiter shard buffers usage and verification rows locally and
//! periodically drains them here in batches of at most [`MAX_BATCH_SIZE`].
//! The sink is assumed to deduplicate by idempotence key in production; the
//! non-production key composition in [`non_production_idempotence_key`]
//! exists so replayed test traffic does not collide with itself.

pub mod error;
mod retry;

use async_trait::async_trait;
use error::{SinkError, SinkResult};
use retry::{RetryConfig, RetryExecutor};
use serde::{Deserialize, Serialize};

/// Hard cap on rows per ingest call.
pub const MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub entitlement_id: String,
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub usage: String,
    pub timestamp: i64,
    pub idempotence_key: String,
    pub request_id: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRow {
    pub entitlement_id: String,
    pub customer_id: String,
    pub project_id: String,
    pub feature_slug: String,
    pub request_id: String,
    pub timestamp: i64,
    pub success: bool,
    pub latency_ms: String,
    pub denied_reason: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestOutcome {
    pub successful: usize,
    pub quarantined: usize,
}

impl IngestOutcome {
    pub fn covers(&self, batch_size: usize) -> bool {
        self.successful + self.quarantined >= batch_size
    }
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a, T> {
    rows: &'a [T],
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    successful: usize,
    quarantined: usize,
}

/// Composes the non-production idempotence key so replayed fixtures never
/// collide with a prior run's rows at the sink.
pub fn non_production_idempotence_key(idempotence_key: &str, timestamp: i64) -> String {
    format!("{idempotence_key}:{timestamp}")
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn ingest_usage(&self, batch: &[UsageRow]) -> SinkResult<IngestOutcome>;
    async fn ingest_verification(&self, batch: &[VerificationRow]) -> SinkResult<IngestOutcome>;
}

pub struct HttpAnalyticsSink {
    client: reqwest::Client,
    base_url: String,
    retry: RetryExecutor,
}

impl HttpAnalyticsSink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry(base_url, RetryConfig::default())
    }

    pub fn with_retry(base_url: impl Into<String>, retry_config: RetryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            retry: RetryExecutor::new(retry_config),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, rows: &[T]) -> SinkResult<IngestOutcome> {
        if rows.len() > MAX_BATCH_SIZE {
            return Err(SinkError::BatchTooLarge {
                max: MAX_BATCH_SIZE,
                got: rows.len(),
            });
        }
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let body = IngestRequest { rows };

        self.retry
            .execute(|| async {
                let response = self
                    .client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| SinkError::NetworkError(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(SinkError::ResponseError(format!(
                        "sink returned status {}",
                        response.status()
                    )));
                }

                let parsed: IngestResponse = response
                    .json()
                    .await
                    .map_err(|e| SinkError::ResponseError(e.to_string()))?;

                Ok(IngestOutcome {
                    successful: parsed.successful,
                    quarantined: parsed.quarantined,
                })
            })
            .await
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn ingest_usage(&self, batch: &[UsageRow]) -> SinkResult<IngestOutcome> {
        self.post("usage", batch).await
    }

    async fn ingest_verification(&self, batch: &[VerificationRow]) -> SinkResult<IngestOutcome> {
        self.post("verifications", batch).await
    }
}
