//! Health-check surface, mirroring the teacher sidecar's health module:
//! a cheap, synchronous snapshot suitable for a liveness/readiness probe.

use crate::router::Router;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub shard_count: usize,
}

pub fn check(router: &Router) -> HealthReport {
    HealthReport {
        status: "ok",
        shard_count: router.shard_count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::hydrate::StaticCustomerService;
    use async_trait::async_trait;
    use quotaflow_sink::error::SinkResult;
    use quotaflow_sink::{AnalyticsSink, IngestOutcome, UsageRow, VerificationRow};
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

    #[test]
    fn reports_ok_with_no_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LimiterConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        let router = Router::new(
            Arc::new(NullSink),
            Arc::new(StaticCustomerService::new()),
            Arc::new(config),
            "iad".to_string(),
            true,
        );
        let report = check(&router);
        assert_eq!(report.status, "ok");
        assert_eq!(report.shard_count, 0);
    }
}
