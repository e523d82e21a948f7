//! Logging and tracing bootstrap shared by the limiter binary.
//!
//! Plain `tracing-subscriber` by default; the `otlp` feature layers in a
//! span exporter for environments that run a collector.

use thiserror::Error;
use tracing_subscriber::{
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install global subscriber: {0}")]
    Init(#[from] TryInitError),
    #[cfg(feature = "otlp")]
    #[error("failed to build OTLP exporter: {0}")]
    Otlp(String),
}

/// Installs the process-wide tracing subscriber. Safe to call once at
/// startup; a second call will error, which callers can ignore in tests.
pub fn init(service_name: &str, format: LogFormat, otlp_endpoint: Option<&str>) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if format == LogFormat::Json {
        let registry = registry.with(tracing_subscriber::fmt::layer().json());
        return finish_init(registry, service_name, otlp_endpoint);
    }
    let registry = registry.with(tracing_subscriber::fmt::layer());
    finish_init(registry, service_name, otlp_endpoint)
}

fn finish_init<S>(registry: S, service_name: &str, otlp_endpoint: Option<&str>) -> Result<(), TelemetryError>
where
    S: tracing::Subscriber + Send + Sync + 'static,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{

    #[cfg(feature = "otlp")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer = build_otlp_tracer(service_name, endpoint)?;
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            return Ok(registry.with(otel_layer).try_init()?);
        }
    }
    #[cfg(not(feature = "otlp"))]
    {
        let _ = (service_name, otlp_endpoint);
    }

    Ok(registry.try_init()?)
}

#[cfg(feature = "otlp")]
fn build_otlp_tracer(
    service_name: &str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![KeyValue::new("service.name", service_name.to_string())]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| TelemetryError::Otlp(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_variants_are_distinct() {
        assert_ne!(LogFormat::Pretty, LogFormat::Json);
    }
}
