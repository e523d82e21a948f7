//! Usage limiter process entry point: loads configuration, wires the
//! router, and serves Verify/Report over a line-delimited JSON protocol.
//! Framing here is deliberately minimal glue, not a new wire protocol.

use clap::Parser;
use quotaflow_core::config::{Environment, LimiterConfig};
use quotaflow_core::domain::{ReportRequest, VerifyRequest};
use quotaflow_core::hydrate::{CustomerService, SharedCustomerService};
use quotaflow_core::{health, LimiterError, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "quotaflow-core", about = "Per-customer usage limiter")]
struct Cli {
    /// Path to a TOML config file. Falls back to environment defaults.
    #[arg(long)]
    config: Option<String>,

    /// Deployment environment preset, used when `--config` is not given.
    #[arg(long, value_enum, default_value = "dev")]
    env: CliEnvironment,

    /// Analytics sink base URL.
    #[arg(long, env = "ANALYTICS_SINK_URL")]
    sink_url: Option<String>,

    /// OTLP collector endpoint, if tracing export is enabled.
    #[arg(long, env = "OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliEnvironment {
    Dev,
    Preview,
    Production,
}

impl From<CliEnvironment> for Environment {
    fn from(value: CliEnvironment) -> Self {
        match value {
            CliEnvironment::Dev => Environment::Dev,
            CliEnvironment::Preview => Environment::Preview,
            CliEnvironment::Production => Environment::Production,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum Frame {
    Verify(VerifyRequest),
    Report(ReportRequest),
    Health,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum FrameResponse {
    Ok(serde_json::Value),
    Err { error: String },
}

struct NoopCustomerService;

#[async_trait::async_trait]
impl CustomerService for NoopCustomerService {
    async fn get_active_entitlement(
        &self,
        _customer_id: &str,
        _project_id: &str,
        _feature_slug: &str,
    ) -> quotaflow_core::LimiterResult<Option<quotaflow_core::domain::Entitlement>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let environment: Environment = cli.env.into();

    let config = match &cli.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::for_environment(environment),
    };

    let log_format = if environment.is_production() {
        quotaflow_telemetry::LogFormat::Json
    } else {
        quotaflow_telemetry::LogFormat::Pretty
    };
    if let Err(e) = quotaflow_telemetry::init("quotaflow-core", log_format, cli.otlp_endpoint.as_deref()) {
        eprintln!("telemetry init failed: {e}");
    }

    info!(bind_address = %config.server.bind_address, "starting quotaflow-core");

    let sink: Arc<dyn quotaflow_sink::AnalyticsSink> = match &cli.sink_url {
        Some(url) => Arc::new(quotaflow_sink::HttpAnalyticsSink::new(url.clone())),
        None => {
            warn!("no --sink-url configured, analytics rows will accumulate unflushed");
            Arc::new(quotaflow_sink::HttpAnalyticsSink::new("http://localhost:0"))
        }
    };
    let customer_service: SharedCustomerService = Arc::new(NoopCustomerService);

    let router = Arc::new(Router::new(
        sink,
        customer_service,
        Arc::new(config.clone()),
        detect_colo(),
        environment.is_production(),
    ));

    let listener = TcpListener::bind(&config.server.bind_address).await?;
    info!(addr = %config.server.bind_address, "listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, router).await {
                error!(error = %e, %peer, "connection handler failed");
            }
        });
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    router: Arc<Router>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => dispatch(&router, frame).await,
            Err(e) => FrameResponse::Err {
                error: format!("malformed frame: {e}"),
            },
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}

async fn dispatch(router: &Router, frame: Frame) -> FrameResponse {
    let result = match frame {
        Frame::Verify(req) => router
            .verify(req, false)
            .await
            .and_then(|r| serde_json::to_value(r).map_err(|e| LimiterError::Fatal(e.to_string()))),
        Frame::Report(req) => router
            .report(req, false)
            .await
            .and_then(|r| serde_json::to_value(r).map_err(|e| LimiterError::Fatal(e.to_string()))),
        Frame::Health => {
            serde_json::to_value(health::check(router)).map_err(|e| LimiterError::Fatal(e.to_string()))
        }
    };
    match result {
        Ok(value) => FrameResponse::Ok(value),
        Err(e) => FrameResponse::Err { error: e.to_string() },
    }
}

/// One-shot external colo probe (`spec.md` §4.4.1); a real deployment would
/// query its platform's metadata service here.
fn detect_colo() -> String {
    std::env::var("COLO").unwrap_or_else(|_| "local".to_string())
}
