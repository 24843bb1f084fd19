//! Metrics Reporter
//!
//! Periodically samples the traffic counters and host statistics and pushes
//! a JSON report to `<backend>/api/metrics/ingest`.
//!
//! Every tick is independent: a failed POST is logged and dropped, with no
//! retry and no backoff carried into the next tick.

use crate::config::AgentConfig;
use crate::counters::{CounterSnapshot, Counters};
use crate::system::{SystemSampler, SystemStats};
use crate::tunnel::PublicUrl;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = "LocalRun-Metrics-Collector/1.0";

/// Errors from a single report attempt
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("HTTP error sending metrics: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    UnexpectedStatus(u16),
}

/// Report body sent to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub provider: String,
    pub tunnel_id: String,
    pub tunnel_port: String,
    /// Unix time in fractional seconds
    pub timestamp: f64,
    /// category -> key -> value
    pub metrics: BTreeMap<String, Map<String, Value>>,
}

impl MetricsReport {
    fn category(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Assemble a report from a counter snapshot and host sample
    pub fn assemble(
        identity: &ReportIdentity,
        counters: CounterSnapshot,
        uptime: Duration,
        system: SystemStats,
        public_url: Option<String>,
    ) -> Self {
        let mut tunnel = Self::category(json!({
            "status": "running",
            "uptime_seconds": uptime.as_secs_f64(),
        }));
        if let Some(url) = public_url {
            tunnel.insert("public_url".to_string(), Value::String(url));
        }

        let mut metrics = BTreeMap::new();
        metrics.insert("tunnel".to_string(), tunnel);
        metrics.insert(
            "requests".to_string(),
            Self::category(json!({
                "total": counters.requests,
                "errors": counters.errors,
            })),
        );
        metrics.insert(
            "bandwidth".to_string(),
            Self::category(json!({
                "bytes_in": counters.bytes_in,
                "bytes_out": counters.bytes_out,
            })),
        );
        metrics.insert(
            "container".to_string(),
            Self::category(json!({
                "memory_usage_bytes": system.process_memory_bytes,
                "memory_percent": system.memory_percent,
                "cpu_percent": system.cpu_percent,
            })),
        );

        Self {
            provider: identity.provider.clone(),
            tunnel_id: identity.tunnel_id.clone(),
            tunnel_port: identity.tunnel_port.clone(),
            timestamp: unix_timestamp(),
            metrics,
        }
    }
}

/// Fields identifying the tunnel in every report
#[derive(Debug, Clone)]
pub struct ReportIdentity {
    pub provider: String,
    pub tunnel_id: String,
    pub tunnel_port: String,
}

impl From<&AgentConfig> for ReportIdentity {
    fn from(config: &AgentConfig) -> Self {
        Self {
            provider: config.provider.to_string(),
            tunnel_id: config.tunnel_id.clone(),
            tunnel_port: config.port.to_string(),
        }
    }
}

/// Current wall-clock time as fractional Unix seconds
fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Periodic metrics pusher
pub struct MetricsReporter {
    client: Client,
    endpoint: String,
    identity: ReportIdentity,
    interval: Duration,
    counters: Arc<Counters>,
    public_url: PublicUrl,
    sampler: SystemSampler,
}

impl MetricsReporter {
    /// Create a reporter, or `None` when no backend is configured
    pub fn new(
        config: &AgentConfig,
        counters: Arc<Counters>,
        public_url: PublicUrl,
    ) -> Result<Option<Self>, ReportError> {
        let Some(endpoint) = config.ingest_url() else {
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(REPORT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Some(Self {
            client,
            endpoint,
            identity: ReportIdentity::from(config),
            interval: config.metrics_interval,
            counters,
            public_url,
            sampler: SystemSampler::new(),
        }))
    }

    /// Start the ticker task, or log and return `None` when disabled
    pub fn spawn(
        config: &AgentConfig,
        counters: Arc<Counters>,
        public_url: PublicUrl,
    ) -> Result<Option<JoinHandle<()>>, ReportError> {
        match Self::new(config, counters, public_url)? {
            Some(reporter) => Ok(Some(tokio::spawn(reporter.run()))),
            None => {
                info!("No backend URL provided, metrics collection disabled");
                Ok(None)
            }
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build a fresh report from current state
    pub fn build_report(&mut self) -> MetricsReport {
        let counters = self.counters.snapshot();
        let system = self.sampler.sample();

        MetricsReport::assemble(
            &self.identity,
            counters,
            self.counters.uptime(),
            system,
            self.public_url.get(),
        )
    }

    /// POST one report; 200 and 201 are success
    pub async fn send(&self, report: &MetricsReport) -> Result<(), ReportError> {
        let response = self.client.post(&self.endpoint).json(report).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(ReportError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// One reporting cycle
    pub async fn tick(&mut self) -> Result<MetricsReport, ReportError> {
        let report = self.build_report();
        self.send(&report).await?;
        Ok(report)
    }

    /// Tick forever; the first report goes out one interval after start
    pub async fn run(mut self) {
        info!(
            "Metrics reporter started: {} every {:?}",
            self.endpoint, self.interval
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.tick().await {
                Ok(report) => {
                    let requests = &report.metrics["requests"];
                    let bandwidth = &report.metrics["bandwidth"];
                    debug!(
                        requests = %requests["total"],
                        bytes_in = %bandwidth["bytes_in"],
                        bytes_out = %bandwidth["bytes_out"],
                        "Metrics sent"
                    );
                }
                Err(e) => warn!("Error sending metrics: {}", e),
            }
        }
    }
}
