//! Per-request analytics
//!
//! Every proxied request produces one [`AnalyticsEvent`]. Events go through a
//! bounded channel to a batching task that POSTs them to
//! `<backend>/analytics/batch` as `{"events": [...]}`.
//!
//! ```text
//! ReverseProxy ──try_send──► mpsc (bounded) ──► AnalyticsQueue ──► backend
//!   (never waits)                                 │
//!                                                 ├── batch full  → flush
//!                                                 ├── interval    → flush
//!                                                 └── shutdown    → final flush
//! ```
//!
//! A batch that fails to send is dropped, never re-queued. A full channel
//! drops the event instead of slowing the request.

use crate::config::AgentConfig;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const BATCH_TIMEOUT: Duration = Duration::from_secs(3);
const USER_AGENT: &str = "LocalRun-Analytics/1.0";

/// One proxied request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalyticsEvent {
    pub tunnel_id: String,
    pub ip: String,
    pub user_agent: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub request_size_bytes: u64,
    pub response_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_language: Option<String>,
    /// RFC 3339, millisecond precision, UTC
    pub timestamp: String,
}

#[derive(Serialize)]
struct Batch<'a> {
    events: &'a [AnalyticsEvent],
}

/// Batching parameters
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub endpoint: String,
    pub tunnel_id: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Events buffered between the proxy and the batcher
    pub queue_capacity: usize,
}

impl AnalyticsConfig {
    pub fn new(endpoint: impl Into<String>, tunnel_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tunnel_id: tunnel_id.into(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 10_000,
        }
    }

    /// Analytics settings for this agent, or `None` without a backend
    pub fn from_agent(config: &AgentConfig) -> Option<Self> {
        config
            .analytics_url()
            .map(|endpoint| Self::new(endpoint, config.tunnel_id.clone()))
    }
}

/// Producer side, held by the proxy
#[derive(Debug, Clone)]
pub struct AnalyticsSink {
    tx: mpsc::Sender<AnalyticsEvent>,
    tunnel_id: Arc<str>,
}

impl AnalyticsSink {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// Queue an event without waiting; drops it if the queue is full
    pub fn record(&self, event: AnalyticsEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Analytics event dropped: {}", e);
        }
    }

    /// Start measuring a request; the event is queued when the guard drops
    pub fn begin(&self, request: RequestInfo) -> PendingEvent {
        PendingEvent {
            sink: self.clone(),
            started: Instant::now(),
            request,
            status_code: 0,
            response_size_bytes: 0,
        }
    }
}

/// Request-side fields captured before forwarding
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub ip: String,
    pub user_agent: String,
    pub method: String,
    pub path: String,
    pub request_size_bytes: u64,
    pub referer: Option<String>,
    pub accept_language: Option<String>,
}

/// In-flight measurement of one request
///
/// Lives as long as the response body, so `response_time_ms` and
/// `response_size_bytes` cover the full transfer. Queues its event on drop,
/// including when the client disconnects mid-body.
#[derive(Debug)]
pub struct PendingEvent {
    sink: AnalyticsSink,
    started: Instant,
    request: RequestInfo,
    status_code: u16,
    response_size_bytes: u64,
}

impl PendingEvent {
    pub fn set_status(&mut self, status: u16) {
        self.status_code = status;
    }

    pub fn add_response_bytes(&mut self, n: u64) {
        self.response_size_bytes += n;
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        let request = std::mem::take(&mut self.request);
        self.sink.record(AnalyticsEvent {
            tunnel_id: self.sink.tunnel_id.to_string(),
            ip: request.ip,
            user_agent: request.user_agent,
            method: request.method,
            path: request.path,
            status_code: self.status_code,
            response_time_ms: self.started.elapsed().as_millis() as u64,
            request_size_bytes: request.request_size_bytes,
            response_size_bytes: self.response_size_bytes,
            referer: request.referer,
            accept_language: request.accept_language,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
    }
}

/// Running batcher; stop it with [`AnalyticsHandle::shutdown`]
pub struct AnalyticsHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AnalyticsHandle {
    /// Flush what is queued, then stop the batcher
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        // Final flush is bounded by the request timeout
        if tokio::time::timeout(BATCH_TIMEOUT * 2, self.task).await.is_err() {
            warn!("Analytics final flush timed out");
        }
    }
}

/// Batching consumer
pub struct AnalyticsQueue {
    client: Client,
    config: AnalyticsConfig,
    rx: mpsc::Receiver<AnalyticsEvent>,
    buffer: Vec<AnalyticsEvent>,
}

impl AnalyticsQueue {
    /// Build the channel and batcher without starting it
    pub fn new(config: AnalyticsConfig) -> Result<(AnalyticsSink, Self), reqwest::Error> {
        let client = Client::builder()
            .timeout(BATCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let sink = AnalyticsSink {
            tx,
            tunnel_id: Arc::from(config.tunnel_id.as_str()),
        };

        Ok((
            sink,
            Self {
                client,
                buffer: Vec::with_capacity(config.batch_size),
                config,
                rx,
            },
        ))
    }

    /// Build and start the batcher
    pub fn spawn(
        config: AnalyticsConfig,
    ) -> Result<(AnalyticsSink, AnalyticsHandle), reqwest::Error> {
        let (sink, queue) = Self::new(config)?;
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(queue.run(stop_rx));
        Ok((sink, AnalyticsHandle { stop, task }))
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// POST the buffered events; the batch is gone afterwards either way
    pub async fn flush(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }

        let batch = std::mem::take(&mut self.buffer);
        let sent = batch.len();
        let result = self
            .client
            .post(&self.config.endpoint)
            .json(&Batch { events: &batch })
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Sent {} analytics events", sent);
            }
            Ok(response) => {
                warn!("Analytics batch failed: {}", response.status());
            }
            Err(e) => {
                warn!("Failed to send analytics batch: {}", e);
            }
        }

        sent
    }

    fn push(&mut self, event: AnalyticsEvent) -> bool {
        self.buffer.push(event);
        self.buffer.len() >= self.config.batch_size.max(1)
    }

    /// Consume events until stopped or every sink is dropped
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!(
            "Analytics queue started: {} (batch: {}, interval: {:?})",
            self.config.endpoint, self.config.batch_size, self.config.flush_interval
        );

        let interval = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if self.push(event) {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = &mut stop => {
                    while let Ok(event) = self.rx.try_recv() {
                        if self.push(event) {
                            self.flush().await;
                        }
                    }
                    break;
                }
            }
        }

        self.flush().await;
        debug!("Analytics queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str) -> RequestInfo {
        RequestInfo {
            ip: "203.0.113.7".into(),
            user_agent: "curl/8.0".into(),
            method: "GET".into(),
            path: path.into(),
            request_size_bytes: 0,
            referer: None,
            accept_language: Some("en-US".into()),
        }
    }

    #[tokio::test]
    async fn test_pending_event_queued_on_drop() {
        let (sink, mut queue) =
            AnalyticsQueue::new(AnalyticsConfig::new("http://127.0.0.1:9/analytics/batch", "t-1"))
                .unwrap();

        let mut pending = sink.begin(info("/docs"));
        pending.set_status(200);
        pending.add_response_bytes(10);
        pending.add_response_bytes(5);
        drop(pending);

        let event = queue.rx.try_recv().unwrap();
        assert_eq!(event.tunnel_id, "t-1");
        assert_eq!(event.path, "/docs");
        assert_eq!(event.status_code, 200);
        assert_eq!(event.response_size_bytes, 15);
        assert!(event.timestamp.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_waiting() {
        let mut config = AnalyticsConfig::new("http://127.0.0.1:9/analytics/batch", "t-1");
        config.queue_capacity = 2;
        let (sink, mut queue) = AnalyticsQueue::new(config).unwrap();

        for _ in 0..5 {
            drop(sink.begin(info("/")));
        }

        assert!(queue.rx.try_recv().is_ok());
        assert!(queue.rx.try_recv().is_ok());
        assert!(queue.rx.try_recv().is_err());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = AnalyticsEvent {
            tunnel_id: "t".into(),
            ip: "unknown".into(),
            user_agent: "Unknown".into(),
            method: "POST".into(),
            path: "/api".into(),
            status_code: 502,
            response_time_ms: 3,
            request_size_bytes: 12,
            response_size_bytes: 0,
            referer: None,
            accept_language: None,
            timestamp: "2026-01-01T00:00:00.000Z".into(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("referer").is_none());
        assert!(json.get("accept_language").is_none());
        assert_eq!(json["status_code"], 502);
    }

    #[tokio::test]
    async fn test_failed_flush_drops_batch() {
        let (sink, mut queue) =
            AnalyticsQueue::new(AnalyticsConfig::new("http://127.0.0.1:9/analytics/batch", "t-1"))
                .unwrap();

        drop(sink.begin(info("/")));
        let event = queue.rx.try_recv().unwrap();
        queue.push(event);

        assert_eq!(queue.flush().await, 1);
        assert!(queue.buffer.is_empty());
        assert_eq!(queue.flush().await, 0);
    }
}
