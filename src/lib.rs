//! LocalRun Agent
//!
//! Exposes a local service through a third-party tunnel provider while
//! adding password-gated access and usage telemetry.
//!
//! # Features
//!
//! - **Tunnel supervision**: ngrok, cloudflared (quick or named) and pinggy over SSH
//! - **Access gate**: optional password lock screen with a stateless auth cookie
//! - **Reverse proxy**: forwards to the local target, counting requests and bytes
//! - **Metrics**: periodic JSON reports with traffic and host stats
//! - **Analytics**: one batched event per proxied request
//!
//! # Architecture
//!
//! ```text
//! Internet ──► Provider ──► :8080 Access Gate ──► Reverse Proxy ──► target service
//!              (subprocess)                            │
//!                                                      ├──► Counters ──► Metrics Reporter ──► backend
//!                                                      └──► Analytics Queue ──────────────► backend
//! ```

pub mod agent;
pub mod analytics;
pub mod config;
pub mod counters;
pub mod gate;
pub mod lockscreen;
pub mod proxy;
pub mod reporter;
pub mod server;
pub mod system;
pub mod tunnel;

pub use agent::{shutdown_signal, Agent, AgentError};
pub use analytics::{
    AnalyticsConfig, AnalyticsEvent, AnalyticsHandle, AnalyticsQueue, AnalyticsSink, PendingEvent,
    RequestInfo,
};
pub use config::{AgentConfig, ConfigError, Provider, RawConfig};
pub use counters::{CounterSnapshot, Counters};
pub use gate::{access_gate, hash_password, AccessGate, COOKIE_NAME, LOGIN_PATH};
pub use proxy::{counted_body, ReverseProxy};
pub use reporter::{MetricsReport, MetricsReporter, ReportError, ReportIdentity};
pub use system::{SystemSampler, SystemStats};
pub use tunnel::{
    CommandSpec, DiscoveryConfig, ProcessLauncher, PublicUrl, TunnelChild, TunnelError,
    TunnelLauncher, TunnelProcess, TunnelSupervisor,
};
