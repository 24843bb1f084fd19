//! Agent orchestration
//!
//! Startup order: bind the listener, start the analytics queue, launch the
//! tunnel, start the reporter, serve. Any startup failure is fatal. Afterwards the agent runs until a
//! termination signal, the tunnel exiting, or the listener failing.

use crate::analytics::{AnalyticsConfig, AnalyticsQueue, AnalyticsSink};
use crate::config::{AgentConfig, ConfigError};
use crate::counters::Counters;
use crate::gate::AccessGate;
use crate::proxy::ReverseProxy;
use crate::reporter::{MetricsReporter, ReportError};
use crate::server;
use crate::tunnel::{ProcessLauncher, PublicUrl, TunnelError, TunnelLauncher, TunnelSupervisor};
use axum::Router;
use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

/// Fatal agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Failed to bind proxy listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Proxy server failed: {0}")]
    Serve(#[source] io::Error),
}

enum Outcome {
    Shutdown,
    TunnelExited(TunnelError),
    ServerStopped(io::Result<()>),
}

/// The tunnel agent: supervisor, gate + proxy, and reporter
pub struct Agent<L = ProcessLauncher> {
    config: AgentConfig,
    supervisor: TunnelSupervisor<L>,
    counters: Arc<Counters>,
    public_url: PublicUrl,
}

impl Agent<ProcessLauncher> {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_supervisor(config, TunnelSupervisor::new())
    }
}

impl<L: TunnelLauncher> Agent<L> {
    pub fn with_supervisor(config: AgentConfig, supervisor: TunnelSupervisor<L>) -> Self {
        Self {
            config,
            supervisor,
            counters: Arc::new(Counters::new()),
            public_url: PublicUrl::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn public_url(&self) -> PublicUrl {
        self.public_url.clone()
    }

    /// Gate → proxy router for this configuration
    pub fn router(&self, analytics: Option<AnalyticsSink>) -> Result<Router, AgentError> {
        let mut proxy = ReverseProxy::new(self.config.target_url(), self.counters.clone())?;
        if let Some(sink) = analytics {
            proxy = proxy.with_analytics(sink);
        }
        let gate = Arc::new(AccessGate::new(self.config.password.clone()));
        Ok(server::build_router(gate, Arc::new(proxy)))
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(self) -> Result<(), AgentError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;

        info!("Starting LocalRun Agent v{}", env!("CARGO_PKG_VERSION"));
        info!("Provider: {}", config.provider);
        info!("Port: {}", config.port);
        info!("Tunnel ID: {}", config.tunnel_id);
        if config.password.is_some() {
            info!("Password protection enabled");
        }

        let listener = server::bind(config.proxy_port)
            .await
            .map_err(|source| AgentError::Bind {
                port: config.proxy_port,
                source,
            })?;

        let (analytics, analytics_handle) = match AnalyticsConfig::from_agent(config) {
            Some(analytics_config) => {
                let (sink, handle) = AnalyticsQueue::spawn(analytics_config)?;
                (Some(sink), Some(handle))
            }
            None => (None, None),
        };
        let router = self.router(analytics)?;

        let mut process = self.supervisor.start(config, self.public_url.clone())?;

        let reporter =
            MetricsReporter::spawn(config, self.counters.clone(), self.public_url.clone())?;

        info!(
            "Proxy listening on :{} -> {}",
            config.proxy_port,
            config.target_url()
        );
        let mut server_task = tokio::spawn(server::serve(listener, router));

        let outcome = tokio::select! {
            _ = shutdown => Outcome::Shutdown,
            err = process.wait() => Outcome::TunnelExited(err),
            res = &mut server_task => Outcome::ServerStopped(
                res.unwrap_or_else(|e| Err(io::Error::other(e))),
            ),
        };

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        server_task.abort();
        if let Some(analytics) = analytics_handle {
            analytics.shutdown().await;
        }

        match outcome {
            Outcome::Shutdown => {
                info!("Shutting down...");
                if let Err(e) = process.kill().await {
                    warn!("Tunnel may still be running: {}", e);
                }
                Ok(())
            }
            Outcome::TunnelExited(err) => {
                error!("{}", err);
                Err(err.into())
            }
            Outcome::ServerStopped(res) => {
                if let Err(e) = process.kill().await {
                    warn!("Tunnel may still be running: {}", e);
                }
                let err = res.err().unwrap_or_else(|| io::Error::other("listener closed"));
                error!("Proxy server stopped: {}", err);
                Err(AgentError::Serve(err))
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
