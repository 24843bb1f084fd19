//! Tunnel subprocess supervision
//!
//! The supervisor owns the provider subprocess for the life of the agent.
//! Launch failures are fatal: an agent without a tunnel has nothing to do.

use super::command::CommandSpec;
use super::discovery::{discovery_client, spawn_discovery, DiscoveryConfig, PublicUrl};
use crate::config::{AgentConfig, Provider};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{provider} tunnel exited unexpectedly (exit code: {code:?})")]
    Exited {
        provider: Provider,
        code: Option<i32>,
    },

    #[error("Failed to build ngrok API client: {0}")]
    DiscoveryClient(#[source] reqwest::Error),

    #[error("Failed to wait on {provider} tunnel: {source}")]
    Wait {
        provider: Provider,
        #[source]
        source: io::Error,
    },
}

/// A running subprocess, as seen by the supervisor
#[async_trait]
pub trait TunnelChild: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit, returning the exit code if there is one
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
impl TunnelChild for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Child::wait(self).await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        Child::kill(self).await
    }
}

/// Starts subprocesses from command specs
pub trait TunnelLauncher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> Result<Box<dyn TunnelChild>, TunnelError>;
}

/// Launches real processes, with stdout/stderr inherited from the agent
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl TunnelLauncher for ProcessLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<Box<dyn TunnelChild>, TunnelError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        Ok(Box::new(child))
    }
}

/// The running provider subprocess
pub struct TunnelProcess {
    provider: Provider,
    started_at: Instant,
    child: Box<dyn TunnelChild>,
    discovery: Option<JoinHandle<()>>,
}

impl TunnelProcess {
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.pid()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Resolve when the subprocess exits on its own
    pub async fn wait(&mut self) -> TunnelError {
        match self.child.wait().await {
            Ok(code) => TunnelError::Exited {
                provider: self.provider,
                code,
            },
            Err(source) => TunnelError::Wait {
                provider: self.provider,
                source,
            },
        }
    }

    /// Kill the subprocess and stop URL discovery
    pub async fn kill(mut self) -> io::Result<()> {
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }

        let result = self.child.kill().await;
        match &result {
            Ok(()) => info!(
                "{} tunnel stopped after {:.0}s",
                self.provider,
                self.uptime().as_secs_f64()
            ),
            Err(e) => warn!("Failed to kill {} tunnel: {}", self.provider, e),
        }
        result
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
    }
}

/// Builds and launches the provider subprocess
pub struct TunnelSupervisor<L = ProcessLauncher> {
    launcher: L,
    discovery: DiscoveryConfig,
}

impl TunnelSupervisor<ProcessLauncher> {
    pub fn new() -> Self {
        Self::with_launcher(ProcessLauncher)
    }
}

impl Default for TunnelSupervisor<ProcessLauncher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: TunnelLauncher> TunnelSupervisor<L> {
    pub fn with_launcher(launcher: L) -> Self {
        Self {
            launcher,
            discovery: DiscoveryConfig::default(),
        }
    }

    /// Override the ngrok status API polling schedule
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Launch the tunnel; for ngrok, also start public URL discovery
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        config: &AgentConfig,
        public_url: PublicUrl,
    ) -> Result<TunnelProcess, TunnelError> {
        let spec = CommandSpec::for_config(config);
        debug!("Launching: {}", spec.redacted());

        let api_client = match config.provider {
            Provider::Ngrok => Some(discovery_client().map_err(TunnelError::DiscoveryClient)?),
            _ => None,
        };

        let child = self.launcher.launch(&spec)?;

        match child.pid() {
            Some(pid) => info!("{} tunnel started (PID: {})", config.provider, pid),
            None => info!("{} tunnel started", config.provider),
        }

        let discovery = api_client
            .map(|client| spawn_discovery(client, self.discovery.clone(), public_url));

        Ok(TunnelProcess {
            provider: config.provider,
            started_at: Instant::now(),
            child,
            discovery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    /// Records every spec; children never exit unless told to
    #[derive(Default, Clone)]
    struct FakeLauncher {
        launched: Arc<Mutex<Vec<CommandSpec>>>,
        exit: Arc<Mutex<Option<oneshot::Receiver<i32>>>>,
        fail: bool,
    }

    struct FakeChild {
        exit: Option<oneshot::Receiver<i32>>,
        killed: bool,
    }

    #[async_trait]
    impl TunnelChild for FakeChild {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        async fn wait(&mut self) -> io::Result<Option<i32>> {
            match self.exit.take() {
                Some(rx) => Ok(rx.await.ok()),
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> io::Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    impl TunnelLauncher for FakeLauncher {
        fn launch(&self, spec: &CommandSpec) -> Result<Box<dyn TunnelChild>, TunnelError> {
            if self.fail {
                return Err(TunnelError::Spawn {
                    program: spec.program.clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "not installed"),
                });
            }
            self.launched.lock().unwrap().push(spec.clone());
            Ok(Box::new(FakeChild {
                exit: self.exit.lock().unwrap().take(),
                killed: false,
            }))
        }
    }

    fn config(provider: &str) -> AgentConfig {
        RawConfig {
            provider: Some(provider.into()),
            port: Some("3000".into()),
            ..Default::default()
        }
        .try_into()
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_records_spec() {
        let supervisor = TunnelSupervisor::with_launcher(FakeLauncher::default());
        let process = supervisor.start(&config("pinggy"), PublicUrl::new()).unwrap();

        assert_eq!(process.provider(), Provider::Pinggy);
        assert_eq!(process.pid(), Some(4242));

        let launched = supervisor.launcher().launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].program, "ssh");

        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_failure_is_error() {
        let supervisor = TunnelSupervisor::with_launcher(FakeLauncher {
            fail: true,
            ..Default::default()
        });

        let err = supervisor
            .start(&config("cloudflare"), PublicUrl::new())
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Spawn { ref program, .. } if program == "cloudflared"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let (tx, rx) = oneshot::channel();
        let launcher = FakeLauncher {
            exit: Arc::new(Mutex::new(Some(rx))),
            ..Default::default()
        };
        let supervisor = TunnelSupervisor::with_launcher(launcher);
        let mut process = supervisor.start(&config("cloudflare"), PublicUrl::new()).unwrap();

        tx.send(1).unwrap();
        let err = process.wait().await;
        assert!(matches!(
            err,
            TunnelError::Exited { provider: Provider::Cloudflare, code: Some(1) }
        ));
    }

    #[tokio::test]
    async fn test_ngrok_discovery_aborted_on_kill() {
        let supervisor = TunnelSupervisor::with_launcher(FakeLauncher::default()).with_discovery(
            DiscoveryConfig {
                api_url: "http://127.0.0.1:9/api/tunnels".into(),
                settle_delay: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let process = supervisor.start(&config("ngrok"), PublicUrl::new()).unwrap();
        assert!(process.discovery.is_some());
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_process_stops_discovery() {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/api/tunnels",
            get(|| async {
                Json(serde_json::json!({"tunnels": [{"public_url": "https://late.ngrok.app"}]}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (tx, rx) = oneshot::channel();
        let launcher = FakeLauncher {
            exit: Arc::new(Mutex::new(Some(rx))),
            ..Default::default()
        };
        let supervisor = TunnelSupervisor::with_launcher(launcher).with_discovery(DiscoveryConfig {
            api_url: format!("http://{}/api/tunnels", addr),
            settle_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            max_attempts: 3,
        });

        let public_url = PublicUrl::new();
        let mut process = supervisor.start(&config("ngrok"), public_url.clone()).unwrap();

        // Tunnel exits on its own; the process is dropped without kill()
        tx.send(1).unwrap();
        let err = process.wait().await;
        assert!(matches!(err, TunnelError::Exited { code: Some(1), .. }));
        drop(process);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(public_url.get(), None);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_fast() {
        let spec = CommandSpec {
            program: "localrun-definitely-not-installed".into(),
            args: vec![],
        };
        let err = ProcessLauncher.launch(&spec).err().unwrap();
        assert!(err.to_string().starts_with("Failed to start localrun-definitely-not-installed"));
    }
}
