//! Configuration management
//!
//! Flags take precedence over environment variables, which take precedence
//! over defaults. Everything is validated once, before any component starts.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Port the access gate listens on (tunnel traffic enters here)
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Metrics reporting interval in seconds
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

/// Default upstream host
pub const DEFAULT_TARGET_HOST: &str = "localhost";

/// Configuration errors (all fatal at startup)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("provider and port are required")]
    MissingRequired,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid metrics interval: {0}")]
    InvalidInterval(String),

    #[error("Missing value for {0}")]
    MissingFlagValue(String),

    #[error("Unknown flag: {0}")]
    UnknownFlag(String),
}

/// Supported tunnel providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Ngrok,
    Cloudflare,
    Pinggy,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ngrok => "ngrok",
            Self::Cloudflare => "cloudflare",
            Self::Pinggy => "pinggy",
        }
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ngrok" => Ok(Self::Ngrok),
            "cloudflare" | "cloudflared" => Ok(Self::Cloudflare),
            "pinggy" => Ok(Self::Pinggy),
            _ => Err(ConfigError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unvalidated configuration values, as collected from flags and environment
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub provider: Option<String>,
    pub port: Option<String>,
    pub tunnel_id: Option<String>,
    pub backend_url: Option<String>,
    pub interval: Option<String>,
    pub ngrok_args: Option<String>,
    pub target_host: Option<String>,
    pub password: Option<String>,
    pub cloudflare_token: Option<String>,
    pub pinggy_token: Option<String>,
    pub proxy_port: Option<String>,
}

impl RawConfig {
    /// Collect values from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Collect values through an arbitrary lookup (environment stand-in)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            provider: get("PROVIDER"),
            port: get("TUNNEL_PORT"),
            tunnel_id: get("TUNNEL_ID"),
            backend_url: get("BACKEND_URL"),
            interval: get("METRICS_INTERVAL"),
            ngrok_args: get("NGROK_ARGS"),
            target_host: get("TARGET_HOST"),
            password: get("TUNNEL_PASSWORD"),
            cloudflare_token: get("CLOUDFLARE_TUNNEL_TOKEN"),
            pinggy_token: get("PINGGY_TOKEN"),
            proxy_port: get("PROXY_PORT"),
        }
    }

    /// Override values with command-line flags (`--flag value` or `--flag=value`)
    pub fn apply_args<I, S>(mut self, args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };

            let slot = match flag.as_str() {
                "--provider" => &mut self.provider,
                "--port" => &mut self.port,
                "--tunnel-id" => &mut self.tunnel_id,
                "--backend-url" => &mut self.backend_url,
                "--interval" => &mut self.interval,
                "--ngrok-args" => &mut self.ngrok_args,
                _ => return Err(ConfigError::UnknownFlag(arg)),
            };

            let value = match inline {
                Some(value) => value,
                None => args
                    .next()
                    .ok_or_else(|| ConfigError::MissingFlagValue(flag.clone()))?,
            };

            *slot = Some(value).filter(|v| !v.trim().is_empty());
        }

        Ok(self)
    }
}

/// Validated, immutable agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tunnel provider
    pub provider: Provider,

    /// Port of the local service being exposed
    pub port: u16,

    /// Tunnel identifier reported to the backend
    pub tunnel_id: String,

    /// Metrics backend base URL (reporter disabled when unset)
    pub backend_url: Option<String>,

    /// Interval between metrics reports
    pub metrics_interval: Duration,

    /// Extra ngrok arguments, passed through as a single argument
    pub ngrok_args: Option<String>,

    /// Host of the local service
    pub target_host: String,

    /// Lock screen password (gate inert when unset)
    pub password: Option<String>,

    /// Cloudflare named tunnel token (quick tunnel when unset)
    pub cloudflare_token: Option<String>,

    /// Pinggy token for persistent URLs
    pub pinggy_token: Option<String>,

    /// Port the access gate listens on
    pub proxy_port: u16,
}

impl AgentConfig {
    /// Load configuration from environment variables and the process arguments
    pub fn load() -> Result<Self, ConfigError> {
        RawConfig::from_env()
            .apply_args(std::env::args().skip(1))?
            .try_into()
    }

    /// Upstream URL requests are forwarded to
    pub fn target_url(&self) -> String {
        format!("http://{}:{}", self.target_host, self.port)
    }

    /// URL the tunnel subprocess points at (the gate, never the raw target)
    pub fn local_proxy_url(&self) -> String {
        format!("http://localhost:{}", self.proxy_port)
    }

    /// Metrics ingest endpoint, if a backend is configured
    pub fn ingest_url(&self) -> Option<String> {
        self.backend_url
            .as_deref()
            .map(|base| format!("{}/api/metrics/ingest", base.trim_end_matches('/')))
    }

    /// Per-request analytics endpoint, if a backend is configured
    pub fn analytics_url(&self) -> Option<String> {
        self.backend_url
            .as_deref()
            .map(|base| format!("{}/analytics/batch", base.trim_end_matches('/')))
    }
}

impl TryFrom<RawConfig> for AgentConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let (provider, port) = match (raw.provider, raw.port) {
            (Some(provider), Some(port)) => (provider, port),
            _ => return Err(ConfigError::MissingRequired),
        };

        let provider: Provider = provider.parse()?;
        let port = parse_port(&port)?;

        let tunnel_id = raw
            .tunnel_id
            .unwrap_or_else(|| format!("{}-{}", provider, port));

        let metrics_interval = match raw.interval {
            Some(v) => match v.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidInterval(v)),
            },
            None => Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
        };

        let proxy_port = match raw.proxy_port {
            Some(v) => parse_port(&v)?,
            None => DEFAULT_PROXY_PORT,
        };

        Ok(Self {
            provider,
            port,
            tunnel_id,
            backend_url: raw.backend_url,
            metrics_interval,
            ngrok_args: raw.ngrok_args,
            target_host: raw
                .target_host
                .unwrap_or_else(|| DEFAULT_TARGET_HOST.to_string()),
            password: raw.password,
            cloudflare_token: raw.cloudflare_token,
            pinggy_token: raw.pinggy_token,
            proxy_port,
        })
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}
