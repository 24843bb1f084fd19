//! ngrok public URL discovery
//!
//! ngrok prints nothing useful on stdout in non-interactive mode, so the
//! public URL is read from its local status API. Polling is bounded: after
//! `max_attempts` the agent gives up and keeps running without the URL.

use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// ngrok local status API
pub const NGROK_API_URL: &str = "http://localhost:4040/api/tunnels";

const API_TIMEOUT: Duration = Duration::from_secs(3);

/// Polling schedule for the status API
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub api_url: String,
    /// Wait before the first poll, while ngrok starts
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_url: NGROK_API_URL.to_string(),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

/// Shared slot for the discovered public URL
#[derive(Debug, Clone, Default)]
pub struct PublicUrl(Arc<RwLock<Option<String>>>);

impl PublicUrl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: String) {
        *self.0.write() = Some(url);
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Deserialize)]
struct TunnelEntry {
    public_url: String,
}

async fn poll_once(client: &Client, api_url: &str) -> Result<Option<String>, reqwest::Error> {
    let list: TunnelList = client.get(api_url).send().await?.json().await?;
    Ok(list.tunnels.into_iter().next().map(|t| t.public_url))
}

/// Poll the status API until it reports a tunnel or the attempt bound is hit
pub async fn discover_public_url(client: &Client, config: &DiscoveryConfig) -> Option<String> {
    tokio::time::sleep(config.settle_delay).await;

    for attempt in 1..=config.max_attempts {
        match poll_once(client, &config.api_url).await {
            Ok(Some(url)) => return Some(url),
            Ok(None) => debug!("ngrok API reports no tunnels yet (attempt {})", attempt),
            Err(e) => debug!("ngrok API not ready (attempt {}): {}", attempt, e),
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    None
}

/// HTTP client for the status API, with a short per-request timeout
pub fn discovery_client() -> Result<Client, reqwest::Error> {
    Client::builder().timeout(API_TIMEOUT).build()
}

/// Run discovery in the background, publishing the URL when found
pub fn spawn_discovery(
    client: Client,
    config: DiscoveryConfig,
    public_url: PublicUrl,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match discover_public_url(&client, &config).await {
            Some(url) => {
                info!("Ngrok Public URL: {}", url);
                public_url.set(url);
            }
            None => warn!("Could not retrieve ngrok URL from local API"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_url_slot() {
        let slot = PublicUrl::new();
        assert_eq!(slot.get(), None);

        let shared = slot.clone();
        shared.set("https://abc.ngrok.app".into());
        assert_eq!(slot.get().as_deref(), Some("https://abc.ngrok.app"));
    }

    #[test]
    fn test_tunnel_list_parsing() {
        let list: TunnelList = serde_json::from_str(
            r#"{"tunnels":[{"public_url":"https://a.ngrok.app","proto":"https"}],"uri":"/api/tunnels"}"#,
        )
        .unwrap();
        assert_eq!(list.tunnels[0].public_url, "https://a.ngrok.app");

        let empty: TunnelList = serde_json::from_str("{}").unwrap();
        assert!(empty.tunnels.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_api_gives_up() {
        let config = DiscoveryConfig {
            // reserved port, nothing listens there
            api_url: "http://127.0.0.1:9/api/tunnels".into(),
            settle_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            max_attempts: 3,
        };

        assert_eq!(discover_public_url(&Client::new(), &config).await, None);
    }
}
