//! Tunnel Supervisor
//!
//! Launches exactly one provider subprocess (ngrok, cloudflared or ssh for
//! pinggy) that exposes the local access gate to the internet.
//!
//! ```text
//! AgentConfig ──► CommandSpec ──► TunnelLauncher ──► TunnelProcess
//!                 (per provider)   (real or fake)       │
//!                                                       └── ngrok only:
//!                                                           status API polling
//!                                                           ──► PublicUrl
//! ```

pub mod command;
pub mod discovery;
pub mod supervisor;

pub use command::CommandSpec;
pub use discovery::{
    discover_public_url, discovery_client, spawn_discovery, DiscoveryConfig, PublicUrl,
    NGROK_API_URL,
};
pub use supervisor::{
    ProcessLauncher, TunnelChild, TunnelError, TunnelLauncher, TunnelProcess, TunnelSupervisor,
};
