//! LocalRun Agent - Entry Point

use localrun_agent::{Agent, AgentConfig};
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!("LocalRun Agent v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: localrun-agent [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --provider <name>      Tunnel provider (ngrok, cloudflare, pinggy)");
    println!("  --port <port>          Local port to proxy");
    println!("  --tunnel-id <id>       Tunnel ID (default: <provider>-<port>)");
    println!("  --backend-url <url>    Metrics and analytics backend URL");
    println!("  --interval <secs>      Metrics interval in seconds (default: 10)");
    println!("  --ngrok-args <args>    Additional ngrok arguments (passed as one argument)");
    println!("  --help, -h             Show this help");
    println!();
    println!("Environment variables:");
    println!("  PROVIDER, TUNNEL_PORT, TUNNEL_ID, BACKEND_URL, METRICS_INTERVAL, NGROK_ARGS");
    println!("  TARGET_HOST              Host of the local service (default: localhost)");
    println!("  TUNNEL_PASSWORD          Enable the lock screen");
    println!("  CLOUDFLARE_TUNNEL_TOKEN  Run cloudflared as a named tunnel");
    println!("  PINGGY_TOKEN             Pinggy token for persistent URLs");
    println!("  NGROK_AUTHTOKEN          Read by ngrok itself");
    println!("  PROXY_PORT               Access gate port (default: 8080)");
    println!("  RUST_LOG                 Log level (default: info)");
    println!("  LOG_FORMAT=json          JSON logs");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    if std::env::args().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = AgentConfig::load().inspect_err(|e| error!("{}", e))?;

    Agent::new(config)
        .run()
        .await
        .inspect_err(|e| error!("Agent stopped: {}", e))?;

    Ok(())
}
