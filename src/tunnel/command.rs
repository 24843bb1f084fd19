//! Provider command construction
//!
//! Each provider maps to a program plus argument list. Every command points
//! the provider at the local access gate, never at the target service.

use crate::config::{AgentConfig, Provider};

const PINGGY_HOST: &str = "a.pinggy.io";

/// A subprocess to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the provider command for this configuration
    pub fn for_config(config: &AgentConfig) -> Self {
        match config.provider {
            Provider::Ngrok => ngrok(&config.local_proxy_url(), config.ngrok_args.as_deref()),
            Provider::Cloudflare => cloudflared(
                &config.local_proxy_url(),
                config.cloudflare_token.as_deref(),
            ),
            Provider::Pinggy => pinggy(config.proxy_port, config.pinggy_token.as_deref()),
        }
    }

    /// Command line for logs, with secret values masked
    pub fn redacted(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                parts.push("***".to_string());
                mask_next = false;
            } else {
                mask_next = arg == "--token";
                parts.push(match arg.split_once('@') {
                    Some((_, host)) if host == PINGGY_HOST => format!("***@{}", host),
                    _ => arg.clone(),
                });
            }
        }
        parts.join(" ")
    }
}

/// `ngrok http <url> [extra]`
///
/// `extra` is appended as ONE argument, not split on whitespace, so
/// `"--domain foo.app"` reaches ngrok as a single argv entry.
pub fn ngrok(local_url: &str, extra: Option<&str>) -> CommandSpec {
    let mut args = vec!["http".to_string(), local_url.to_string()];
    if let Some(extra) = extra.filter(|e| !e.is_empty()) {
        args.push(extra.to_string());
    }
    CommandSpec::new("ngrok", args)
}

/// Named tunnel with a token, quick tunnel otherwise
pub fn cloudflared(local_url: &str, token: Option<&str>) -> CommandSpec {
    match token.filter(|t| !t.is_empty()) {
        Some(token) => CommandSpec::new("cloudflared", ["tunnel", "run", "--token", token]),
        None => CommandSpec::new("cloudflared", ["tunnel", "--url", local_url]),
    }
}

/// SSH reverse tunnel to pinggy
pub fn pinggy(proxy_port: u16, token: Option<&str>) -> CommandSpec {
    let target = match token.filter(|t| !t.is_empty()) {
        Some(token) => format!("{}@{}", token, PINGGY_HOST),
        None => PINGGY_HOST.to_string(),
    };

    CommandSpec::new(
        "ssh",
        [
            "-p".to_string(),
            "443".to_string(),
            // quiet, no pty (suppresses banner and QR codes)
            "-q".to_string(),
            "-T".to_string(),
            format!("-R0:localhost:{}", proxy_port),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            target,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;

    fn config(provider: &str, extra: &[(&str, &str)]) -> AgentConfig {
        let mut pairs = vec![("PROVIDER", provider), ("TUNNEL_PORT", "3000")];
        pairs.extend_from_slice(extra);
        RawConfig::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .try_into()
        .unwrap()
    }

    #[test]
    fn test_ngrok_command() {
        let spec = CommandSpec::for_config(&config("ngrok", &[]));
        assert_eq!(spec.program, "ngrok");
        assert_eq!(spec.args, vec!["http", "http://localhost:8080"]);
    }

    #[test]
    fn test_ngrok_extra_args_single_argument() {
        let spec = CommandSpec::for_config(&config("ngrok", &[("NGROK_ARGS", "--domain my.ngrok.app")]));
        assert_eq!(
            spec.args,
            vec!["http", "http://localhost:8080", "--domain my.ngrok.app"]
        );
    }

    #[test]
    fn test_cloudflare_quick_tunnel() {
        for name in ["cloudflare", "cloudflared"] {
            let spec = CommandSpec::for_config(&config(name, &[]));
            assert_eq!(spec.program, "cloudflared");
            assert_eq!(spec.args, vec!["tunnel", "--url", "http://localhost:8080"]);
        }
    }

    #[test]
    fn test_cloudflare_named_tunnel() {
        let spec = CommandSpec::for_config(&config(
            "cloudflared",
            &[("CLOUDFLARE_TUNNEL_TOKEN", "eyJhIjoi")],
        ));
        assert_eq!(spec.args, vec!["tunnel", "run", "--token", "eyJhIjoi"]);
        assert_eq!(spec.redacted(), "cloudflared tunnel run --token ***");
    }

    #[test]
    fn test_pinggy_without_token() {
        let spec = CommandSpec::for_config(&config("pinggy", &[("PINGGY_TOKEN", "")]));
        assert_eq!(spec.program, "ssh");
        assert!(spec.args.contains(&"-R0:localhost:8080".to_string()));
        assert!(spec.args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(spec.args.contains(&"ServerAliveInterval=30".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("a.pinggy.io"));
    }

    #[test]
    fn test_pinggy_with_token() {
        let spec = CommandSpec::for_config(&config("pinggy", &[("PINGGY_TOKEN", "abc")]));
        assert_eq!(spec.args.last().map(String::as_str), Some("abc@a.pinggy.io"));
        assert!(spec.redacted().ends_with("***@a.pinggy.io"));
    }

    #[test]
    fn test_commands_never_target_service_port() {
        for name in ["ngrok", "cloudflare", "cloudflared", "pinggy"] {
            let spec = CommandSpec::for_config(&config(name, &[]));
            let joined = spec.args.join(" ");
            assert!(joined.contains("8080"), "{} should target the proxy", name);
            assert!(!joined.contains("3000"), "{} must not target the service", name);
        }
    }

    #[test]
    fn test_custom_proxy_port() {
        let spec = CommandSpec::for_config(&config("pinggy", &[("PROXY_PORT", "9090")]));
        assert!(spec.args.contains(&"-R0:localhost:9090".to_string()));
    }
}
