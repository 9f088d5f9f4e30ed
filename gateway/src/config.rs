//! Configuration for the Peertun gateway and host.
//!
//! Supports peertun.yml with gateway/host sections, channel topology
//! selection, and timeout tuning. CLI flags override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signaling rendezvous URL
    #[serde(default = "default_signaling")]
    pub signaling: String,

    /// Local peer identity; generated when absent
    pub peer_id: Option<String>,

    /// Version tag written into tunneled request lines
    #[serde(default = "default_http_version")]
    pub http_version: String,

    /// Channel topology: one fresh channel per request, or one shared
    /// channel with strictly serialized exchanges
    #[serde(default)]
    pub channel_mode: ChannelMode,

    /// Seconds to wait for a session to reach Connected
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,

    /// Seconds without progress before an exchange fails (0 = no timeout)
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,

    /// STUN servers used for candidate gathering
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// Gateway-side settings
    pub gateway: Option<GatewayConfig>,

    /// Host-side settings
    pub host: Option<HostConfig>,
}

/// Settings for gateway mode (the request-intercepting side)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Local port the HTTP listener binds
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Identity of the remote host peer to tunnel to
    pub target_peer: String,
}

/// Settings for host mode (the service-serving side)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    /// Services reachable through the tunnel, selected by routing tag
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// One local backend service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Routing tag that selects this service
    pub name: String,

    /// Local port to forward traffic to
    pub local_port: u16,

    /// Local hostname to forward to (default: 127.0.0.1)
    #[serde(default = "default_local_host")]
    pub local_host: String,
}

/// Channel acquisition strategy (see the dispatcher)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelMode {
    /// Fresh uniquely-labeled channel per exchange; exchanges interleave freely
    #[default]
    PerRequest,
    /// One long-lived channel; exchanges are strictly serialized
    Shared,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling: default_signaling(),
            peer_id: None,
            http_version: default_http_version(),
            channel_mode: ChannelMode::default(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            exchange_timeout_secs: default_exchange_timeout(),
            stun_servers: default_stun_servers(),
            gateway: None,
            host: None,
        }
    }
}

fn default_signaling() -> String {
    "ws://localhost:9000/ws".to_string()
}

fn default_http_version() -> String {
    peertun_shared::protocol::HTTP_VERSION.to_string()
}

fn default_negotiation_timeout() -> u64 {
    30
}

fn default_exchange_timeout() -> u64 {
    60
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_listen_port() -> u16 {
    8080
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

impl ServiceConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(gateway) = &self.gateway {
            if gateway.target_peer.is_empty() {
                anyhow::bail!("gateway.target_peer cannot be empty");
            }
        }

        if let Some(host) = &self.host {
            for service in &host.services {
                if service.name.is_empty() {
                    anyhow::bail!("Service name cannot be empty");
                }
                if service.name.len() > peertun_shared::protocol::MAX_TAG_LEN {
                    anyhow::bail!("Service name '{}' exceeds 255 bytes", service.name);
                }
                if service.local_port == 0 {
                    anyhow::bail!("Invalid port 0 for service '{}'", service.name);
                }
            }
        }

        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Per-exchange progress timeout; `None` disables it.
    pub fn exchange_timeout(&self) -> Option<Duration> {
        match self.exchange_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = [
            "peertun.yml",
            "peertun.yaml",
            ".peertun.yml",
            ".peertun.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

/// Generate a fresh peer identity, e.g. `gateway-18c2a4f1c3a9`.
pub fn gen_peer_id(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{}-{:x}{:04x}", prefix, ts % 0xFFFF_FFFF, rand::random::<u16>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
signaling: wss://rendezvous.example.com/ws
channel_mode: shared
exchange_timeout_secs: 0
gateway:
  listen_port: 3000
  target_peer: host-1
host:
  services:
    - name: default
      local_port: 3001
    - name: files
      local_port: 3002
      local_host: 10.0.0.2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.channel_mode, ChannelMode::Shared);
        assert_eq!(config.exchange_timeout(), None);
        assert_eq!(config.gateway.as_ref().unwrap().target_peer, "host-1");
        let host = config.host.as_ref().unwrap();
        assert_eq!(host.services.len(), 2);
        assert_eq!(host.services[1].addr(), "10.0.0.2:3002");
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.signaling, "ws://localhost:9000/ws");
        assert_eq!(config.channel_mode, ChannelMode::PerRequest);
        assert_eq!(config.http_version, "HTTP/1.1");
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(30));
        assert_eq!(config.exchange_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_validate_rejects_bad_service() {
        let yaml = r#"
host:
  services:
    - name: api
      local_port: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_ids_are_unique_enough() {
        let a = gen_peer_id("gateway");
        let b = gen_peer_id("gateway");
        assert!(a.starts_with("gateway-"));
        assert_ne!(a, b);
    }
}
