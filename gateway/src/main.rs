use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

mod channel;
mod config;
mod dispatch;
mod host;
mod server;
mod session;
mod signaling;

use config::{ChannelMode, Config, GatewayConfig, HostConfig, ServiceConfig};

#[derive(Parser)]
#[command(name = "peertun")]
#[command(author = "Peertun Team")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer HTTP tunnel over WebRTC data channels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (peertun.yml is searched for when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling rendezvous URL
    #[arg(short, long)]
    signaling: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local gateway and relay requests to a peer
    Gateway {
        /// Peer to tunnel to
        target: Option<String>,

        /// Local port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Serialize all requests over one shared channel
        #[arg(long)]
        shared_channel: bool,
    },
    /// Answer offers and serve local services through the tunnel
    Host {
        /// Peer id to register under
        #[arg(short, long)]
        id: Option<String>,

        /// Service to expose as NAME:PORT (repeatable)
        #[arg(short = 'e', long = "expose", value_name = "NAME:PORT")]
        services: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => match Config::find_config() {
            Some(path) => {
                info!("Using configuration {}", path.display());
                Config::load(&path).context("Failed to load configuration")?
            }
            None => Config::default(),
        },
    };
    if let Some(url) = cli.signaling {
        cfg.signaling = url;
    }

    match cli.command {
        Commands::Gateway { target, port, shared_channel } => {
            if shared_channel {
                cfg.channel_mode = ChannelMode::Shared;
            }
            let target_peer = target
                .or_else(|| cfg.gateway.as_ref().map(|g| g.target_peer.clone()))
                .context("No target peer; pass one or set gateway.target_peer in the config")?;
            let listen_port = port
                .or_else(|| cfg.gateway.as_ref().map(|g| g.listen_port))
                .unwrap_or(8080);
            cfg.gateway = Some(GatewayConfig { listen_port, target_peer });
            cfg.validate()?;

            server::run(Arc::new(cfg)).await?;
        }
        Commands::Host { id, services } => {
            if let Some(id) = id {
                cfg.peer_id = Some(id);
            }
            if !services.is_empty() {
                let services = services
                    .iter()
                    .map(|spec| parse_service(spec))
                    .collect::<Result<Vec<_>>>()?;
                cfg.host = Some(HostConfig { services });
            }
            if cfg.host.is_none() {
                anyhow::bail!("No services; pass --expose or set host.services in the config");
            }
            cfg.validate()?;

            host::run(Arc::new(cfg)).await?;
        }
    }

    Ok(())
}

fn parse_service(spec: &str) -> Result<ServiceConfig> {
    let (name, port) = spec
        .split_once(':')
        .with_context(|| format!("Service '{}' must be NAME:PORT", spec))?;
    Ok(ServiceConfig {
        name: name.to_string(),
        local_port: port
            .parse()
            .with_context(|| format!("Invalid port in service '{}'", spec))?,
        local_host: "127.0.0.1".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_specs() {
        let svc = parse_service("files:3000").unwrap();
        assert_eq!(svc.name, "files");
        assert_eq!(svc.local_port, 3000);
        assert_eq!(svc.local_host, "127.0.0.1");

        assert!(parse_service("files").is_err());
        assert!(parse_service("files:nope").is_err());
    }
}
