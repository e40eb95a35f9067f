//! beacon-node: run one discovery instance on the LAN.
//!
//! Loads a TOML configuration (or the defaults), applies command-line and
//! environment overrides, binds a UDP socket, and logs every membership
//! event until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! beacon-node [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>        TOML config file [default: platform config dir]
//!       --port <PORT>          UDP port shared by all nodes
//!       --multicast <GROUP>    Use multicast on this group instead of broadcast
//!       --broadcast <ADDR>     Broadcast address [default: 255.255.255.255]
//!       --weight <WEIGHT>      Election weight [default: random in 0..1]
//!       --key <KEY>            Shared encryption passphrase
//!       --advertise <JSON>     Payload advertised with every hello
//!       --ineligible           Never become master
//!       --join <CHANNEL>       Join a channel and log its messages (repeatable)
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable           | Flag            |
//! |--------------------|-----------------|
//! | `BEACON_CONFIG`    | `--config`      |
//! | `BEACON_PORT`      | `--port`        |
//! | `BEACON_MULTICAST` | `--multicast`   |
//! | `BEACON_BROADCAST` | `--broadcast`   |
//! | `BEACON_WEIGHT`    | `--weight`      |
//! | `BEACON_KEY`       | `--key`         |
//!
//! `RUST_LOG` overrides the configured `log_level`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use beacon_node::infrastructure::storage::config::{config_file_path, load_config_or_default};
use beacon_node::{ChannelMessage, Discovery, DiscoveryConfig, DiscoveryEvent};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Beacon LAN discovery node.
#[derive(Debug, Parser)]
#[command(
    name = "beacon-node",
    about = "Discover peers on the local network and elect a master",
    version
)]
struct Cli {
    /// TOML configuration file.  Missing files fall back to defaults.
    #[arg(long, short = 'c', env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// UDP port shared by every node on the segment.
    #[arg(long, env = "BEACON_PORT")]
    port: Option<u16>,

    /// Multicast group to join instead of broadcasting.
    #[arg(long, env = "BEACON_MULTICAST", conflicts_with = "broadcast")]
    multicast: Option<String>,

    /// Broadcast address to send to.
    #[arg(long, env = "BEACON_BROADCAST")]
    broadcast: Option<String>,

    /// Election weight; the heaviest eligible node becomes master.
    #[arg(long, env = "BEACON_WEIGHT")]
    weight: Option<f64>,

    /// Shared passphrase enabling AES-256-GCM encryption.
    #[arg(long, env = "BEACON_KEY", hide_env_values = true)]
    key: Option<String>,

    /// JSON payload advertised in every hello.
    #[arg(long, value_name = "JSON")]
    advertise: Option<String>,

    /// Permanently give up master eligibility at startup.
    #[arg(long)]
    ineligible: bool,

    /// Channel to join; received messages are logged.  Repeatable.
    #[arg(long = "join", value_name = "CHANNEL")]
    channels: Vec<String>,
}

impl Cli {
    /// Loads the configuration file and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    fn load(&self) -> anyhow::Result<DiscoveryConfig> {
        let path = self.config.clone().or_else(|| config_file_path().ok());
        let mut config = load_config_or_default(path.as_deref()).with_context(|| {
            path.as_ref().map_or_else(
                || "loading default config".to_string(),
                |path| format!("loading config from {}", path.display()),
            )
        })?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(group) = &self.multicast {
            config.multicast = Some(group.clone());
            config.broadcast = None;
        }
        if let Some(addr) = &self.broadcast {
            config.broadcast = Some(addr.clone());
            config.multicast = None;
        }
        if let Some(weight) = self.weight {
            config.weight = Some(weight);
        }
        if let Some(key) = &self.key {
            config.key = Some(key.clone());
        }
        Ok(config)
    }

    /// Parses `--advertise`, if given.
    fn advertisement(&self) -> anyhow::Result<Option<Value>> {
        self.advertise
            .as_deref()
            .map(|raw| serde_json::from_str::<Value>(raw).context("--advertise must be valid JSON"))
            .transpose()
    }
}

// ── Event logging ─────────────────────────────────────────────────────────────

fn log_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::Promotion(me) => info!("promoted to master (weight {})", me.weight),
        DiscoveryEvent::Demotion(me) => {
            info!("demoted (eligible: {})", me.is_master_eligible)
        }
        DiscoveryEvent::Added(node) => info!(
            "added {} at {}:{} ({}, weight {})",
            node.id, node.address, node.port, node.host_name, node.weight
        ),
        DiscoveryEvent::Removed(node) => info!("removed {} ({})", node.id, node.host_name),
        DiscoveryEvent::Master(node) => {
            info!("master is {} at {} ({})", node.id, node.address, node.host_name)
        }
        DiscoveryEvent::DataError(e) => warn!("data error: {e}"),
        DiscoveryEvent::SocketError(e) => error!("socket error: {e}"),
    }
}

fn log_channel_message(message: ChannelMessage) {
    info!(
        "[{}] from {} ({}): {}",
        message.channel, message.sender, message.source, message.data
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load()?;
    let advertisement = cli.advertisement()?;

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .init();

    info!("beacon-node starting on UDP port {}", config.port);

    let discovery = Discovery::bind(config)
        .await
        .context("failed to create discovery instance")?;

    if cli.ineligible {
        discovery.demote(true).await;
    }
    if let Some(info) = advertisement {
        discovery.advertise(info).await;
    }
    for channel in &cli.channels {
        discovery
            .join(channel, log_channel_message)
            .await
            .with_context(|| format!("cannot join channel '{channel}'"))?;
    }

    // ── Event pump ────────────────────────────────────────────────────────────
    let mut events = discovery.subscribe();
    let pump = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("event log skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    discovery.start().context("failed to start discovery")?;
    info!("beacon-node {} ready.  Press Ctrl-C to exit.", discovery.instance_id());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");

    discovery.stop();
    for node in discovery.nodes().await {
        info!("last seen: {} ({}) master={}", node.id, node.host_name, node.is_master);
    }
    drop(discovery);
    pump.abort();

    info!("beacon-node stopped");
    Ok(())
}
