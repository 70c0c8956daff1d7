//! Collector configuration: a YAML file selected on the command line.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

fn default_queue_size() -> usize {
    2048
}

fn default_listen() -> String {
    "0.0.0.0:2055".to_string()
}

fn default_session_dump_interval() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Parser)]
#[command(
    name = "netflow-collector",
    about = "UDP flow-telemetry collector for NetFlow v5/v9, IPFIX and sFlow v5"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Echo per-packet diagnostics to standard output
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowProtocol {
    NetflowV5,
    /// IPFIX and NetFlow v9 share one listener; the handler dispatches on
    /// the version field.
    Ipfix,
    SflowV5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub protocol: FlowProtocol,

    #[serde(default = "default_listen")]
    pub listen: String,

    /// Opaque exporter classifier stamped on every record from this
    /// listener.
    pub tag: String,

    /// Use the wall-clock receive time instead of the protocol-declared
    /// export time.
    #[serde(default)]
    pub ignore_timestamps: bool,

    /// Reserved; kept for interface compatibility.
    #[serde(default)]
    pub local_tz: bool,

    /// Periodically log the live session keys (IPFIX/v9 only).
    #[serde(default)]
    pub session_dump: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Capacity of the shared output channel; the only internal queue.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_session_dump_interval", with = "humantime_serde")]
    pub session_dump_interval: Duration,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            session_dump_interval: default_session_dump_interval(),
            listeners: Vec::new(),
        }
    }
}

impl CollectorConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let cfg = match &cli.config {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let cfg = serde_yaml::from_str::<Self>(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            bail!("queue_size must be greater than 0");
        }
        if self.listeners.is_empty() {
            bail!("at least one listener must be configured");
        }
        for listener in &self.listeners {
            if listener.tag.is_empty() {
                bail!("listener on {} has an empty tag", listener.listen);
            }
            listener
                .listen
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid listener address: {}", listener.listen))?;
        }
        Ok(())
    }
}
