//! Configuration module for tcptrail.
//!
//! Command-line flags (with environment fallbacks) form the base probe
//! configuration; an optional YAML file adds targets with their own interval
//! and labels.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, File, FileFormat};
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::output::OutputFormat;
use crate::probe::ProbeConfig;
use crate::stats::FieldFilter;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    File(#[from] ::config::ConfigError),
    #[error("invalid source address {0:?}")]
    SrcAddr(String),
    #[error("no targets: pass addresses, --config or --k8s")]
    NoTargets,
}

/// Command-line flags.
#[derive(Parser, Debug, Clone)]
#[command(name = "tcptrail", about = "TCP/HTTP connection probe with kernel socket stats", version)]
pub struct Cli {
    /// Targets to probe: URLs or host[:port].
    pub targets: Vec<String>,

    /// Number of rounds per target; 0 probes until stopped.
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub count: i64,

    /// Time between rounds.
    #[arg(short, long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Budget for one round.
    #[arg(short, long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Skip TLS certificate verification.
    #[arg(long)]
    pub insecure: bool,

    /// TLS server name override.
    #[arg(long)]
    pub server_name: Option<String>,

    /// Local IP address to dial from.
    #[arg(long, default_value = "")]
    pub src_addr: String,

    /// Comma separated field names to print.
    #[arg(long, default_value = "")]
    pub filter: String,

    /// Print one JSON object per round.
    #[arg(long)]
    pub json: bool,

    /// Print indented JSON.
    #[arg(long, conflicts_with = "json")]
    pub json_pretty: bool,

    /// Do not print rounds.
    #[arg(short, long)]
    pub quiet: bool,

    /// List exported metrics and exit.
    #[arg(long)]
    pub metrics: bool,

    /// Metrics listen address.
    #[arg(long, default_value = "0.0.0.0:8085", env = "TCPTRAIL_PROM_ADDR")]
    pub prom_addr: SocketAddr,

    /// Disable the metrics endpoint.
    #[arg(long)]
    pub no_prom: bool,

    /// YAML file with a `targets` list.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Discover targets from pod annotations.
    #[arg(long)]
    pub k8s: bool,

    /// Namespace to discover in (default: all).
    #[arg(long, env = "TCPTRAIL_NAMESPACE")]
    pub namespace: Option<String>,

    /// Time between discovery passes.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub discovery_interval: Duration,
}

impl Cli {
    pub fn format(&self) -> OutputFormat {
        if self.json_pretty {
            OutputFormat::JsonPretty
        } else if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }

    /// Whether any target source was given.
    pub fn has_sources(&self) -> bool {
        !self.targets.is_empty() || self.config.is_some() || self.k8s
    }

    /// The probe configuration every target starts from.
    pub fn base_config(&self) -> Result<ProbeConfig, ConfigError> {
        Ok(ProbeConfig {
            target: String::new(),
            count: self.count,
            interval: self.interval,
            quiet: self.quiet,
            timeout: self.timeout,
            insecure: self.insecure,
            server_name: self.server_name.clone().filter(|s| !s.is_empty()),
            src_addr: parse_src_addr(&self.src_addr)?,
            filter: FieldFilter::parse(&self.filter),
            format: self.format(),
            namespace: None,
            labels: BTreeMap::new(),
        })
    }

    /// Targets from the command line followed by those in the config file.
    pub fn static_targets(&self) -> Result<Vec<ProbeConfig>, ConfigError> {
        let base = self.base_config()?;
        let mut targets: Vec<ProbeConfig> = self
            .targets
            .iter()
            .map(|t| base.for_target(t, None, BTreeMap::new()))
            .collect();

        if let Some(path) = &self.config {
            let file = load_file(path)?;
            targets.extend(file.targets.into_iter().map(|r| r.into_probe_config(&base)));
        }

        Ok(targets)
    }
}

/// Contents of the YAML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub targets: Vec<TargetRecord>,
}

/// One `targets` entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TargetRecord {
    pub addr: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TargetRecord {
    /// Interval as a duration; `None` if absent or malformed.
    pub fn interval(&self) -> Option<Duration> {
        let raw = self.interval.as_deref()?.trim();
        match humantime::parse_duration(raw) {
            Ok(d) if !d.is_zero() => Some(d),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Config: Bad interval {:?} for {}: {}", raw, self.addr, e);
                None
            }
        }
    }

    pub fn into_probe_config(self, base: &ProbeConfig) -> ProbeConfig {
        let interval = self.interval();
        base.for_target(&self.addr, interval, self.labels)
    }
}

/// Load a YAML config file.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let settings = Config::builder()
        .add_source(File::new(&path.to_string_lossy(), FileFormat::Yaml).required(true))
        .build()?;
    Ok(settings.try_deserialize()?)
}

/// Parse a bind address: empty means none, an IP literal binds port 0.
pub fn parse_src_addr(raw: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(Some(SocketAddr::new(ip, 0)));
    }
    raw.parse::<SocketAddr>()
        .map(Some)
        .map_err(|_| ConfigError::SrcAddr(raw.to_string()))
}
