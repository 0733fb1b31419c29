//! Probe module for connection-level network measurements.
//!
//! A [`ProbeClient`] drives one target through DNS resolution, TCP connect,
//! an optional TLS handshake, a single HTTP GET and a kernel `tcp_info`
//! query, folding every outcome into a [`Stats`](crate::stats::Stats).

mod client;
mod target;
mod tcpinfo;
mod tls;

pub use client::*;
pub use target::*;
pub use tcpinfo::*;

#[cfg(test)]
pub(crate) use client::testutil;

use crate::output::OutputFormat;
use crate::stats::FieldFilter;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Cadence used when a target does not specify one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// Per-round budget used when a target does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe error types, one per stage of a round.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("dns resolution failed for {host}: {reason}")]
    Resolution { host: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("http request failed: {0}")]
    Request(String),
    #[error("tcp info unavailable: {0}")]
    Extraction(String),
}

/// Per-target probe configuration.
///
/// Immutable once the target's loop is running; changing it means
/// withdrawing the target and admitting it again.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Target address, a URL or `host[:port]`. Also the registry identity.
    pub target: String,
    /// Number of rounds to run; zero or negative runs until cancelled.
    pub count: i64,
    pub interval: Duration,
    /// Suppress per-round output (metrics are still updated).
    pub quiet: bool,
    pub timeout: Duration,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// TLS server name override.
    pub server_name: Option<String>,
    /// Local address to bind before dialing.
    pub src_addr: Option<SocketAddr>,
    pub filter: FieldFilter,
    pub format: OutputFormat,
    /// Discovery scope this target came from, if any.
    pub namespace: Option<String>,
    /// Extra metric labels.
    pub labels: BTreeMap<String, String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            count: 0,
            interval: DEFAULT_INTERVAL,
            quiet: false,
            timeout: DEFAULT_TIMEOUT,
            insecure: false,
            server_name: None,
            src_addr: None,
            filter: FieldFilter::default(),
            format: OutputFormat::default(),
            namespace: None,
            labels: BTreeMap::new(),
        }
    }
}

impl ProbeConfig {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.trim().to_string(),
            ..Default::default()
        }
    }

    /// Derive a config for another target from this one, used as a template
    /// for config-file and discovered targets.
    pub fn for_target(
        &self,
        target: &str,
        interval: Option<Duration>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            target: target.trim().to_string(),
            interval: interval.unwrap_or(self.interval),
            labels,
            ..self.clone()
        }
    }

    /// Registry key for this target.
    pub fn identity(&self) -> &str {
        &self.target
    }

    /// Whether the loop runs until cancelled.
    pub fn is_unbounded(&self) -> bool {
        self.count <= 0
    }
}
