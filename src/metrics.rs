//! Prometheus export of probe results.
//!
//! Each exported stats field becomes one gauge per target, named
//! `tcptrail_<metric>` and carrying `target` plus the target's extra labels
//! as const labels. Registering a series that already exists is not an
//! error: the series keeps its name and labels and is fed by this exporter
//! from then on.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};

use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use regex::Regex;
use thiserror::Error;

use crate::stats::{exported_fields, Field, Stats};

pub const METRIC_PREFIX: &str = "tcptrail_";

/// Metrics error types.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// (metric name, sorted const labels)
type SeriesKey = (&'static str, Vec<(String, String)>);

/// Process-wide metrics registry shared by every scheduler loop.
pub struct MetricsExporter {
    registry: Registry,
    series: Mutex<HashMap<SeriesKey, Gauge>>,
}

impl Default for MetricsExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsExporter {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Update every exported series for `target` from `stats`.
    ///
    /// A field whose series cannot be registered (for instance because the
    /// same metric name was registered with a different label set) is
    /// skipped and logged; the remaining fields are still updated.
    pub fn observe(&self, target: &str, labels: &BTreeMap<String, String>, stats: &Stats) {
        let labels = const_labels(target, labels);
        for field in exported_fields() {
            match self.series(field, &labels) {
                Ok(gauge) => gauge.set(field.value(stats) as f64),
                Err(e) => {
                    tracing::warn!("Skipping metric {} for {}: {}", field.metric, target, e)
                }
            }
        }
    }

    /// Register-or-reuse the gauge for `field` with `labels`.
    pub fn series(
        &self,
        field: &'static Field,
        labels: &[(String, String)],
    ) -> Result<Gauge, MetricsError> {
        let key = (field.metric, labels.to_vec());
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(gauge) = series.get(&key) {
            return Ok(gauge.clone());
        }

        let opts = Opts::new(format!("{}{}", METRIC_PREFIX, field.metric), field.help)
            .const_labels(labels.iter().cloned().collect());
        let gauge = Gauge::with_opts(opts)?;
        match self.registry.register(Box::new(gauge.clone())) {
            Ok(()) => {}
            Err(prometheus::Error::AlreadyReg) => {
                // The registry cannot hand back the live collector, so take
                // over the series: same name and labels, our gauge.
                let _ = self.registry.unregister(Box::new(gauge.clone()));
                self.registry.register(Box::new(gauge.clone()))?;
            }
            Err(e) => return Err(e.into()),
        }
        series.insert(key, gauge.clone());
        Ok(gauge)
    }

    /// Unregister every series belonging to `target`.
    pub fn forget(&self, target: &str) {
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.retain(|(_, labels), gauge| {
            let owned = labels.iter().any(|(k, v)| k == "target" && v == target);
            if owned {
                let _ = self.registry.unregister(Box::new(gauge.clone()));
            }
            !owned
        });
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// `target` plus the extra labels, keys sanitized, sorted by key.
fn const_labels(target: &str, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut labels: BTreeMap<String, String> = extra
        .iter()
        .map(|(k, v)| (sanitize_label_name(k), v.clone()))
        .collect();
    labels.insert("target".to_string(), target.to_string());
    labels.into_iter().collect()
}

/// Map an arbitrary key onto a valid Prometheus label name.
pub fn sanitize_label_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_]").unwrap());

    let mut out = invalid.replace_all(name, "_").into_owned();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out.starts_with("__") {
        // Double underscore prefixes are reserved.
        out.replace_range(..2, "l_");
    }
    out
}
