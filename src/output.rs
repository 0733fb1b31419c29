//! Result sink: rounds flow through a channel into a single writer task.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::stats::{FieldFilter, Stats};

/// How round results are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonPretty,
}

/// One completed round, as delivered to the result sink.
#[derive(Debug, Clone)]
pub struct RoundResult {
    pub time: DateTime<Utc>,
    pub target: String,
    pub round: u64,
    pub stats: Stats,
    pub format: OutputFormat,
    pub filter: FieldFilter,
}

impl RoundResult {
    /// Render according to the result's format, without a trailing newline.
    pub fn render(&self) -> String {
        match self.format {
            OutputFormat::Text => render_text(self),
            OutputFormat::Json => render_json(&self.stats, &self.filter),
            OutputFormat::JsonPretty => render_json_pretty(&self.stats, &self.filter),
        }
    }
}

fn field_map(stats: &Stats, filter: &FieldFilter) -> Map<String, Value> {
    filter
        .fields()
        .map(|f| (f.name.to_string(), Value::from(f.value(stats))))
        .collect()
}

pub fn render_text(result: &RoundResult) -> String {
    let mut out = format!(
        "{} target: {} round: {}",
        result.time.to_rfc3339(),
        result.target,
        result.round
    );
    for field in result.filter.fields() {
        out.push_str(&format!(" {}:{}", field.name, field.value(&result.stats)));
    }
    out
}

pub fn render_json(stats: &Stats, filter: &FieldFilter) -> String {
    Value::Object(field_map(stats, filter)).to_string()
}

pub fn render_json_pretty(stats: &Stats, filter: &FieldFilter) -> String {
    let map = field_map(stats, filter);
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    if map.serialize(&mut ser).is_err() {
        return render_json(stats, filter);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Drain round results into `out`, one rendered result per line.
///
/// Returns once every sender has been dropped.
pub async fn run_result_writer<W>(mut rx: mpsc::Receiver<RoundResult>, mut out: W)
where
    W: Write + Send,
{
    while let Some(result) = rx.recv().await {
        if let Err(e) = writeln!(out, "{}", result.render()).and_then(|_| out.flush()) {
            tracing::error!("Failed to write result for {}: {}", result.target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stats: Stats, format: OutputFormat, filter: &str) -> RoundResult {
        RoundResult {
            time: Utc::now(),
            target: "127.0.0.1".to_string(),
            round: 1,
            stats,
            format,
            filter: FieldFilter::parse(filter),
        }
    }

    #[test]
    fn test_print_text() {
        let mut stats = Stats::default();
        stats.kernel.rtt = 5;
        let out = result(stats, OutputFormat::Text, "rtt").render();
        assert!(out.contains("target: 127.0.0.1"));
        assert!(out.ends_with("Rtt:5"));
    }

    #[test]
    fn test_print_json() {
        let out = result(Stats::default(), OutputFormat::Json, "rtt").render();
        assert_eq!(out, r#"{"Rtt":0}"#);
    }

    #[test]
    fn test_print_json_pretty() {
        let out = result(Stats::default(), OutputFormat::JsonPretty, "rtt").render();
        assert_eq!(out, "{\n \"Rtt\": 0\n}");
    }

    #[test]
    fn test_json_keeps_table_order() {
        let stats = Stats { state: 1, http_status_code: 200, ..Default::default() };
        let out = result(stats, OutputFormat::Json, "HTTPStatusCode,State").render();
        assert_eq!(out, r#"{"State":1,"HTTPStatusCode":200}"#);
    }

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (tx, rx) = mpsc::channel(8);
        for round in 1..=3 {
            let mut r = result(Stats::default(), OutputFormat::Text, "State");
            r.round = round;
            tx.send(r).await.unwrap();
        }
        drop(tx);

        let mut buf = Vec::new();
        run_result_writer(rx, &mut buf).await;

        let text = String::from_utf8(buf).unwrap();
        let rounds: Vec<_> = text
            .lines()
            .map(|l| l.split(" round: ").nth(1).unwrap().split(' ').next().unwrap().to_string())
            .collect();
        assert_eq!(rounds, vec!["1", "2", "3"]);
    }
}
