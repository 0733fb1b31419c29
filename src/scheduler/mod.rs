//! Scheduler module: one probe loop per admitted target.

mod registry;

pub use registry::*;

use crate::metrics::MetricsExporter;
use crate::output::RoundResult;
use crate::probe::{ProbeClient, ProbeConfig, DEFAULT_INTERVAL};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Where each loop reports its rounds.
#[derive(Clone, Default)]
pub struct RoundSinks {
    pub metrics: Option<Arc<MetricsExporter>>,
    pub results: Option<mpsc::Sender<RoundResult>>,
}

/// Run the probe loop for a single target.
///
/// Rounds are strictly sequential. The loop ends when `count` rounds have
/// run (for a positive count) or when `cancel` fires; a failed round never
/// ends it. Returns the number of rounds started.
pub async fn run_probe_loop(
    config: Arc<ProbeConfig>,
    sinks: RoundSinks,
    cancel: CancellationToken,
) -> u64 {
    let probe_interval = if config.interval.is_zero() {
        DEFAULT_INTERVAL
    } else {
        config.interval
    };

    // Add jitter to avoid dialing every target in the same instant
    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
    tokio::select! {
        _ = cancel.cancelled() => return 0,
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut client = ProbeClient::new(config.clone());
    let mut interval = tokio::time::interval(probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut round: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        round += 1;
        let time = Utc::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = client.probe() => result.map(|_| ()),
        };

        if let Err(e) = outcome {
            let stats = client.stats();
            tracing::debug!(
                "Probe round {} failed for {}: {} ({} connect / {} dns errors over {} attempts)",
                round,
                config.target,
                e,
                stats.tcp_connect_error,
                stats.dns_resolve_error,
                stats.connect_attempts
            );
        }

        if let Some(metrics) = &sinks.metrics {
            metrics.observe(config.identity(), &config.labels, client.stats());
        }

        if !config.quiet {
            if let Some(tx) = &sinks.results {
                let result = RoundResult {
                    time,
                    target: config.target.clone(),
                    round,
                    stats: client.stats().clone(),
                    format: config.format,
                    filter: config.filter.clone(),
                };
                // A stalled sink must not keep a cancelled loop alive.
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(result) => sent,
                };
                if sent.is_err() {
                    tracing::error!("Failed to send result for {}", config.target);
                }
            }
        }

        if !config.is_unbounded() && round >= config.count as u64 {
            break;
        }
    }

    client.close();
    round
}
