//! tcptrail - continuous TCP/HTTP connection probing
//!
//! Probes static and discovered targets on a fixed cadence, recording
//! DNS/connect/TLS/HTTP timings and kernel TCP statistics for each round.

mod config;
mod discovery;
mod metrics;
mod output;
mod probe;
mod scheduler;
mod stats;
mod web;

use crate::config::{Cli, ConfigError};
use crate::metrics::{MetricsExporter, METRIC_PREFIX};
use crate::output::RoundResult;
use crate::scheduler::{RoundSinks, TargetRegistry};
use crate::web::Server;

use clap::{CommandFactory, Parser};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RESULT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging; stdout is reserved for round results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("tcptrail=info".parse()?))
        .init();

    let cli = Cli::parse();

    if cli.metrics {
        print_metrics();
        return Ok(());
    }

    if !cli.has_sources() {
        Cli::command().print_help()?;
        return Err(ConfigError::NoTargets.into());
    }

    let base = cli.base_config()?;
    let targets = cli.static_targets()?;

    let root = CancellationToken::new();
    let exporter = Arc::new(MetricsExporter::new());

    // Result writer
    let (results_tx, results_rx) = mpsc::channel::<RoundResult>(RESULT_BUFFER);
    let writer = tokio::spawn(output::run_result_writer(results_rx, std::io::stdout()));

    let registry = TargetRegistry::with_cancel(
        RoundSinks {
            metrics: Some(exporter.clone()),
            results: Some(results_tx),
        },
        root.child_token(),
    );

    for target in targets {
        if let Err(e) = registry.admit(target).await {
            tracing::warn!("Skipping static target: {}", e);
        }
    }

    // Metrics server
    let server_task = if cli.no_prom {
        None
    } else {
        let listener = tokio::net::TcpListener::bind(cli.prom_addr).await?;
        let server = Server::new(exporter.clone(), registry.clone());
        let cancel = root.child_token();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, cancel).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    };

    let discovery_task = if cli.k8s {
        Some(start_discovery(&cli, base, registry.clone(), root.child_token()).await?)
    } else {
        None
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
        }
        _ = registry.wait_empty(), if discovery_task.is_none() => {
            tracing::info!("All targets finished");
        }
    }

    root.cancel();
    if let Some(task) = discovery_task {
        let _ = task.await;
    }
    registry.shutdown().await;
    if let Some(task) = server_task {
        let _ = task.await;
    }

    // The writer exits once the last result sender is gone.
    drop(registry);
    let _ = writer.await;

    Ok(())
}

#[cfg(feature = "k8s")]
async fn start_discovery(
    cli: &Cli,
    base: probe::ProbeConfig,
    registry: TargetRegistry,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error + Send + Sync>> {
    use crate::discovery::{DiscoveryReconciler, KubeInventory};

    let inventory = KubeInventory::try_default().await?;
    tracing::info!(
        "Discovering targets in {} every {:?}",
        cli.namespace.as_deref().unwrap_or("all namespaces"),
        cli.discovery_interval
    );
    let reconciler = DiscoveryReconciler::new(inventory, registry, base, cli.namespace.clone());
    Ok(tokio::spawn(reconciler.run(cli.discovery_interval, cancel)))
}

#[cfg(not(feature = "k8s"))]
async fn start_discovery(
    _cli: &Cli,
    _base: probe::ProbeConfig,
    _registry: TargetRegistry,
    _cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error + Send + Sync>> {
    Err("built without kubernetes support".into())
}

fn print_metrics() {
    for field in stats::exported_fields() {
        println!("{}{} - {}", METRIC_PREFIX, field.metric, field.help);
    }
}
