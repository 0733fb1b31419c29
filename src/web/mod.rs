//! Web server module: Prometheus scrape endpoint and target listing.

mod handlers;

pub use handlers::*;

use crate::metrics::MetricsExporter;
use crate::scheduler::TargetRegistry;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub exporter: Arc<MetricsExporter>,
    pub registry: TargetRegistry,
}

/// Metrics endpoint server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(exporter: Arc<MetricsExporter>, registry: TargetRegistry) -> Self {
        Self {
            state: AppState { exporter, registry },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/metrics", get(handlers::handle_metrics))
            .route("/api/targets", get(handlers::handle_get_targets))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until `cancel` fires.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!("Metrics server listening on {}", listener.local_addr()?);

        axum::serve(listener, self.routes())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;

        Ok(())
    }
}
