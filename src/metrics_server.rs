// HTTP server for Prometheus metrics endpoint
//
// Listens on an internal-only address (default: 127.0.0.1:9090), separate
// from the authenticated gateway surface. Used by Prometheus to scrape.

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};

use crate::metrics;

/// Start the metrics HTTP server
///
/// # Arguments
/// * `listen` - Address to bind (e.g. "127.0.0.1:9090")
pub async fn start_metrics_server(listen: &str) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));

    info!("Starting metrics server on {}", listen);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", listen))?;

    axum::serve(listener, app)
        .await
        .context("Metrics server error")?;

    Ok(())
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}
