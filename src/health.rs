use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for service health and observability.
///
/// All metrics use the "cairnstore" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Number of unique paths currently held by the accumulator.
    pub paths_tracked: Gauge,
    /// Total samples accepted from the line protocol.
    pub samples_received: Counter,
    /// Total samples dropped: malformed lines or a full ingest channel.
    pub samples_discarded: Counter,
    /// Total flush cycles completed.
    pub flushes: Counter,
    /// Total batch write errors against the backing store.
    pub store_write_errors: Counter,
    /// Total read errors against the backing store.
    pub store_read_errors: Counter,
    /// Total errors against the path index.
    pub index_errors: Counter,
    /// Rows emitted per flush cycle.
    pub flush_rows: Histogram,
    /// Request handling duration by method (get, delete, paths).
    pub request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let paths_tracked = Gauge::with_opts(
            Opts::new(
                "paths_tracked",
                "Number of unique paths held by the accumulator.",
            )
            .namespace("cairnstore"),
        )?;
        let samples_received = Counter::with_opts(
            Opts::new(
                "samples_received_total",
                "Total samples accepted from the line protocol.",
            )
            .namespace("cairnstore"),
        )?;
        let samples_discarded = Counter::with_opts(
            Opts::new(
                "samples_discarded_total",
                "Total samples dropped before accumulation.",
            )
            .namespace("cairnstore"),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total flush cycles completed.").namespace("cairnstore"),
        )?;
        let store_write_errors = Counter::with_opts(
            Opts::new(
                "store_write_errors_total",
                "Total batch write errors against the backing store.",
            )
            .namespace("cairnstore"),
        )?;
        let store_read_errors = Counter::with_opts(
            Opts::new(
                "store_read_errors_total",
                "Total read errors against the backing store.",
            )
            .namespace("cairnstore"),
        )?;
        let index_errors = Counter::with_opts(
            Opts::new("index_errors_total", "Total errors against the path index.")
                .namespace("cairnstore"),
        )?;
        let flush_rows = Histogram::with_opts(
            HistogramOpts::new("flush_rows", "Rows emitted per flush cycle.")
                .namespace("cairnstore")
                .buckets(vec![0.0, 10.0, 100.0, 1000.0, 10000.0, 100_000.0]),
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "Request handling duration by method.",
            )
            .namespace("cairnstore")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["method"],
        )?;

        registry.register(Box::new(paths_tracked.clone()))?;
        registry.register(Box::new(samples_received.clone()))?;
        registry.register(Box::new(samples_discarded.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(store_write_errors.clone()))?;
        registry.register(Box::new(store_read_errors.clone()))?;
        registry.register(Box::new(index_errors.clone()))?;
        registry.register(Box::new(flush_rows.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            paths_tracked,
            samples_received,
            samples_discarded,
            flushes,
            store_write_errors,
            store_read_errors,
            index_errors,
            flush_rows,
            request_duration,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").expect("metrics build");
        health.samples_received.inc();
        health.paths_tracked.set(42.0);

        let families = health.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "cairnstore_samples_received_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "cairnstore_paths_tracked"));
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics build");
        health.start().await.expect("server starts");
        health.stop().await.expect("server stops");
    }
}
