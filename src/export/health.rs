use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "telemetron";

/// Prometheus metrics for agent and collector health.
///
/// All metrics use the "telemetron" namespace. Agent metrics are only
/// touched by the agent role, collector metrics by the server role.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Agent ===
    /// Total sampler polls.
    pub polls: Counter,
    /// Total sampler polls that failed.
    pub poll_errors: Counter,
    /// Total batches handed to the delivery queue.
    pub batches_queued: Counter,
    /// Delivery attempts by result (ok/failed).
    pub deliveries: CounterVec,
    /// Single delivery request duration.
    pub delivery_duration: Histogram,
    /// Batches dropped after every retry failed.
    pub retries_exhausted: Counter,

    // === Collector ===
    /// Metric updates accepted by kind.
    pub server_updates: CounterVec,
    /// Metrics per inbound batch.
    pub batch_size: Histogram,
    /// Storage failures by operation.
    pub storage_errors: CounterVec,
    /// File store writes by mode (append/snapshot).
    pub file_writes: CounterVec,
    /// File store write failures by mode (append/snapshot).
    pub file_write_failures: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Agent ===
        let polls = Counter::with_opts(
            Opts::new("polls_total", "Total sampler polls.").namespace(NAMESPACE),
        )?;
        let poll_errors = Counter::with_opts(
            Opts::new("poll_errors_total", "Total sampler polls that failed.")
                .namespace(NAMESPACE),
        )?;
        let batches_queued = Counter::with_opts(
            Opts::new(
                "batches_queued_total",
                "Total batches handed to the delivery queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let deliveries = CounterVec::new(
            Opts::new("deliveries_total", "Delivery attempts by result.").namespace(NAMESPACE),
            &["result"],
        )?;
        let delivery_duration = Histogram::with_opts(
            HistogramOpts::new(
                "delivery_duration_seconds",
                "Duration of a single delivery request.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let retries_exhausted = Counter::with_opts(
            Opts::new(
                "retries_exhausted_total",
                "Batches dropped after every retry failed.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Collector ===
        let server_updates = CounterVec::new(
            Opts::new("server_updates_total", "Metric updates accepted by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("server_batch_size", "Metrics per inbound batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]),
        )?;
        let storage_errors = CounterVec::new(
            Opts::new("storage_errors_total", "Storage failures by operation.")
                .namespace(NAMESPACE),
            &["operation"],
        )?;
        let file_writes = CounterVec::new(
            Opts::new("file_writes_total", "File store writes by mode.").namespace(NAMESPACE),
            &["mode"],
        )?;
        let file_write_failures = CounterVec::new(
            Opts::new(
                "file_write_failures_total",
                "File store write failures by mode.",
            )
            .namespace(NAMESPACE),
            &["mode"],
        )?;

        registry.register(Box::new(polls.clone()))?;
        registry.register(Box::new(poll_errors.clone()))?;
        registry.register(Box::new(batches_queued.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(delivery_duration.clone()))?;
        registry.register(Box::new(retries_exhausted.clone()))?;
        registry.register(Box::new(server_updates.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(storage_errors.clone()))?;
        registry.register(Box::new(file_writes.clone()))?;
        registry.register(Box::new(file_write_failures.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            polls,
            poll_errors,
            batches_queued,
            deliveries,
            delivery_duration,
            retries_exhausted,
            server_updates,
            batch_size,
            storage_errors,
            file_writes,
            file_write_failures,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
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

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

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

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "rendering metrics");
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
    fn test_metrics_are_namespaced() {
        let health = HealthMetrics::new(":0").expect("health");
        health.polls.inc();
        health.server_updates.with_label_values(&["counter"]).inc_by(3.0);

        let text = health.render().expect("render");
        assert!(text.contains("telemetron_polls_total 1"));
        assert!(text.contains("telemetron_server_updates_total{kind=\"counter\"} 3"));
    }

    #[tokio::test]
    async fn test_server_serves_metrics_and_healthz() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("health");
        health.batches_queued.inc();
        let addr = health.start().await.expect("start");

        let client = reqwest::Client::new();
        let body = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains("telemetron_batches_queued_total 1"));

        health.stop().await.expect("stop");
    }
}
