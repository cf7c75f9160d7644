use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for scheduler health and write-path telemetry.
///
/// All metrics use the "rollupd" namespace. None of them sit on the
/// correctness path; they are fire-and-forget observations.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Slot keys awaiting dispatch, across all shards.
    pub scheduled_slots: Gauge,
    /// Slot keys currently executing, across all shards.
    pub running_slots: Gauge,
    /// Dirty slots tail-dropped for exceeding the max age.
    pub slots_dropped: Counter,
    /// Slot keys retired after a fully successful execution.
    pub slots_rolled: Counter,
    /// Executions that failed and were requeued.
    pub rollup_failures: Counter,
    /// Rollups per storage write batch.
    pub rollup_batch_size: Histogram,
    /// Wall time of one storage write batch.
    pub batch_write_duration: Histogram,
    /// Unix seconds of the last successful batch write.
    pub last_rollup_time: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<HealthMetrics> {
        let registry = Registry::new();

        let scheduled_slots = Gauge::with_opts(
            Opts::new("scheduled_slots", "Slot keys awaiting dispatch.").namespace("rollupd"),
        )?;
        let running_slots = Gauge::with_opts(
            Opts::new("running_slots", "Slot keys currently executing.").namespace("rollupd"),
        )?;
        let slots_dropped = Counter::with_opts(
            Opts::new(
                "slots_dropped_total",
                "Dirty slots dropped for exceeding the max age.",
            )
            .namespace("rollupd"),
        )?;
        let slots_rolled = Counter::with_opts(
            Opts::new("slots_rolled_total", "Slot keys retired successfully.")
                .namespace("rollupd"),
        )?;
        let rollup_failures = Counter::with_opts(
            Opts::new(
                "rollup_failures_total",
                "Slot executions that failed and were requeued.",
            )
            .namespace("rollupd"),
        )?;
        let rollup_batch_size = Histogram::with_opts(
            HistogramOpts::new("rollup_batch_size", "Rollups per storage write batch.")
                .namespace("rollupd")
                .buckets(vec![
                    1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 10_000.0,
                ]),
        )?;
        let batch_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_write_duration_seconds",
                "Wall time of one storage write batch.",
            )
            .namespace("rollupd")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let last_rollup_time = Gauge::with_opts(
            Opts::new(
                "last_rollup_time_seconds",
                "Unix seconds of the last successful batch write.",
            )
            .namespace("rollupd"),
        )?;

        registry.register(Box::new(scheduled_slots.clone()))?;
        registry.register(Box::new(running_slots.clone()))?;
        registry.register(Box::new(slots_dropped.clone()))?;
        registry.register(Box::new(slots_rolled.clone()))?;
        registry.register(Box::new(rollup_failures.clone()))?;
        registry.register(Box::new(rollup_batch_size.clone()))?;
        registry.register(Box::new(batch_write_duration.clone()))?;
        registry.register(Box::new(last_rollup_time.clone()))?;

        Ok(HealthMetrics {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            scheduled_slots,
            running_slots,
            slots_dropped,
            slots_rolled,
            rollup_failures,
            rollup_batch_size,
            batch_write_duration,
            last_rollup_time,
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
