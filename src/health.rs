use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health, served on the tracker bind
/// address (`/metrics`, `/healthz`).
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total raw messages received from the broker.
    pub events_received: Counter,
    /// Total messages dropped because they failed to decode.
    pub decode_failures: Counter,
    /// Total events rejected by the internal-host allow-list.
    pub events_filtered: Counter,
    /// Total aggregate records emitted by session closure.
    pub records_emitted: Counter,
    /// Total record batches durably written to the store.
    pub batches_written: Counter,
    /// Total batch write attempts that failed.
    pub batch_errors: Counter,
    /// Total broker positions committed after durable writes.
    pub offsets_committed: Counter,
    /// Total transient broker failures that triggered a backoff.
    pub broker_reconnects: Counter,
    /// Sessions currently open in the aggregator.
    pub open_sessions: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total raw messages received from the broker.",
            )
            .namespace("tracker"),
        )?;
        let decode_failures = Counter::with_opts(
            Opts::new(
                "decode_failures_total",
                "Total messages dropped because they failed to decode.",
            )
            .namespace("tracker"),
        )?;
        let events_filtered = Counter::with_opts(
            Opts::new(
                "events_filtered_total",
                "Total events rejected by the internal-host allow-list.",
            )
            .namespace("tracker"),
        )?;
        let records_emitted = Counter::with_opts(
            Opts::new(
                "records_emitted_total",
                "Total aggregate records emitted by session closure.",
            )
            .namespace("tracker"),
        )?;
        let batches_written = Counter::with_opts(
            Opts::new(
                "batches_written_total",
                "Total record batches durably written to the store.",
            )
            .namespace("tracker"),
        )?;
        let batch_errors = Counter::with_opts(
            Opts::new(
                "batch_errors_total",
                "Total batch write attempts that failed.",
            )
            .namespace("tracker"),
        )?;
        let offsets_committed = Counter::with_opts(
            Opts::new(
                "offsets_committed_total",
                "Total broker positions committed after durable writes.",
            )
            .namespace("tracker"),
        )?;
        let broker_reconnects = Counter::with_opts(
            Opts::new(
                "broker_reconnects_total",
                "Total transient broker failures that triggered a backoff.",
            )
            .namespace("tracker"),
        )?;
        let open_sessions = Gauge::with_opts(
            Opts::new("open_sessions", "Sessions currently open in the aggregator.")
                .namespace("tracker"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(decode_failures.clone()))?;
        registry.register(Box::new(events_filtered.clone()))?;
        registry.register(Box::new(records_emitted.clone()))?;
        registry.register(Box::new(batches_written.clone()))?;
        registry.register(Box::new(batch_errors.clone()))?;
        registry.register(Box::new(offsets_committed.clone()))?;
        registry.register(Box::new(broker_reconnects.clone()))?;
        registry.register(Box::new(open_sessions.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            decode_failures,
            events_filtered,
            records_emitted,
            batches_written,
            batch_errors,
            offsets_committed,
            broker_reconnects,
            open_sessions,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Handle ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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
            tracing::info!(addr = %local_addr, "health server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health server.
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
