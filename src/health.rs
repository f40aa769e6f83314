use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for coordinator health and observability.
///
/// All metrics use the "aggregoor" namespace. This is the stats surface the
/// coordinator and report hosts borrow through `Globals`; batch drops in
/// particular are only visible here.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total batches received on the coordinator input queue.
    pub batches_received: Counter,
    /// Total batch references enqueued to report hosts during fan-out.
    pub batches_forwarded: Counter,
    /// Total batches dropped because a report host's ingest queue was full.
    pub batches_dropped: CounterVec,
    /// Total packets delivered to each report.
    pub packets_received: CounterVec,
    /// Number of live report hosts.
    pub reports_active: Gauge,
    /// Control requests by request kind and outcome.
    pub control_requests: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let batches_received = Counter::with_opts(
            Opts::new(
                "batches_received_total",
                "Total batches received on the coordinator input queue.",
            )
            .namespace("aggregoor"),
        )?;
        let batches_forwarded = Counter::with_opts(
            Opts::new(
                "batches_forwarded_total",
                "Total batch references enqueued to report hosts.",
            )
            .namespace("aggregoor"),
        )?;
        let batches_dropped = CounterVec::new(
            Opts::new(
                "batches_dropped_total",
                "Total batches dropped per report because its ingest queue was full.",
            )
            .namespace("aggregoor"),
            &["report"],
        )?;
        let packets_received = CounterVec::new(
            Opts::new(
                "packets_received_total",
                "Total packets delivered to each report.",
            )
            .namespace("aggregoor"),
            &["report"],
        )?;
        let reports_active = Gauge::with_opts(
            Opts::new("reports_active", "Number of live report hosts.").namespace("aggregoor"),
        )?;
        let control_requests = CounterVec::new(
            Opts::new(
                "control_requests_total",
                "Total control requests by request kind and outcome.",
            )
            .namespace("aggregoor"),
            &["request", "status"],
        )?;

        registry.register(Box::new(batches_received.clone()))?;
        registry.register(Box::new(batches_forwarded.clone()))?;
        registry.register(Box::new(batches_dropped.clone()))?;
        registry.register(Box::new(packets_received.clone()))?;
        registry.register(Box::new(reports_active.clone()))?;
        registry.register(Box::new(control_requests.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            batches_received,
            batches_forwarded,
            batches_dropped,
            packets_received,
            reports_active,
            control_requests,
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
