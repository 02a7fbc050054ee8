use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "trafficwatch";

/// Prometheus metrics for capture and persistence health.
///
/// All metrics use the "trafficwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Capture ===
    /// Frames delivered by the capture backend.
    pub frames_received: Counter,
    /// Frames that decoded to an IP packet.
    pub packets_decoded: Counter,
    /// Packets above the anomaly threshold.
    pub anomalies_detected: Counter,
    /// Reported pipeline errors by kind.
    pub errors: CounterVec,
    /// Session lifecycle state (0=idle, 1=capturing, 2=stopped).
    pub session_state: Gauge,

    // === Persistence ===
    /// Records persisted to the store.
    pub records_flushed: Counter,
    /// Bulk insert duration (1ms-5s buckets).
    pub flush_duration: Histogram,
    /// Records per bulk insert (1-10000 buckets).
    pub flush_batch_size: Histogram,
    /// Times the capture thread waited on a full flush queue.
    pub flush_queue_backpressure: Counter,
    /// Records held back after a failed insert, awaiting retry.
    pub records_retained: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let frames_received = Counter::with_opts(
            Opts::new(
                "frames_received_total",
                "Total frames delivered by the capture device.",
            )
            .namespace(NAMESPACE),
        )?;
        let packets_decoded = Counter::with_opts(
            Opts::new(
                "packets_decoded_total",
                "Total frames decoded to an IP packet.",
            )
            .namespace(NAMESPACE),
        )?;
        let anomalies_detected = Counter::with_opts(
            Opts::new(
                "anomalies_detected_total",
                "Total packets larger than the anomaly threshold.",
            )
            .namespace(NAMESPACE),
        )?;
        let errors = CounterVec::new(
            Opts::new("errors_total", "Pipeline errors by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let session_state = Gauge::with_opts(
            Opts::new(
                "session_state",
                "Capture session state (0=idle, 1=capturing, 2=stopped).",
            )
            .namespace(NAMESPACE),
        )?;

        let records_flushed = Counter::with_opts(
            Opts::new(
                "records_flushed_total",
                "Total records persisted to the store.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Duration of one bulk insert into the store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        let flush_batch_size = Histogram::with_opts(
            HistogramOpts::new("flush_batch_size", "Records per bulk insert.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 10.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0, 10000.0,
                ]),
        )?;
        let flush_queue_backpressure = Counter::with_opts(
            Opts::new(
                "flush_queue_backpressure_total",
                "Times the capture thread waited on a full flush queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_retained = Gauge::with_opts(
            Opts::new(
                "records_retained",
                "Records held back after a failed insert, awaiting retry.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(packets_decoded.clone()))?;
        registry.register(Box::new(anomalies_detected.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(session_state.clone()))?;
        registry.register(Box::new(records_flushed.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(flush_queue_backpressure.clone()))?;
        registry.register(Box::new(records_retained.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            frames_received,
            packets_decoded,
            anomalies_detected,
            errors,
            session_state,
            records_flushed,
            flush_duration,
            flush_batch_size,
            flush_queue_backpressure,
            records_retained,
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

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
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
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
