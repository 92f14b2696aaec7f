use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metric::Metric;
use crate::stabilize::StabilizedReading;

const NAMESPACE: &str = "envirolog";

/// Prometheus metrics for logger health.
///
/// All metrics use the "envirolog" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed cycles by outcome (delivered/spooled/empty/error).
    pub cycles: CounterVec,
    /// Wall time of one sample-to-delivery cycle.
    pub cycle_duration: Histogram,
    /// Cycles that ran longer than the interval.
    pub cycle_overruns: Counter,
    /// Stabilized readings by metric and result.
    pub readings: CounterVec,
    /// Last accepted value per metric.
    pub last_value: GaugeVec,
    /// Fresh batch deliveries by result (success/failure).
    pub deliveries: CounterVec,
    /// Attempts used per delivery.
    pub delivery_attempts: Histogram,
    /// Failed write attempts by error kind.
    pub delivery_errors: CounterVec,
    /// Entries currently queued in the spool.
    pub spool_entries: Gauge,
    /// Configured spool capacity.
    pub spool_capacity: Gauge,
    /// Entries evicted from a full spool.
    pub spool_evictions: Counter,
    /// Spooled entries replayed successfully.
    pub spool_replayed: Counter,
    /// Whether the spool still writes to disk (1=yes, 0=no).
    pub spool_durable: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = CounterVec::new(
            Opts::new("cycles_total", "Completed sampling cycles by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Wall time of one sampling cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
        )?;
        let cycle_overruns = Counter::with_opts(
            Opts::new(
                "cycle_overruns_total",
                "Cycles that took longer than the sampling interval.",
            )
            .namespace(NAMESPACE),
        )?;
        let readings = CounterVec::new(
            Opts::new("readings_total", "Stabilized readings by metric and result.")
                .namespace(NAMESPACE),
            &["metric", "result"],
        )?;
        let last_value = GaugeVec::new(
            Opts::new("last_value", "Last accepted value per metric.").namespace(NAMESPACE),
            &["metric"],
        )?;
        let deliveries = CounterVec::new(
            Opts::new("deliveries_total", "Fresh batch deliveries by result.")
                .namespace(NAMESPACE),
            &["result"],
        )?;
        let delivery_attempts = Histogram::with_opts(
            HistogramOpts::new("delivery_attempts", "Write attempts used per delivery.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0]),
        )?;
        let delivery_errors = CounterVec::new(
            Opts::new("delivery_errors_total", "Failed deliveries by error kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let spool_entries = Gauge::with_opts(
            Opts::new("spool_entries", "Batches waiting in the spool.").namespace(NAMESPACE),
        )?;
        let spool_capacity = Gauge::with_opts(
            Opts::new("spool_capacity", "Maximum batches the spool holds.").namespace(NAMESPACE),
        )?;
        let spool_evictions = Counter::with_opts(
            Opts::new(
                "spool_evictions_total",
                "Spooled batches dropped because the spool was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let spool_replayed = Counter::with_opts(
            Opts::new(
                "spool_replayed_total",
                "Spooled batches delivered on replay.",
            )
            .namespace(NAMESPACE),
        )?;
        let spool_durable = Gauge::with_opts(
            Opts::new(
                "spool_durable",
                "Whether the spool is persisted to disk (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(cycle_overruns.clone()))?;
        registry.register(Box::new(readings.clone()))?;
        registry.register(Box::new(last_value.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(delivery_attempts.clone()))?;
        registry.register(Box::new(delivery_errors.clone()))?;
        registry.register(Box::new(spool_entries.clone()))?;
        registry.register(Box::new(spool_capacity.clone()))?;
        registry.register(Box::new(spool_evictions.clone()))?;
        registry.register(Box::new(spool_replayed.clone()))?;
        registry.register(Box::new(spool_durable.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_duration,
            cycle_overruns,
            readings,
            last_value,
            deliveries,
            delivery_attempts,
            delivery_errors,
            spool_entries,
            spool_capacity,
            spool_evictions,
            spool_replayed,
            spool_durable,
        })
    }

    /// Record one stabilized reading.
    pub fn observe_reading(&self, metric: Metric, reading: StabilizedReading) {
        let result = match reading {
            StabilizedReading::Accepted(v) => {
                self.last_value.with_label_values(&[metric.as_str()]).set(v);
                "accepted"
            }
            StabilizedReading::Missing(reason) => reason.as_str(),
        };

        self.readings
            .with_label_values(&[metric.as_str(), result])
            .inc();
    }

    /// Prometheus text exposition of the current registry.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    /// Does nothing when no address is configured.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        if self.addr.is_empty() {
            tracing::debug!("health metrics server disabled");
            return Ok(None);
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(Some(local_addr))
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn render_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
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
