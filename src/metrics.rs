//! Prometheus metrics and the /metrics exporter.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Daemon metrics, registered against a private registry so tests can
/// create as many instances as they like.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Containers observed in the last cycle.
    pub containers: IntGauge,
    /// Services currently recorded in local state.
    pub services_registered: IntGauge,
    /// Errors of any kind since startup.
    pub errors: IntCounter,
    /// Completed reconcile cycles since startup.
    pub cycles: IntCounter,
    /// Sidecar containers launched in the last cycle.
    pub sidecars_launched: IntGauge,
    /// Orphan sidecar containers deleted in the last cycle.
    pub sidecars_deleted: IntGauge,
}

impl Metrics {
    /// Create and register the metric set.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let containers = IntGauge::with_opts(Opts::new(
            "dockconsul_containers_total",
            "Number of Docker containers observed",
        ))?;
        let services_registered = IntGauge::with_opts(Opts::new(
            "dockconsul_services_registered_total",
            "Number of Consul services registered",
        ))?;
        let errors = IntCounter::with_opts(Opts::new(
            "dockconsul_errors_total",
            "Number of errors encountered",
        ))?;
        let cycles = IntCounter::with_opts(Opts::new(
            "dockconsul_cycles_total",
            "Number of completed reconcile cycles",
        ))?;
        let sidecars_launched = IntGauge::with_opts(Opts::new(
            "dockconsul_sidecars_launched",
            "Number of sidecar containers launched in last cycle",
        ))?;
        let sidecars_deleted = IntGauge::with_opts(Opts::new(
            "dockconsul_sidecars_deleted",
            "Number of orphan sidecar containers deleted in last cycle",
        ))?;

        registry.register(Box::new(containers.clone()))?;
        registry.register(Box::new(services_registered.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(sidecars_launched.clone()))?;
        registry.register(Box::new(sidecars_deleted.clone()))?;

        Ok(Self {
            registry,
            containers,
            services_registered,
            errors,
            cycles,
            sidecars_launched,
            sidecars_deleted,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!("failed to encode metrics: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.encode_text()
}

/// Serve /metrics until the process exits. Bind failures are logged, not
/// fatal; the daemon is useful without its exporter.
pub async fn serve(addr: String, metrics: Arc<Metrics>) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(addr = %addr, "metrics exporter failed to bind: {e}");
            return;
        }
    };
    tracing::info!(addr = %addr, "metrics exporter listening");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::warn!("metrics exporter stopped: {e}");
    }
}
