//! Prometheus metrics definitions and HTTP servers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "oadp_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors by classified reason
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "oadp_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind", "reason"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "oadp_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Child object writes performed by the apply engine
    pub static ref APPLIED_OBJECTS: CounterVec = register_counter_vec!(
        "oadp_operator_applied_objects_total",
        "Child objects applied by operation",
        &["kind", "operation"]
    ).unwrap();

    /// Remote bucket operations
    pub static ref BUCKET_OPERATIONS: CounterVec = register_counter_vec!(
        "oadp_operator_bucket_operations_total",
        "Object storage bucket operations by outcome",
        &["operation", "outcome"]
    ).unwrap();

    /// Last measured upload speed of a DataProtectionTest
    pub static ref DPT_UPLOAD_SPEED: GaugeVec = register_gauge_vec!(
        "oadp_operator_dpt_upload_speed_mbps",
        "Upload speed measured by the last DataProtectionTest in Mbps",
        &["namespace", "name"]
    ).unwrap();

    /// 1 while this process holds the leader lease
    pub static ref LEADER: Gauge = register_gauge!(
        "oadp_operator_leader",
        "Whether this instance is the elected leader"
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "oadp_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Flag flipped once the controllers are running
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
enum Endpoint {
    Metrics,
    Probes(Readiness),
}

/// Serve `/metrics`
pub async fn serve_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    OPERATOR_HEALTH.set(1.0);
    serve(addr, Endpoint::Metrics).await
}

/// Serve `/healthz` and `/readyz`
pub async fn serve_probes(addr: SocketAddr, readiness: Readiness) -> anyhow::Result<()> {
    serve(addr, Endpoint::Probes(readiness)).await
}

async fn serve(addr: SocketAddr, endpoint: Endpoint) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let endpoint = endpoint.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let endpoint = endpoint.clone();
                async move { Ok::<_, hyper::Error>(route(&endpoint, req.uri().path())) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

fn route(endpoint: &Endpoint, path: &str) -> Response<Full<Bytes>> {
    match (endpoint, path) {
        (Endpoint::Metrics, "/metrics") => metrics_response(),
        (Endpoint::Probes(_), "/healthz") => text(StatusCode::OK, "ok"),
        (Endpoint::Probes(readiness), "/readyz") => {
            if readiness.is_ready() {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "controllers not started")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readyz_waits_for_controllers() {
        let readiness = Readiness::new();
        let probes = Endpoint::Probes(readiness.clone());
        assert_eq!(route(&probes, "/healthz").status(), StatusCode::OK);
        assert_eq!(route(&probes, "/readyz").status(), StatusCode::SERVICE_UNAVAILABLE);

        readiness.set_ready(true);
        assert_eq!(route(&probes, "/readyz").status(), StatusCode::OK);
    }

    #[test]
    fn metrics_only_on_metrics_endpoint() {
        RECONCILIATIONS.with_label_values(&["DataProtectionApplication"]).inc();
        let response = route(&Endpoint::Metrics, "/metrics");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            route(&Endpoint::Probes(Readiness::new()), "/metrics").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(route(&Endpoint::Metrics, "/readyz").status(), StatusCode::NOT_FOUND);
    }
}
