use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::errors::ErrorCategory;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "ws_loadtest".to_string());

    pub static ref CONNECTIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("connections_total", "Total number of WebSocket connections established")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref DIAL_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("dial_errors_total", "Number of failed dials by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref ACTIVE_CONNECTIONS: IntGauge =
        IntGauge::with_opts(
            Opts::new("active_connections", "Number of WebSocket connections currently open")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref BYTES_RECEIVED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("bytes_received_total", "Total payload bytes read from all connections")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("messages_received_total", "Number of messages read by message type")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["type"]  // type: text, binary, ping, pong, close
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(CONNECTIONS_TOTAL.clone()))?;
    registry.register(Box::new(DIAL_ERRORS_TOTAL.clone()))?;
    registry.register(Box::new(ACTIVE_CONNECTIONS.clone()))?;
    registry.register(Box::new(BYTES_RECEIVED_TOTAL.clone()))?;
    registry.register(Box::new(MESSAGES_RECEIVED_TOTAL.clone()))?;
    init_dial_error_labels();
    Ok(())
}

/// Creates every `dial_errors_total` series up front so each category is
/// exported as 0 before its first failure.
pub fn init_dial_error_labels() {
    for category in ErrorCategory::all() {
        DIAL_ERRORS_TOTAL.with_label_values(&[category.label()]);
    }
}

fn encode(registry: &Arc<Mutex<Registry>>) -> Result<Vec<u8>, String> {
    let metric_families = registry
        .lock()
        .map_err(|_| "metrics registry lock poisoned".to_string())?
        .gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    Ok(buffer)
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match encode(&registry) {
        Ok(buffer) => Response::builder()
            .status(200)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(Body::from(buffer)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Response::builder().status(500).body(Body::from(e))
        }
    };

    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    match encode(registry).map(String::from_utf8) {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            error!(error = %e, "Error encoding metrics to UTF-8");
            String::from("# ERROR ENCODING METRICS TO UTF-8")
        }
        Err(e) => format!("# ERROR GATHERING METRICS: {}", e),
    }
}
