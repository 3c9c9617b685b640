use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tonic::Status;

/// CSI metrics collector
pub struct CsiMetrics {
    /// Total CSI operations
    pub operations_total: CounterVec,
    /// CSI operation duration in seconds
    pub operation_duration: HistogramVec,
    /// CSI operation errors, by gRPC code
    pub operation_errors: CounterVec,
}

impl CsiMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("restvirt_csi_operations_total", "Total CSI operations"),
            &["method"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "restvirt_csi_operation_duration_seconds",
                "CSI operation duration in seconds",
            ),
            &["method"],
        )?;

        let operation_errors = CounterVec::new(
            Opts::new("restvirt_csi_operation_errors_total", "CSI operation errors"),
            &["method", "code"],
        )?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;

        Ok(Self { operations_total, operation_duration, operation_errors })
    }

    /// Record an operation
    pub fn record_operation(&self, method: &str, duration_secs: f64, error: Option<tonic::Code>) {
        self.operations_total.with_label_values(&[method]).inc();
        self.operation_duration.with_label_values(&[method]).observe(duration_secs);
        if let Some(code) = error {
            let code = format!("{:?}", code);
            self.operation_errors.with_label_values(&[method, code.as_str()]).inc();
        }
    }

    /// Run one RPC body, recording its duration and outcome.
    pub async fn track<T, F>(&self, method: &str, operation: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        let start = Instant::now();
        let result = operation.await;
        let elapsed = start.elapsed().as_secs_f64();

        match &result {
            Ok(_) => {
                tracing::debug!(method, elapsed, "CSI call succeeded");
                self.record_operation(method, elapsed, None);
            }
            Err(status) => {
                tracing::warn!(
                    method,
                    elapsed,
                    code = ?status.code(),
                    message = status.message(),
                    "CSI call failed"
                );
                self.record_operation(method, elapsed, Some(status.code()));
            }
        }

        result
    }
}

async fn render(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, [(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new().route("/metrics", get(render)).with_state(registry)
}

/// Serve `/metrics` until the process exits
pub async fn serve_metrics(registry: Arc<Registry>, addr: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;

    tracing::info!("Metrics listening on {}", addr);

    axum::serve(listener, metrics_router(registry)).await.context("Metrics server error")
}
