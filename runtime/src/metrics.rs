//! Prometheus metrics for API calls.
//!
//! [`InstrumentedTransport`] wraps any [`Transport`] and records, for every
//! call it creates:
//! - calls started, succeeded and failed (labelled by failure kind)
//! - call duration
//! - response size
//!
//! # Example
//!
//! ```rust,no_run
//! use api_request_runtime::metrics::{InstrumentedTransport, MetricsServer};
//! use api_request_runtime::transport::ReqwestTransport;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! let transport = InstrumentedTransport::new(Arc::new(ReqwestTransport::new(Duration::from_secs(30))?));
//! # Ok(())
//! # }
//! ```

use api_request_core::error::TransportError;
use api_request_core::transport::{FailureCallback, Method, Transport, TransportCall};
use futures::future::BoxFuture;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the API call metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the metrics are advertised on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("api_request_duration_seconds".to_string()),
                &[
                    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Full("api_request_response_bytes".to_string()),
                &[
                    128.0, 1024.0, 8192.0, 65536.0, 524_288.0, 4_194_304.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(BuildError::FailedToSetGlobalRecorder(_)) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "api_requests_started_total",
        "Total number of API calls started"
    );
    describe_counter!(
        "api_requests_succeeded_total",
        "Total number of API calls that received a success response"
    );
    describe_counter!(
        "api_requests_failed_total",
        "Total number of API calls that failed, by failure kind"
    );
    describe_histogram!(
        "api_request_duration_seconds",
        "Time taken by API calls"
    );
    describe_histogram!(
        "api_request_response_bytes",
        "Size of API call response bodies"
    );
}

/// API call metrics recorder.
pub struct RequestMetrics;

impl RequestMetrics {
    /// Record a call being started.
    pub fn record_start(method: Method) {
        counter!("api_requests_started_total", "method" => method.as_str()).increment(1);
    }

    /// Record a successful call.
    pub fn record_success(duration: Duration) {
        counter!("api_requests_succeeded_total").increment(1);
        histogram!("api_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed call.
    pub fn record_failure(error: &TransportError, duration: Duration) {
        counter!("api_requests_failed_total", "kind" => error.kind()).increment(1);
        histogram!("api_request_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the size of a response body.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_response_size(bytes: u64) {
        histogram!("api_request_response_bytes").record(bytes as f64);
    }
}

/// Transport decorator recording [`RequestMetrics`] for every call.
pub struct InstrumentedTransport {
    inner: Arc<dyn Transport>,
}

impl InstrumentedTransport {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self { inner }
    }
}

impl Transport for InstrumentedTransport {
    fn create_call(&self, uri: &str) -> Box<dyn TransportCall> {
        Box::new(InstrumentedCall {
            inner: self.inner.create_call(uri),
            method: Method::Get,
        })
    }
}

struct InstrumentedCall {
    inner: Box<dyn TransportCall>,
    method: Method,
}

impl TransportCall for InstrumentedCall {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn set_method(&mut self, method: Method) {
        self.method = method;
        self.inner.set_method(method);
    }

    fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        self.inner.set_body(content_type, body);
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.inner.add_header(name, value);
    }

    fn set_allow_retry_on_timeout(&mut self, allow: bool) {
        self.inner.set_allow_retry_on_timeout(allow);
    }

    fn set_failure_callback(&mut self, callback: FailureCallback) {
        self.inner.set_failure_callback(callback);
    }

    fn perform(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            RequestMetrics::record_start(self.method);
            let start = Instant::now();

            let result = self.inner.perform().await;
            let duration = start.elapsed();

            match &result {
                Ok(()) => RequestMetrics::record_success(duration),
                Err(error) => RequestMetrics::record_failure(error, duration),
            }
            if let Some(bytes) = self.inner.response_length() {
                RequestMetrics::record_response_size(bytes);
            }
            result
        })
    }

    fn abort(&self) {
        self.inner.abort();
    }

    fn response_body_string(&self) -> Option<String> {
        self.inner.response_body_string()
    }

    fn response_length(&self) -> Option<u64> {
        self.inner.response_length()
    }
}
