//! reqwest-backed transport.
//!
//! Each [`ReqwestCall`] performs one HTTP exchange. The call keeps the response
//! body even when the server answers with an error status, so the request can
//! recover the server's message from it. Aborting wakes the in-flight exchange
//! through a [`Notify`] and makes it resolve with [`TransportError::Aborted`].
//!
//! # Example
//!
//! ```rust,no_run
//! use api_request_runtime::transport::ReqwestTransport;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = ReqwestTransport::new(Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```

use api_request_core::config::ApiConfig;
use api_request_core::error::TransportError;
use api_request_core::transport::{FailureCallback, Method, Transport, TransportCall};
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// How many times a call retries after a timeout, when retrying is allowed
pub const MAX_RETRIES_ON_TIMEOUT: u32 = 1;

/// Transport creating [`ReqwestCall`]s on a shared connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Create a transport whose calls time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(client, timeout))
    }

    /// Create a transport from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn from_config(config: &ApiConfig) -> Result<Self, reqwest::Error> {
        Self::new(config.timeout())
    }

    /// Create a transport on an existing client.
    #[must_use]
    pub const fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl Transport for ReqwestTransport {
    fn create_call(&self, uri: &str) -> Box<dyn TransportCall> {
        Box::new(ReqwestCall::new(self.client.clone(), uri, self.timeout))
    }
}

/// One HTTP exchange.
pub struct ReqwestCall {
    client: Client,
    uri: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<(String, Vec<u8>)>,
    timeout: Duration,
    allow_retry_on_timeout: bool,
    failure_callback: Option<FailureCallback>,
    aborted: AtomicBool,
    abort_signal: Notify,
    response: Mutex<Option<Vec<u8>>>,
}

impl ReqwestCall {
    /// Create a GET call to `uri`.
    #[must_use]
    pub fn new(client: Client, uri: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            uri: uri.into(),
            method: Method::Get,
            headers: Vec::new(),
            body: None,
            timeout,
            allow_retry_on_timeout: true,
            failure_callback: None,
            aborted: AtomicBool::new(false),
            abort_signal: Notify::new(),
            response: Mutex::new(None),
        }
    }

    /// Whether the call has been aborted
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn run(&self) -> Result<(), TransportError> {
        let mut retries = 0;

        loop {
            if self.is_aborted() {
                return Err(TransportError::Aborted);
            }

            match self.attempt().await {
                Err(TransportError::Timeout)
                    if self.allow_retry_on_timeout && retries < MAX_RETRIES_ON_TIMEOUT =>
                {
                    retries += 1;
                    tracing::warn!(uri = %self.uri, retries, "Call timed out, retrying");
                }
                result => return result,
            }
        }
    }

    async fn attempt(&self) -> Result<(), TransportError> {
        let exchange = async {
            let response = self.build().send().await.map_err(map_error)?;
            let status = response.status();
            let bytes = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Body(e.to_string())
                }
            })?;

            tracing::trace!(uri = %self.uri, status = status.as_u16(), bytes = bytes.len(), "Response read");
            *self.response.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.to_vec());

            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::Status {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or_default().to_string(),
                })
            }
        };

        tokio::select! {
            biased;
            () = self.abort_signal.notified() => Err(TransportError::Aborted),
            result = exchange => result,
        }
    }

    fn build(&self) -> reqwest::RequestBuilder {
        let method = match self.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &self.uri)
            .timeout(self.timeout);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some((content_type, body)) = &self.body {
            builder = builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(body.clone());
        }
        builder
    }
}

fn map_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(error.to_string())
    }
}

impl TransportCall for ReqwestCall {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        self.body = Some((content_type.to_string(), body));
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn set_allow_retry_on_timeout(&mut self, allow: bool) {
        self.allow_retry_on_timeout = allow;
    }

    fn set_failure_callback(&mut self, callback: FailureCallback) {
        self.failure_callback = Some(callback);
    }

    fn perform(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let result = self.run().await;

            if let Err(error) = &result {
                if !error.is_cancellation() {
                    if let Some(callback) = &self.failure_callback {
                        callback(error.clone());
                    }
                }
            }
            result
        })
    }

    fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::debug!(uri = %self.uri, "Aborting call");
            // Stores a permit if no exchange is waiting yet
            self.abort_signal.notify_one();
        }
    }

    fn response_body_string(&self) -> Option<String> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn response_length(&self) -> Option<u64> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|bytes| bytes.len() as u64)
    }
}

impl fmt::Debug for ReqwestCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestCall")
            .field("uri", &self.uri)
            .field("method", &self.method)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
