//! Per-call capabilities plugged into the request state machine
//!
//! An [`Endpoint`] describes one remote operation: where it lives, how the
//! transport call is prepared, and how a response value is extracted once the
//! exchange has completed. The state machine in [`crate::request`] is generic
//! over it, so typed and untyped requests share one implementation.

use crate::error::RequestError;
use crate::transport::{Method, TransportCall};
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// One remote operation
pub trait Endpoint: Send + Sync + 'static {
    /// Value produced by a successful call
    type Response: Send + Sync + 'static;

    /// Target of the call, relative to the context endpoint or absolute
    fn target(&self) -> String;

    /// HTTP method of the call
    fn method(&self) -> Method {
        Method::Get
    }

    /// Full URI of the call for the given base URL
    fn uri(&self, base: &str) -> String {
        join_uri(base, &self.target())
    }

    /// Hook to set a body or extra headers before the standard headers are attached
    fn prepare(&self, _call: &mut dyn TransportCall) {}

    /// Extract the response value from a completed call
    ///
    /// `Ok(None)` means the call completed without a usable value, which fails
    /// the request with [`RequestError::MissingResponse`].
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be turned into a value.
    fn post_process(
        &self,
        call: &dyn TransportCall,
    ) -> Result<Option<Self::Response>, RequestError>;
}

/// Join a base URL and a target, leaving absolute targets untouched
#[must_use]
pub fn join_uri(base: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }

    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        target.trim_start_matches('/')
    )
}

/// Untyped endpoint: success carries no payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    target: String,
    method: Method,
}

impl Path {
    /// GET `target`
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: Method::Get,
        }
    }

    /// Use `method` instead of GET
    #[must_use]
    pub const fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

impl Endpoint for Path {
    type Response = ();

    fn target(&self) -> String {
        self.target.clone()
    }

    fn method(&self) -> Method {
        self.method
    }

    fn post_process(&self, _call: &dyn TransportCall) -> Result<Option<()>, RequestError> {
        Ok(Some(()))
    }
}

/// Typed endpoint: success carries a value decoded from the JSON body
pub struct Json<T> {
    target: String,
    method: Method,
    body: Option<Vec<u8>>,
    _response: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    /// GET `target` and decode the body as `T`
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: Method::Get,
            body: None,
            _response: PhantomData,
        }
    }

    /// Use `method` instead of GET
    #[must_use]
    pub const fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Send `body` as a JSON request body
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Decode`] if `body` cannot be serialized.
    pub fn with_json_body<B: serde::Serialize>(mut self, body: &B) -> Result<Self, RequestError> {
        self.body = Some(serde_json::to_vec(body).map_err(RequestError::Decode)?);
        Ok(self)
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Json")
            .field("target", &self.target)
            .field("method", &self.method)
            .field("response", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

impl<T> Endpoint for Json<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Response = T;

    fn target(&self) -> String {
        self.target.clone()
    }

    fn method(&self) -> Method {
        self.method
    }

    fn prepare(&self, call: &mut dyn TransportCall) {
        if let Some(body) = &self.body {
            call.set_body("application/json", body.clone());
        }
    }

    fn post_process(&self, call: &dyn TransportCall) -> Result<Option<T>, RequestError> {
        decode_json(call)
    }
}

/// Decode the body of a completed call as JSON
///
/// An absent or blank body, or a literal `null`, yields `Ok(None)`.
///
/// # Errors
///
/// Returns [`RequestError::Decode`] if the body is not valid JSON for `T`.
pub fn decode_json<T: DeserializeOwned>(
    call: &dyn TransportCall,
) -> Result<Option<T>, RequestError> {
    tracing::debug!(
        uri = call.uri(),
        bytes = call.response_length().unwrap_or(0),
        "Response received"
    );

    let Some(body) = call.response_body_string() else {
        return Ok(None);
    };
    if body.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str::<Option<T>>(&body).map_err(RequestError::Decode)
}
