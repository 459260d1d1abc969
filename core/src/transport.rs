//! Transport contract consumed by requests
//!
//! A [`Transport`] creates one [`TransportCall`] per request. The request
//! configures the call, drives it with [`TransportCall::perform`], and may abort
//! it from any thread. The call reports failures both as the result of
//! `perform` and through its failure callback, which can fire from a thread the
//! transport owns (for example on timeout).

use crate::error::TransportError;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Header carrying the active locale
pub const ACCEPT_LANGUAGE: &str = "Accept-Language";

/// Header carrying the API protocol version
pub const API_VERSION_HEADER: &str = "x-api-version";

/// Header carrying the bearer credential
pub const AUTHORIZATION: &str = "Authorization";

/// Callback invoked by a transport call when it fails
///
/// May be invoked from any thread, at any time while the call is in flight.
pub type FailureCallback = Arc<dyn Fn(TransportError) + Send + Sync>;

/// HTTP method of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    /// GET
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name as sent on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Factory for transport calls
pub trait Transport: Send + Sync {
    /// Create a call targeting `uri`
    fn create_call(&self, uri: &str) -> Box<dyn TransportCall>;
}

/// A single network exchange
///
/// Configuration methods take `&mut self` and are only used before the call is
/// shared. Everything after that (`perform`, `abort`, response accessors) takes
/// `&self` and must be safe to call concurrently.
pub trait TransportCall: Send + Sync {
    /// The URI this call targets
    fn uri(&self) -> &str;

    /// Set the HTTP method (GET unless set)
    fn set_method(&mut self, method: Method);

    /// Set the request body
    fn set_body(&mut self, content_type: &str, body: Vec<u8>);

    /// Add a request header
    fn add_header(&mut self, name: &str, value: &str);

    /// Allow or forbid the transport to retry on its own after a timeout
    fn set_allow_retry_on_timeout(&mut self, allow: bool);

    /// Install the callback used to report failures asynchronously
    fn set_failure_callback(&mut self, callback: FailureCallback);

    /// Run the exchange
    ///
    /// Resolves once the response has been received or the call failed.
    /// Resolves with [`TransportError::Aborted`] when the call was aborted.
    fn perform(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Abort the call. Best-effort and idempotent.
    fn abort(&self);

    /// The response body received so far, decoded as UTF-8
    fn response_body_string(&self) -> Option<String>;

    /// Size of the response body in bytes, if known
    fn response_length(&self) -> Option<u64>;
}
