//! Error types for the request lifecycle
//!
//! Every way a request can end badly is a [`RequestError`] delivered to the
//! failure listeners. Programmer errors (triggering success twice, rebinding a
//! request to another context) are not part of this taxonomy: they panic.

use serde::Deserialize;
use thiserror::Error;

/// Errors raised by a transport call
///
/// These are the raw, unclassified failures of the network exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The exchange did not finish within the transport's timeout
    #[error("Request timed out")]
    Timeout,

    /// The call was aborted before it finished
    #[error("Request was aborted")]
    Aborted,

    /// The server answered with a non-success status
    #[error("Request failed with status {status}: {reason}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Canonical reason phrase for the status
        reason: String,
    },

    /// Connecting or sending failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The response body could not be read
    #[error("Failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    /// Whether this error signals a cancellation rather than a fault
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Stable label for logs and metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::Status { .. } => "status",
            Self::Connection(_) => "connection",
            Self::Body(_) => "body",
        }
    }
}

/// Errors reported through a request's failure listeners
#[derive(Error, Debug)]
pub enum RequestError {
    /// `perform` was called before the request was attached to an API context
    #[error("Request is not attached to an API context")]
    NotBound,

    /// Network, timeout or protocol failure, surfaced unchanged
    #[error(transparent)]
    Transport(TransportError),

    /// A human-readable message recovered from the failure response body
    #[error("{message}")]
    Api {
        /// Message supplied by the server
        message: String,
        /// The failure the message was recovered from
        #[source]
        source: Box<RequestError>,
    },

    /// The request was cancelled
    #[error("Request was cancelled")]
    Cancelled,

    /// The call completed but produced no usable response value
    #[error("Request completed without a response")]
    MissingResponse,

    /// The response body could not be decoded into the expected type
    #[error("Failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
}

impl RequestError {
    /// Whether this error is a cancellation
    ///
    /// Cancellations skip response body inspection entirely.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Stable label for logs and metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotBound => "not_bound",
            Self::Transport(_) => "transport",
            Self::Api { .. } => "api",
            Self::Cancelled => "cancelled",
            Self::MissingResponse => "missing_response",
            Self::Decode(_) => "decode",
        }
    }
}

impl From<TransportError> for RequestError {
    fn from(error: TransportError) -> Self {
        if error.is_cancellation() {
            Self::Cancelled
        } else {
            Self::Transport(error)
        }
    }
}

/// Marker whose presence makes a response body worth decoding as an error.
const ERROR_MARKER: &str = "\"error\"";

/// Error message carried in a failure response body
///
/// Wire shape: a JSON object with at least an `error` string field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DisplayableError {
    /// Human-readable message
    #[serde(rename = "error")]
    pub message: String,
}

impl DisplayableError {
    /// Try to recover an error message from a response body
    ///
    /// Bodies that do not contain the `"error"` marker are not parsed at all.
    /// Malformed bodies yield `None`.
    #[must_use]
    pub fn sniff(body: &str) -> Option<Self> {
        if !body.contains(ERROR_MARKER) {
            return None;
        }

        match serde_json::from_str(body) {
            Ok(error) => Some(error),
            Err(e) => {
                tracing::trace!(error = %e, "Error body did not decode, keeping original error");
                None
            }
        }
    }
}

/// Enrich a failure with the server's message, if the body carries one.
pub(crate) fn classify(cause: RequestError, body: Option<&str>) -> RequestError {
    match body.and_then(DisplayableError::sniff) {
        Some(DisplayableError { message }) => RequestError::Api {
            message,
            source: Box::new(cause),
        },
        None => cause,
    }
}
