//! Error types for the resource system.
//!
//! Three kinds of failure can end up in [`ResourceError`]: the transport
//! could not complete the exchange ([`TransportError`]), the server answered
//! with a non-success status ([`ErrorKind::Server`]), or the transformer
//! chain rejected the body ([`TransformError`]). Cancellation is deliberately
//! *not* an error: a cancelled request drops its result and never reaches
//! observers.
//!
//! [`ServiceError`] is the separate family of handle-side failures (closed
//! runtime, bad paths) and never appears in a resource's error slot.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

/// Errors returned by handle operations on [`Service`](crate::Service),
/// [`Resource`](crate::Resource) and [`Request`](crate::Request).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// The service runtime task has exited; no further operations are possible.
    #[error("service runtime closed")]
    Closed,

    /// The runtime dropped the response channel mid-operation.
    #[error("service runtime dropped response channel")]
    Dropped,

    /// The given path could not be resolved against the service base URL.
    #[error("invalid resource path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// The runtime task panicked or was aborted during shutdown.
    #[error("service runtime task failed: {0}")]
    RuntimeFailed(String),
}

/// Failures reported by a [`Transport`](crate::transport::Transport) adapter.
///
/// These cover connectivity-level problems only. Non-success HTTP statuses
/// are *not* transport errors; the adapter returns them as ordinary
/// responses and the runtime classifies them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The exchange did not complete within the transport's time budget.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure (DNS, refused, reset, TLS, ...).
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be constructed or sent at all.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Failures produced by the transformer pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    /// No transformer accepted the response's content type.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// The body claimed to be JSON but did not parse.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The body could not be decoded as text.
    #[error("invalid text encoding: {0}")]
    InvalidEncoding(String),

    /// A custom transformer rejected the content.
    #[error("transform failed: {0}")]
    Custom(String),
}

/// Classification of a [`ResourceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport adapter failed before a response arrived.
    Transport,
    /// The server answered with a non-success status.
    Server { status: u16 },
    /// The transformer chain could not decode the response body.
    Parse,
}

/// The error slot of a resource: what went wrong the last time a request
/// failed.
///
/// A `ResourceError` never evicts previously loaded data; the resource keeps
/// serving its stale payload until a later request succeeds. The slot is
/// cleared only by a successful response, never by a newer error.
#[derive(Debug, Clone)]
pub struct ResourceError {
    /// Broad classification, usable for presentation decisions.
    pub kind: ErrorKind,
    /// User-facing message. Kind-specific default, overridable with
    /// [`ResourceError::with_message`].
    pub message: String,
    /// The underlying cause, when one exists.
    pub cause: Option<Arc<dyn Error + Send + Sync>>,
    /// Raw response body for server errors, for diagnostics.
    pub raw_body: Option<Vec<u8>>,
    /// When the failure was recorded.
    pub timestamp: SystemTime,
}

impl ResourceError {
    /// Wraps a transport-level failure.
    pub fn transport(cause: TransportError) -> Self {
        ResourceError {
            kind: ErrorKind::Transport,
            message: "Unable to contact the server".to_string(),
            cause: Some(Arc::new(cause)),
            raw_body: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Wraps a non-success HTTP status, keeping the raw body around.
    pub fn server(status: u16, raw_body: Vec<u8>) -> Self {
        let message = if (400..500).contains(&status) {
            format!("The request failed ({status})")
        } else {
            format!("The server had a problem ({status})")
        };
        ResourceError {
            kind: ErrorKind::Server { status },
            message,
            cause: None,
            raw_body: Some(raw_body),
            timestamp: SystemTime::now(),
        }
    }

    /// Wraps a transformer chain failure.
    pub fn parse(cause: TransformError) -> Self {
        ResourceError {
            kind: ErrorKind::Parse,
            message: "Unable to understand the server's response".to_string(),
            cause: Some(Arc::new(cause)),
            raw_body: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Replaces the default user-facing message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Status code, for server errors.
    pub fn status(&self) -> Option<u16> {
        match self.kind {
            ErrorKind::Server { status } => Some(status),
            _ => None,
        }
    }
}

impl Display for ResourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ResourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn Error + 'static))
    }
}
