//! The transport adapter boundary.
//!
//! The core never performs I/O itself. It hands a [`TransportRequest`] to a
//! [`Transport`] implementation and classifies whatever comes back. Anything
//! that can run an HTTP-like exchange can sit behind this trait:
//!
//! - [`http::HttpTransport`] — the default reqwest-backed adapter
//!   (feature `http`).
//! - [`mock::MockTransport`] — a scripted adapter for tests.
//!
//! Adapters report only connectivity-level failures as errors; a non-success
//! status is still a [`TransportResponse`] and is classified by the runtime.

use async_trait::async_trait;
use url::Url;

use crate::error::TransportError;

pub mod mock;

#[cfg(feature = "http")]
pub mod http;

/// HTTP method for a transport exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing exchange, fully resolved by the runtime (conditional
/// validators already injected into `headers`).
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    /// Header name/value pairs, in send order.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl TransportRequest {
    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The raw result of an exchange, before classification.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Header name/value pairs as received.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An adapter capable of performing HTTP-like exchanges.
///
/// Implementations must be callable from any task; the runtime invokes
/// `perform` from spawned background tasks, never from the serialized
/// state-owning task itself.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Runs one exchange to completion.
    ///
    /// # Errors
    ///
    /// Only connectivity-level failures (timeout, connection, malformed
    /// request). Status codes, including 4xx/5xx/304, are returned as
    /// responses.
    async fn perform(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}
