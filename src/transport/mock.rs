//! A scripted transport for testing without a network.
//!
//! `MockTransport` replays a queue of stubbed exchanges in order, records
//! every request it receives, and counts invocations — which is exactly what
//! the coalescing and staleness properties need ("exactly one exchange
//! happened"). Stubs are built fluently:
//!
//! ```ignore
//! let mock = MockTransport::new();
//! mock.respond().json_body(r#"{"name":"Ann"}"#).header("ETag", "\"v1\"").queue();
//! mock.respond().status(304).queue();
//! mock.fail(TransportError::Timeout);
//!
//! let service = Service::new(config, mock.clone())?;
//! // ... exercise the service ...
//! assert_eq!(mock.hits(), 3);
//! mock.verify();
//! ```
//!
//! A stub queued with [`ResponseStub::hold`] does not answer until the
//! returned [`ReleaseGate`] is released, letting tests keep an exchange
//! in flight deliberately.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::TransportError;
use crate::transport::{Transport, TransportRequest, TransportResponse};

struct Exchange {
    result: Result<TransportResponse, TransportError>,
    gate: Option<Arc<Semaphore>>,
}

#[derive(Default)]
struct MockState {
    queue: VecDeque<Exchange>,
    recorded: Vec<TransportRequest>,
    hits: usize,
}

/// Scripted [`Transport`] with expectation tracking. Clones share state, so
/// tests keep a clone while the service owns the original.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Starts a fluent response stub (status 200, no headers, empty body).
    pub fn respond(&self) -> ResponseStub {
        ResponseStub {
            transport: self.clone(),
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Queues a transport-level failure.
    pub fn fail(&self, error: TransportError) {
        self.lock().queue.push_back(Exchange {
            result: Err(error),
            gate: None,
        });
    }

    /// How many times `perform` was invoked.
    pub fn hits(&self) -> usize {
        self.lock().hits
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.lock().recorded.clone()
    }

    /// The most recent request.
    pub fn last_request(&self) -> Option<TransportRequest> {
        self.lock().recorded.last().cloned()
    }

    /// Panics if queued stubs were never consumed.
    pub fn verify(&self) {
        let remaining = self.lock().queue.len();
        if remaining > 0 {
            panic!("MockTransport: {remaining} stubbed exchange(s) never consumed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, result: Result<TransportResponse, TransportError>, gate: Option<Arc<Semaphore>>) {
        self.lock().queue.push_back(Exchange { result, gate });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn perform(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let exchange = {
            let mut state = self.lock();
            state.hits += 1;
            state.recorded.push(request.clone());
            state.queue.pop_front().unwrap_or_else(|| {
                panic!(
                    "MockTransport: no stubbed exchange for {} {}",
                    request.method, request.url
                )
            })
        };
        if let Some(gate) = exchange.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        exchange.result
    }
}

/// Fluent builder for one stubbed response.
pub struct ResponseStub {
    transport: MockTransport,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseStub {
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body and the matching content type.
    pub fn json_body(self, json: &str) -> Self {
        self.header("Content-Type", "application/json").body(json.as_bytes().to_vec())
    }

    /// Sets a plain-text body and the matching content type.
    pub fn text_body(self, text: &str) -> Self {
        self.header("Content-Type", "text/plain").body(text.as_bytes().to_vec())
    }

    /// Queues the stub; it answers as soon as it is reached.
    pub fn queue(self) {
        let response = TransportResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        };
        self.transport.push(Ok(response), None);
    }

    /// Queues the stub gated: `perform` blocks on it until the returned
    /// [`ReleaseGate`] is released. The invocation still counts as a hit
    /// immediately, so coalescing assertions work while it is held.
    pub fn hold(self) -> ReleaseGate {
        let gate = Arc::new(Semaphore::new(0));
        let response = TransportResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        };
        self.transport.push(Ok(response), Some(gate.clone()));
        ReleaseGate { gate }
    }
}

/// Opens a held exchange. Dropping the gate without releasing leaves the
/// exchange blocked forever.
pub struct ReleaseGate {
    gate: Arc<Semaphore>,
}

impl ReleaseGate {
    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Method;
    use url::Url;

    fn get(url: &str) -> TransportRequest {
        TransportRequest {
            method: Method::Get,
            url: Url::parse(url).unwrap(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[tokio::test]
    async fn stubs_replay_in_order_and_record_requests() {
        let mock = MockTransport::new();
        mock.respond().json_body(r#"{"n":1}"#).queue();
        mock.respond().status(500).body("boom").queue();

        let first = mock.perform(get("http://t/a")).await.unwrap();
        assert_eq!(first.status, 200);
        assert_eq!(first.header("content-type"), Some("application/json"));

        let second = mock.perform(get("http://t/b")).await.unwrap();
        assert_eq!(second.status, 500);

        assert_eq!(mock.hits(), 2);
        let urls: Vec<_> = mock.requests().iter().map(|r| r.url.to_string()).collect();
        assert_eq!(urls, vec!["http://t/a", "http://t/b"]);
        mock.verify();
    }

    #[tokio::test]
    async fn failures_surface_as_transport_errors() {
        let mock = MockTransport::new();
        mock.fail(TransportError::Timeout);
        let err = mock.perform(get("http://t/a")).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn held_stub_blocks_until_released() {
        let mock = MockTransport::new();
        let gate = mock.respond().text_body("late").hold();

        let pending = {
            let mock = mock.clone();
            tokio::spawn(async move { mock.perform(get("http://t/slow")).await })
        };

        // The exchange is underway but not answered.
        tokio::task::yield_now().await;
        assert_eq!(mock.hits(), 1);
        assert!(!pending.is_finished());

        gate.release();
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.body, b"late");
    }

    #[tokio::test]
    #[should_panic(expected = "never consumed")]
    async fn verify_panics_on_unconsumed_stub() {
        let mock = MockTransport::new();
        mock.respond().queue();
        mock.verify();
    }
}
