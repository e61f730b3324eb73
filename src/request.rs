//! The `Request`: one in-flight or completed network operation.
//!
//! A request moves `pending → {succeeded, failed, cancelled}` exactly once;
//! terminal states are final. Completion can be consumed two ways:
//!
//! - await [`Request::completion`] from any task (a `tokio::watch` under the
//!   hood, so late awaiters resolve immediately), or
//! - register [`Request::on_success`] / [`Request::on_failure`] /
//!   [`Request::on_completion`] callbacks. Callbacks fire in registration
//!   order on the runtime task; registering after completion fires the
//!   callback immediately, once.
//!
//! Cancellation is a pure drop of the result: a cancelled request never
//! mutates resource state and fires no callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, watch};
use url::Url;

use crate::error::{ResourceError, ServiceError};
use crate::resource::{Resource, ResourceData};
use crate::runtime::Command;
use crate::transport::Method;

pub(crate) type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Coarse lifecycle phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal result of a request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// A fresh payload arrived and passed the transformer pipeline.
    NewData(Arc<ResourceData>),
    /// The server confirmed the cached payload; carries the refreshed copy.
    NotModified(Arc<ResourceData>),
    /// Transport, server, or parse failure.
    Failed(Arc<ResourceError>),
    /// The request was cancelled; its result was dropped.
    Cancelled,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::NewData(_) | RequestOutcome::NotModified(_))
    }

    /// The payload, for successful outcomes.
    pub fn data(&self) -> Option<&Arc<ResourceData>> {
        match self {
            RequestOutcome::NewData(data) | RequestOutcome::NotModified(data) => Some(data),
            _ => None,
        }
    }

    /// The error, for failed outcomes.
    pub fn error(&self) -> Option<&Arc<ResourceError>> {
        match self {
            RequestOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

enum Callback {
    Success(Box<dyn FnOnce(&Arc<ResourceData>) + Send>),
    Failure(Box<dyn FnOnce(&Arc<ResourceError>) + Send>),
    Completion(Box<dyn FnOnce(&RequestOutcome) + Send>),
}

impl Callback {
    fn fire(self, outcome: &RequestOutcome) {
        match (self, outcome) {
            (Callback::Success(f), RequestOutcome::NewData(data))
            | (Callback::Success(f), RequestOutcome::NotModified(data)) => f(data),
            (Callback::Failure(f), RequestOutcome::Failed(error)) => f(error),
            (Callback::Completion(f), RequestOutcome::Cancelled) => {
                // Cancellation drops the result; nothing fires.
                drop(f);
            }
            (Callback::Completion(f), outcome) => f(outcome),
            _ => {}
        }
    }
}

struct RequestShared {
    id: RequestId,
    method: Method,
    url: Url,
    resource: Resource,
    outcome_tx: watch::Sender<Option<RequestOutcome>>,
    outcome_rx: watch::Receiver<Option<RequestOutcome>>,
    callbacks: Mutex<Vec<Callback>>,
}

/// Handle to one network operation. Clones share the same underlying
/// request; [`Request::ptr_eq`] tests identity (the coalescing contract is
/// expressed in terms of it).
#[derive(Clone)]
pub struct Request {
    shared: Arc<RequestShared>,
}

impl Request {
    pub(crate) fn new(resource: Resource, method: Method) -> Self {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let url = resource.url().clone();
        Request {
            shared: Arc::new(RequestShared {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                method,
                url,
                resource,
                outcome_tx,
                outcome_rx,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.shared.id
    }

    pub fn method(&self) -> Method {
        self.shared.method
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub(crate) fn resource(&self) -> &Resource {
        &self.shared.resource
    }

    /// Whether two handles refer to the same request.
    pub fn ptr_eq(a: &Request, b: &Request) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Current phase, without blocking.
    pub fn phase(&self) -> RequestPhase {
        match &*self.shared.outcome_rx.borrow() {
            None => RequestPhase::Pending,
            Some(RequestOutcome::NewData(_)) | Some(RequestOutcome::NotModified(_)) => {
                RequestPhase::Succeeded
            }
            Some(RequestOutcome::Failed(_)) => RequestPhase::Failed,
            Some(RequestOutcome::Cancelled) => RequestPhase::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase() != RequestPhase::Pending
    }

    /// Waits for the terminal outcome. Resolves immediately if the request
    /// already completed. A request orphaned by a shut-down runtime resolves
    /// as [`RequestOutcome::Cancelled`].
    pub async fn completion(&self) -> RequestOutcome {
        let mut rx = self.shared.outcome_rx.clone();
        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(RequestOutcome::Cancelled)
    }

    /// Registers a callback for successful completion (new data or
    /// not-modified). Never fires for failures or cancellation.
    pub fn on_success(&self, f: impl FnOnce(&Arc<ResourceData>) + Send + 'static) {
        self.register(Callback::Success(Box::new(f)));
    }

    /// Registers a callback for failed completion. Never fires for successes
    /// or cancellation.
    pub fn on_failure(&self, f: impl FnOnce(&Arc<ResourceError>) + Send + 'static) {
        self.register(Callback::Failure(Box::new(f)));
    }

    /// Registers a callback for any non-cancelled terminal outcome.
    pub fn on_completion(&self, f: impl FnOnce(&RequestOutcome) + Send + 'static) {
        self.register(Callback::Completion(Box::new(f)));
    }

    /// Requests cancellation and waits until the runtime has taken it into
    /// account: afterwards the resource's `loading` flag reflects the drop
    /// and no state mutation or notification can result from this request.
    ///
    /// Cancellation is cooperative. If the exchange already completed and
    /// re-entered the runtime first, the completed outcome stands (terminal
    /// states are final) — but a completion processed *after* the
    /// cancellation is discarded. No `Error` notification is synthesized
    /// either way.
    pub async fn cancel(&self) -> Result<(), ServiceError> {
        let (respond_to, response) = oneshot::channel();
        self.shared
            .resource
            .send(Command::Cancel {
                request: self.clone(),
                respond_to,
            })
            .await?;
        response.await.map_err(|_| ServiceError::Dropped)
    }

    /// Runtime-only: moves the request to a terminal state and fires
    /// callbacks in registration order. Later calls are ignored.
    pub(crate) fn resolve(&self, outcome: RequestOutcome) {
        let callbacks = {
            let mut callbacks = self.lock_callbacks();
            if self.shared.outcome_rx.borrow().is_some() {
                return;
            }
            let _ = self.shared.outcome_tx.send(Some(outcome.clone()));
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback.fire(&outcome);
        }
    }

    fn register(&self, callback: Callback) {
        let mut callbacks = self.lock_callbacks();
        // Late registration: fire immediately against the settled outcome.
        if let Some(outcome) = &*self.shared.outcome_rx.borrow() {
            drop(callbacks);
            callback.fire(outcome);
            return;
        }
        callbacks.push(callback);
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<Callback>> {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method)
            .field("url", &self.shared.url.as_str())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Content;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Weak;

    fn detached_resource() -> Resource {
        let (sender, _receiver) = tokio::sync::mpsc::channel(1);
        let url = Url::parse("http://example.test/items").unwrap();
        // Receiver is dropped; sends fail with ServiceError::Closed, which is
        // fine for request-local tests.
        Resource::new(url, sender, Weak::new())
    }

    fn sample_data() -> Arc<ResourceData> {
        Arc::new(ResourceData::local(Content::text("payload")))
    }

    #[tokio::test]
    async fn completion_resolves_for_early_and_late_awaiters() {
        let request = Request::new(detached_resource(), Method::Get);
        let early = {
            let request = request.clone();
            tokio::spawn(async move { request.completion().await })
        };

        request.resolve(RequestOutcome::NewData(sample_data()));

        assert!(early.await.unwrap().is_success());
        // Late awaiter sees the settled outcome immediately.
        assert!(request.completion().await.is_success());
        assert_eq!(request.phase(), RequestPhase::Succeeded);
    }

    #[tokio::test]
    async fn callbacks_fire_in_registration_order() {
        let request = Request::new(detached_resource(), Method::Get);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            request.on_success(move |_| order.lock().unwrap().push(tag));
        }
        request.resolve(RequestOutcome::NewData(sample_data()));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn late_callback_fires_immediately_and_once() {
        let request = Request::new(detached_resource(), Method::Get);
        request.resolve(RequestOutcome::NewData(sample_data()));

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        request.on_success(move |_| {
            counted.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_routes_to_failure_and_completion_callbacks_only() {
        let request = Request::new(detached_resource(), Method::Get);
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        request.on_success(move |_| l.lock().unwrap().push("success"));
        let l = log.clone();
        request.on_failure(move |_| l.lock().unwrap().push("failure"));
        let l = log.clone();
        request.on_completion(move |_| l.lock().unwrap().push("completion"));

        request.resolve(RequestOutcome::Failed(Arc::new(ResourceError::server(
            500,
            Vec::new(),
        ))));

        assert_eq!(*log.lock().unwrap(), vec!["failure", "completion"]);
        assert_eq!(request.phase(), RequestPhase::Failed);
    }

    #[tokio::test]
    async fn cancellation_fires_no_callbacks() {
        let request = Request::new(detached_resource(), Method::Get);
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let fired = fired.clone();
            request.on_completion(move |_| {
                fired.fetch_add(1, AtomicOrdering::SeqCst);
            });
        }
        let f = fired.clone();
        request.on_success(move |_| {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });

        request.resolve(RequestOutcome::Cancelled);

        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(request.phase(), RequestPhase::Cancelled);
        assert!(matches!(request.completion().await, RequestOutcome::Cancelled));
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let request = Request::new(detached_resource(), Method::Get);
        request.resolve(RequestOutcome::NewData(sample_data()));
        // A later resolution attempt is ignored.
        request.resolve(RequestOutcome::Cancelled);
        assert_eq!(request.phase(), RequestPhase::Succeeded);
    }
}
