//! The `Resource`: a URL-identified unit of observable server state.
//!
//! A resource answers three questions at any moment, synchronously, from any
//! thread: what is the latest known data ([`Resource::latest_data`]), is
//! there an error ([`Resource::latest_error`]), is a fetch in flight
//! ([`Resource::is_loading`]). The answers come from an immutable
//! [`ResourceState`] snapshot that the service runtime replaces atomically
//! on every transition; snapshots are never mutated in place.
//!
//! All state-changing operations (`load_if_needed`, `load`, `wipe`,
//! observer registration, ...) are commands sent to the runtime task and are
//! therefore strictly serialized per service. Handles are cheap clones; two
//! handles obtained from the same [`Service`](crate::Service) for the same
//! canonical URL are the *same* resource ([`Resource::ptr_eq`]).

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::{ResourceError, ServiceError};
use crate::observer::{ObserverBinding, ObserverId, ResourceObserver};
use crate::pipeline::{Content, ContentValue, TransformerChain};
use crate::request::Request;
use crate::runtime::Command;
use crate::service::ServiceShared;
use crate::transport::Method;

/// Why a notification fired. Annotation only: observers may ignore the event
/// and re-read the resource's state idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    /// A new request was issued for this resource.
    Requested,
    /// A response body arrived and replaced the latest data.
    NewDataFromServer,
    /// The latest data changed without a network exchange (local override,
    /// or the initial ping to a new observer with cached data).
    NewDataFromCache,
    /// The server confirmed the cached payload is still current; only the
    /// timestamp and validators were refreshed.
    NotModified,
    /// A request failed and the error slot was set.
    Error,
    /// Local wipe: data and error were dropped without a network call.
    Cleared,
}

/// The latest successfully loaded payload, plus the validators needed for
/// conditional revalidation. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct ResourceData {
    /// Pipeline output.
    pub content: Content,
    /// `ETag` response header, echoed back as `If-None-Match`.
    pub etag: Option<String>,
    /// `Last-Modified` response header, echoed back as `If-Modified-Since`.
    pub last_modified: Option<String>,
    /// When this payload was received (or last revalidated).
    pub received_at: SystemTime,
}

impl ResourceData {
    /// Builds local data with no validators, timestamped now.
    pub fn local(content: Content) -> Self {
        ResourceData {
            content,
            etag: None,
            last_modified: None,
            received_at: SystemTime::now(),
        }
    }

    /// The parsed JSON document, if the pipeline produced one.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.content.value.as_json()
    }

    /// The decoded text, if the pipeline produced text.
    pub fn text(&self) -> Option<&str> {
        self.content.value.as_text()
    }

    /// The raw bytes, if the pipeline left the body undecoded.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.content.value.as_bytes()
    }

    /// Deserializes the content into a domain type via serde.
    pub fn typed<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::error::TransformError> {
        use crate::error::TransformError;
        match &self.content.value {
            ContentValue::Json(value) => serde_json::from_value(value.clone())
                .map_err(|e| TransformError::InvalidJson(e.to_string())),
            ContentValue::Text(text) => {
                serde_json::from_str(text).map_err(|e| TransformError::InvalidJson(e.to_string()))
            }
            ContentValue::Bytes(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| TransformError::InvalidJson(e.to_string()))
            }
        }
    }
}

/// One immutable snapshot of a resource's observable state.
///
/// `data` and `error` are independent: both, either, or neither may be
/// present. A resource with usable-but-stale data *and* a fresh error is a
/// normal situation (stale-while-error), and presentation precedence is the
/// consumer's decision.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    /// Latest successful payload, if any.
    pub data: Option<Arc<ResourceData>>,
    /// Latest failure, if any. Cleared only by a subsequent success.
    pub error: Option<Arc<ResourceError>>,
    /// True iff at least one request is in flight for this resource.
    pub loading: bool,
    /// `received_at + staleness`; `None` when there is no data.
    pub expires_at: Option<SystemTime>,
}

impl ResourceState {
    /// Whether the cached data is present and still within the staleness
    /// window at `now`.
    pub fn is_up_to_date(&self, now: SystemTime) -> bool {
        match (&self.data, self.expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }

    /// Opposite of [`ResourceState::is_up_to_date`].
    pub fn is_stale(&self, now: SystemTime) -> bool {
        !self.is_up_to_date(now)
    }
}

pub(crate) struct ResourceCell {
    url: Url,
    sender: mpsc::Sender<Command>,
    state: ArcSwap<ResourceState>,
    service: Weak<ServiceShared>,
}

/// Handle to one URL-identified resource.
///
/// Clones are cheap and all refer to the same underlying state; use
/// [`Resource::ptr_eq`] for identity checks.
#[derive(Clone)]
pub struct Resource {
    cell: Arc<ResourceCell>,
}

impl Resource {
    pub(crate) fn new(url: Url, sender: mpsc::Sender<Command>, service: Weak<ServiceShared>) -> Self {
        Resource {
            cell: Arc::new(ResourceCell {
                url,
                sender,
                state: ArcSwap::from_pointee(ResourceState::default()),
                service,
            }),
        }
    }

    /// The canonical URL identifying this resource.
    pub fn url(&self) -> &Url {
        &self.cell.url
    }

    /// Whether two handles refer to the same resource instance.
    pub fn ptr_eq(a: &Resource, b: &Resource) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    /// The current state snapshot.
    pub fn snapshot(&self) -> Arc<ResourceState> {
        self.cell.state.load_full()
    }

    /// Latest successful payload, if any.
    pub fn latest_data(&self) -> Option<Arc<ResourceData>> {
        self.snapshot().data.clone()
    }

    /// Latest failure, if any.
    pub fn latest_error(&self) -> Option<Arc<ResourceError>> {
        self.snapshot().error.clone()
    }

    /// True iff at least one request is in flight.
    pub fn is_loading(&self) -> bool {
        self.snapshot().loading
    }

    /// Whether cached data exists and is still fresh right now.
    pub fn is_up_to_date(&self) -> bool {
        self.snapshot().is_up_to_date(SystemTime::now())
    }

    /// The sibling resource for `self`'s URL extended with `/segment`.
    ///
    /// Resolves through the owning service's registry, so
    /// `service.resource("a")?.child("b")?` and `service.resource("a/b")?`
    /// are the identical instance.
    pub fn child(&self, segment: &str) -> Result<Resource, ServiceError> {
        let service = self.cell.service.upgrade().ok_or(ServiceError::Closed)?;
        service.child_of(&self.cell.url, segment)
    }

    /// Ensures this resource is populated, without spamming the network.
    ///
    /// - A request already in flight: returns that same [`Request`]
    ///   (coalescing — arbitrarily many redundant calls collapse onto one
    ///   exchange).
    /// - Data present and fresh: returns `None`; no network call happens.
    /// - Otherwise: issues a GET, flips `loading`, notifies observers with
    ///   [`ResourceEvent::Requested`], and returns the new request.
    ///
    /// Cheap and idempotent; safe to call on every UI-visibility event.
    pub async fn load_if_needed(&self) -> Result<Option<Request>, ServiceError> {
        self.call(|respond_to| Command::LoadIfNeeded {
            resource: self.clone(),
            respond_to,
        })
        .await
    }

    /// Forces a refresh regardless of staleness (pull-to-refresh).
    ///
    /// Still coalesces onto an already-in-flight load rather than firing a
    /// second identical exchange.
    pub async fn load(&self) -> Result<Request, ServiceError> {
        self.call(|respond_to| Command::Load {
            resource: self.clone(),
            respond_to,
        })
        .await
    }

    /// Issues an ad-hoc exchange (POST/PUT/PATCH/DELETE/extra GET).
    ///
    /// The request contributes to `loading` but never replaces
    /// `latest_data`/`latest_error`; inspect its outcome directly.
    pub async fn request(
        &self,
        method: Method,
        body: Option<Vec<u8>>,
    ) -> Result<Request, ServiceError> {
        self.call(|respond_to| Command::Issue {
            resource: self.clone(),
            method,
            body,
            respond_to,
        })
        .await
    }

    /// Drops data and error locally (logout, invalidation) and notifies
    /// observers with [`ResourceEvent::Cleared`]. In-flight requests are
    /// cancelled; no network call is made.
    pub async fn wipe(&self) -> Result<(), ServiceError> {
        self.call(|respond_to| Command::Wipe {
            resource: self.clone(),
            respond_to,
        })
        .await
    }

    /// Replaces the latest data with locally produced content, notifying
    /// observers with [`ResourceEvent::NewDataFromCache`]. No network call.
    pub async fn override_data(&self, content: Content) -> Result<(), ServiceError> {
        self.call(|respond_to| Command::OverrideData {
            resource: self.clone(),
            content,
            respond_to,
        })
        .await
    }

    /// Overrides the service-wide staleness window for this resource.
    pub async fn set_staleness(&self, staleness: Duration) -> Result<(), ServiceError> {
        self.send(Command::SetStaleness {
            resource: self.clone(),
            staleness,
        })
        .await
    }

    /// Overrides the service-wide transformer chain for this resource.
    pub async fn set_transformers(&self, chain: TransformerChain) -> Result<(), ServiceError> {
        self.send(Command::SetTransformers {
            resource: self.clone(),
            chain,
        })
        .await
    }

    /// Registers a strongly held observer.
    ///
    /// The new observer is pinged once, immediately, with the current state
    /// — even if nothing changed — so "populate UI on screen open" needs no
    /// first-load special case. Returns the id used for removal.
    pub async fn add_observer(
        &self,
        observer: Arc<dyn ResourceObserver>,
    ) -> Result<ObserverId, ServiceError> {
        self.add_binding(ObserverBinding::Strong(observer), None).await
    }

    /// Registers a weakly held observer: the resource never extends the
    /// observer's lifetime, and a deallocated observer is pruned silently on
    /// the next dispatch.
    pub async fn add_observer_weak<O>(&self, observer: &Arc<O>) -> Result<ObserverId, ServiceError>
    where
        O: ResourceObserver + 'static,
    {
        let weak = Arc::downgrade(observer) as Weak<dyn ResourceObserver>;
        self.add_binding(ObserverBinding::Weak(weak), None).await
    }

    /// Registers a closure observer.
    pub async fn add_observer_fn<F>(&self, f: F) -> Result<ObserverId, ServiceError>
    where
        F: Fn(&Resource, ResourceEvent) + Send + 'static,
    {
        self.add_binding(ObserverBinding::Closure(Box::new(f)), None).await
    }

    /// Registers a strongly held observer that only receives events passing
    /// `filter`. The initial ping bypasses the filter.
    pub async fn add_observer_filtered<F>(
        &self,
        observer: Arc<dyn ResourceObserver>,
        filter: F,
    ) -> Result<ObserverId, ServiceError>
    where
        F: Fn(ResourceEvent) -> bool + Send + 'static,
    {
        self.add_binding(ObserverBinding::Strong(observer), Some(Box::new(filter)))
            .await
    }

    /// Unregisters an observer. Idempotent: unknown or already-removed ids
    /// are ignored.
    pub async fn remove_observer(&self, id: ObserverId) -> Result<(), ServiceError> {
        self.send(Command::RemoveObserver {
            resource: self.clone(),
            id,
        })
        .await
    }

    async fn add_binding(
        &self,
        binding: ObserverBinding,
        filter: Option<Box<dyn Fn(ResourceEvent) -> bool + Send>>,
    ) -> Result<ObserverId, ServiceError> {
        self.call(|respond_to| Command::AddObserver {
            resource: self.clone(),
            binding,
            filter,
            respond_to,
        })
        .await
    }

    /// Runtime-only: publishes the next state snapshot.
    pub(crate) fn publish_state(&self, state: ResourceState) {
        self.cell.state.store(Arc::new(state));
    }

    pub(crate) async fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.cell
            .sender
            .send(command)
            .await
            .map_err(|_| ServiceError::Closed)
    }

    pub(crate) async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ServiceError> {
        let (respond_to, response) = oneshot::channel();
        self.send(make(respond_to)).await?;
        response.await.map_err(|_| ServiceError::Dropped)
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("Resource")
            .field("url", &self.cell.url.as_str())
            .field("has_data", &state.data.is_some())
            .field("has_error", &state.error.is_some())
            .field("loading", &state.loading)
            .finish()
    }
}
