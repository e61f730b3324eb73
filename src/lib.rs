//! # Remote Resource
//!
//! Observable client-side state for remotely fetched resources.
//!
//! A [`Service`] maps URLs to [`Resource`]s: passive state containers that
//! remember the latest data and the latest error for one endpoint, coalesce
//! concurrent loads into a single exchange, and notify observers whenever
//! anything changes. Data loads are cheap to ask for — `load_if_needed` is a
//! no-op while the last result is still fresh — so callers request a load
//! whenever a resource becomes visible and let the service decide.
//!
//! ## Design
//!
//! - **One task owns the state.** All resource mutation runs on a single
//!   runtime task per service; callers interact through cheap handles that
//!   send commands and read lock-free state snapshots. There is no locking
//!   around resource state and no observable interleaving.
//! - **Loads are cheap.** Identical in-flight loads coalesce into one
//!   [`Request`]; fresh data suppresses new exchanges entirely; conditional
//!   headers turn unchanged re-fetches into 304s that skip the parse
//!   pipeline.
//! - **Errors never evict data.** A failed refresh sets `latest_error`
//!   alongside the still-valid `latest_data`, so screens keep rendering the
//!   last good state while showing the problem.
//!
//! ## Module tour
//!
//! - [`service`] — configuration root and URL → resource registry.
//! - [`resource`] — the observable state container and its handle API.
//! - [`request`] — one in-flight load: phases, callbacks, cancellation.
//! - [`pipeline`] — response transformers (JSON, text) and content types.
//! - [`observer`] — observer registration, filtering, and dispatch.
//! - [`transport`] — the HTTP seam: [`transport::http::HttpTransport`] for
//!   production, [`transport::mock::MockTransport`] for tests.
//! - [`error`] — service, transport, transform, and resource errors.
//!
//! ## Quick start
//!
//! ```ignore
//! use remote_resource::{Service, ServiceConfig};
//! use remote_resource::transport::http::HttpTransport;
//!
//! let service = Service::new(
//!     ServiceConfig::new("https://api.example.com/v1"),
//!     HttpTransport::new(),
//! )?;
//!
//! let profile = service.resource("users/me")?;
//! profile.add_observer_fn(|resource, event| {
//!     tracing::info!(?event, data = ?resource.latest_data(), "profile changed");
//! });
//! profile.load_if_needed().await?;
//! ```

pub mod error;
pub mod observability;
pub mod observer;
pub mod pipeline;
pub mod request;
pub mod resource;
pub mod service;
pub mod transport;

mod runtime;

pub use error::{ErrorKind, ResourceError, ServiceError, TransformError, TransportError};
pub use observability::setup_tracing;
pub use observer::{ObserverId, ResourceObserver};
pub use pipeline::{Content, ContentValue, ResponseTransformer, TransformerChain};
pub use request::{Request, RequestOutcome, RequestPhase};
pub use resource::{Resource, ResourceData, ResourceEvent, ResourceState};
pub use service::{Service, ServiceConfig};
pub use transport::{Method, Transport, TransportRequest, TransportResponse};
