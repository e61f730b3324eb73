//! The service runtime: one task owning all resource state.
//!
//! Every `Service` spawns exactly one runtime task. Handles (`Service`,
//! `Resource`, `Request`) send [`Command`]s over an mpsc channel; transport
//! exchanges run in spawned background tasks and re-enter through a separate
//! completion channel. The runtime processes both streams strictly serially,
//! which is what makes the public guarantees hold without locks:
//!
//! - state mutations and observer notifications for a resource are never
//!   concurrent or reordered relative to each other;
//! - coalescing checks (`is there a primary request in flight?`) cannot
//!   race, even when callers sit on different threads;
//! - an observer added while an event is dispatched can only see later
//!   events, because its registration is itself a queued command.
//!
//! The runtime exits when the command channel closes (every handle dropped)
//! or on an explicit shutdown command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ResourceError, TransportError};
use crate::observer::{EventFilter, ObserverBinding, ObserverId, ObserverRegistry};
use crate::pipeline::{sniff_content_type, Content, ContentValue, TransformerChain};
use crate::request::{Request, RequestOutcome};
use crate::resource::{Resource, ResourceData, ResourceEvent, ResourceState};
use crate::transport::{Method, Transport, TransportRequest, TransportResponse};

/// Messages handles send to the runtime.
pub(crate) enum Command {
    LoadIfNeeded {
        resource: Resource,
        respond_to: oneshot::Sender<Option<Request>>,
    },
    Load {
        resource: Resource,
        respond_to: oneshot::Sender<Request>,
    },
    Issue {
        resource: Resource,
        method: Method,
        body: Option<Vec<u8>>,
        respond_to: oneshot::Sender<Request>,
    },
    Wipe {
        resource: Resource,
        respond_to: oneshot::Sender<()>,
    },
    OverrideData {
        resource: Resource,
        content: Content,
        respond_to: oneshot::Sender<()>,
    },
    SetStaleness {
        resource: Resource,
        staleness: Duration,
    },
    SetTransformers {
        resource: Resource,
        chain: TransformerChain,
    },
    AddObserver {
        resource: Resource,
        binding: ObserverBinding,
        filter: Option<EventFilter>,
        respond_to: oneshot::Sender<ObserverId>,
    },
    RemoveObserver {
        resource: Resource,
        id: ObserverId,
    },
    Cancel {
        request: Request,
        respond_to: oneshot::Sender<()>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// A transport exchange re-entering the runtime.
struct Completion {
    resource: Resource,
    request: Request,
    result: Result<TransportResponse, TransportError>,
}

/// Per-resource bookkeeping that never leaves the runtime task.
#[derive(Default)]
struct ResourceEntry {
    observers: ObserverRegistry,
    /// The coalescing target: at most one primary load at a time.
    primary: Option<Request>,
    /// Every request currently in flight, primary included.
    in_flight: Vec<Request>,
    /// Per-resource overrides of the service defaults.
    staleness: Option<Duration>,
    transformers: Option<TransformerChain>,
}

struct RuntimeState {
    completions_tx: mpsc::Sender<Completion>,
    transport: Arc<dyn Transport>,
    staleness: Duration,
    transformers: TransformerChain,
    entries: HashMap<Url, ResourceEntry>,
}

pub(crate) struct ServiceRuntime {
    commands: mpsc::Receiver<Command>,
    completions_rx: mpsc::Receiver<Completion>,
    state: RuntimeState,
}

impl ServiceRuntime {
    pub(crate) fn new(
        commands: mpsc::Receiver<Command>,
        transport: Arc<dyn Transport>,
        staleness: Duration,
        transformers: TransformerChain,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(64);
        ServiceRuntime {
            commands,
            completions_rx,
            state: RuntimeState {
                completions_tx,
                transport,
                staleness,
                transformers,
                entries: HashMap::new(),
            },
        }
    }

    /// Processes commands and completions until shutdown or until every
    /// handle is gone.
    pub(crate) async fn run(self) {
        let ServiceRuntime {
            mut commands,
            mut completions_rx,
            mut state,
        } = self;
        info!("Service runtime started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { respond_to }) => {
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(command) => state.handle_command(command),
                    // All handles dropped.
                    None => break,
                },
                Some(completion) = completions_rx.recv() => state.handle_completion(completion),
            }
        }
        // Requests still pending at teardown would otherwise never settle;
        // awaiters on `completion()` must not hang past shutdown.
        for entry in state.entries.values_mut() {
            entry.primary = None;
            for request in entry.in_flight.drain(..) {
                request.resolve(RequestOutcome::Cancelled);
            }
        }
        info!(resources = state.entries.len(), "Service runtime stopped");
    }
}

impl RuntimeState {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LoadIfNeeded { resource, respond_to } => {
                let in_flight = self
                    .entries
                    .get(resource.url())
                    .and_then(|entry| entry.primary.clone());
                let reply = if let Some(request) = in_flight {
                    debug!(url = %resource.url(), "Coalescing onto in-flight request");
                    Some(request)
                } else if resource.snapshot().is_up_to_date(SystemTime::now()) {
                    debug!(url = %resource.url(), "Data fresh; load suppressed");
                    None
                } else {
                    Some(self.start_request(&resource, Method::Get, None, true))
                };
                let _ = respond_to.send(reply);
            }
            Command::Load { resource, respond_to } => {
                let in_flight = self
                    .entries
                    .get(resource.url())
                    .and_then(|entry| entry.primary.clone());
                let request = match in_flight {
                    Some(request) => {
                        debug!(url = %resource.url(), "Coalescing forced load onto in-flight request");
                        request
                    }
                    None => self.start_request(&resource, Method::Get, None, true),
                };
                let _ = respond_to.send(request);
            }
            Command::Issue { resource, method, body, respond_to } => {
                let request = self.start_request(&resource, method, body, false);
                let _ = respond_to.send(request);
            }
            Command::Wipe { resource, respond_to } => {
                self.wipe(&resource);
                let _ = respond_to.send(());
            }
            Command::OverrideData { resource, content, respond_to } => {
                let staleness_default = self.staleness;
                let entry = self.entries.entry(resource.url().clone()).or_default();
                let data = Arc::new(ResourceData::local(content));
                let staleness = entry.staleness.unwrap_or(staleness_default);
                publish(&resource, Some(data), None, !entry.in_flight.is_empty(), staleness);
                entry.observers.dispatch(&resource, ResourceEvent::NewDataFromCache);
                info!(url = %resource.url(), "Local data override");
                let _ = respond_to.send(());
            }
            Command::SetStaleness { resource, staleness } => {
                let entry = self.entries.entry(resource.url().clone()).or_default();
                entry.staleness = Some(staleness);
                // Recompute the expiration of whatever is already cached.
                let prior = resource.snapshot();
                publish(
                    &resource,
                    prior.data.clone(),
                    prior.error.clone(),
                    !entry.in_flight.is_empty(),
                    staleness,
                );
                debug!(url = %resource.url(), ?staleness, "Staleness override");
            }
            Command::SetTransformers { resource, chain } => {
                let entry = self.entries.entry(resource.url().clone()).or_default();
                entry.transformers = Some(chain);
                debug!(url = %resource.url(), "Transformer chain override");
            }
            Command::AddObserver { resource, binding, filter, respond_to } => {
                let entry = self.entries.entry(resource.url().clone()).or_default();
                let id = entry.observers.add(binding, filter);
                // Immediate ping with an event reflecting current state, so
                // new observers never special-case first load.
                let event = arrival_event(&resource.snapshot());
                entry.observers.dispatch_to(id, &resource, event);
                debug!(url = %resource.url(), observers = entry.observers.len(), "Observer added");
                let _ = respond_to.send(id);
            }
            Command::RemoveObserver { resource, id } => {
                if let Some(entry) = self.entries.get_mut(resource.url()) {
                    entry.observers.remove(id);
                    debug!(url = %resource.url(), observers = entry.observers.len(), "Observer removed");
                }
            }
            Command::Cancel { request, respond_to } => {
                self.cancel(&request);
                let _ = respond_to.send(());
            }
            // Handled by the run loop.
            Command::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    /// Issues a new exchange and registers it as in flight.
    fn start_request(
        &mut self,
        resource: &Resource,
        method: Method,
        body: Option<Vec<u8>>,
        primary: bool,
    ) -> Request {
        let request = Request::new(resource.clone(), method);

        // Conditional validators only make sense for the primary GET.
        let mut headers = Vec::new();
        if primary {
            if let Some(data) = resource.snapshot().data.as_ref() {
                if let Some(etag) = &data.etag {
                    headers.push(("If-None-Match".to_string(), etag.clone()));
                }
                if let Some(last_modified) = &data.last_modified {
                    headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
                }
            }
        }

        let transport = Arc::clone(&self.transport);
        let completions_tx = self.completions_tx.clone();
        let staleness_default = self.staleness;

        let entry = self.entries.entry(resource.url().clone()).or_default();
        entry.in_flight.push(request.clone());
        if primary {
            entry.primary = Some(request.clone());
        }
        let staleness = entry.staleness.unwrap_or(staleness_default);
        let prior = resource.snapshot();
        publish(resource, prior.data.clone(), prior.error.clone(), true, staleness);
        entry.observers.dispatch(resource, ResourceEvent::Requested);
        info!(url = %resource.url(), %method, primary, "Request issued");

        let transport_request = TransportRequest {
            method,
            url: resource.url().clone(),
            headers,
            body,
        };
        let task_resource = resource.clone();
        let task_request = request.clone();
        tokio::spawn(async move {
            let result = transport.perform(transport_request).await;
            // Runtime may be gone; the result is simply dropped then.
            let _ = completions_tx
                .send(Completion {
                    resource: task_resource,
                    request: task_request,
                    result,
                })
                .await;
        });

        request
    }

    /// A transport exchange finished; classify it and apply it.
    fn handle_completion(&mut self, completion: Completion) {
        let Completion { resource, request, result } = completion;
        let staleness_default = self.staleness;
        let transformers_default = self.transformers.clone();

        let Some(entry) = self.entries.get_mut(resource.url()) else {
            return;
        };
        let id = request.id();
        let before = entry.in_flight.len();
        entry.in_flight.retain(|r| r.id() != id);
        if entry.in_flight.len() == before {
            // Cancelled (or wiped) while the exchange ran; drop the result.
            debug!(url = %resource.url(), "Completion for cancelled request dropped");
            return;
        }
        let was_primary = entry.primary.as_ref().is_some_and(|p| p.id() == id);
        if was_primary {
            entry.primary = None;
        }
        let loading = !entry.in_flight.is_empty();
        let staleness = entry.staleness.unwrap_or(staleness_default);
        let chain = entry.transformers.clone().unwrap_or(transformers_default);
        let prior = resource.snapshot();

        match interpret(result, prior.data.as_ref(), &chain) {
            LoadResult::NewData(data) => {
                let data = Arc::new(data);
                if was_primary {
                    // Success replaces the data and clears any prior error.
                    publish(&resource, Some(data.clone()), None, loading, staleness);
                    entry.observers.dispatch(&resource, ResourceEvent::NewDataFromServer);
                    info!(url = %resource.url(), "New data from server");
                } else {
                    publish(&resource, prior.data.clone(), prior.error.clone(), loading, staleness);
                }
                request.resolve(RequestOutcome::NewData(data));
            }
            LoadResult::NotModified(data) => {
                let data = Arc::new(data);
                if was_primary {
                    publish(&resource, Some(data.clone()), None, loading, staleness);
                    entry.observers.dispatch(&resource, ResourceEvent::NotModified);
                    info!(url = %resource.url(), "Not modified; timestamp refreshed");
                } else {
                    publish(&resource, prior.data.clone(), prior.error.clone(), loading, staleness);
                }
                request.resolve(RequestOutcome::NotModified(data));
            }
            LoadResult::Failed(error) => {
                let error = Arc::new(error);
                if was_primary {
                    // Stale-while-error: existing data is retained.
                    publish(&resource, prior.data.clone(), Some(error.clone()), loading, staleness);
                    entry.observers.dispatch(&resource, ResourceEvent::Error);
                    warn!(url = %resource.url(), error = %error, "Request failed");
                } else {
                    publish(&resource, prior.data.clone(), prior.error.clone(), loading, staleness);
                }
                request.resolve(RequestOutcome::Failed(error));
            }
        }
    }

    fn wipe(&mut self, resource: &Resource) {
        let staleness_default = self.staleness;
        let entry = self.entries.entry(resource.url().clone()).or_default();
        for request in entry.in_flight.drain(..) {
            request.resolve(RequestOutcome::Cancelled);
        }
        entry.primary = None;
        let staleness = entry.staleness.unwrap_or(staleness_default);
        publish(resource, None, None, false, staleness);
        entry.observers.dispatch(resource, ResourceEvent::Cleared);
        info!(url = %resource.url(), "Wiped");
    }

    fn cancel(&mut self, request: &Request) {
        let resource = request.resource().clone();
        let staleness_default = self.staleness;
        let Some(entry) = self.entries.get_mut(resource.url()) else {
            return;
        };
        let id = request.id();
        let before = entry.in_flight.len();
        entry.in_flight.retain(|r| r.id() != id);
        if entry.in_flight.len() == before {
            // Already completed or already cancelled; terminal states stand.
            return;
        }
        if entry.primary.as_ref().is_some_and(|p| p.id() == id) {
            entry.primary = None;
        }
        request.resolve(RequestOutcome::Cancelled);
        let staleness = entry.staleness.unwrap_or(staleness_default);
        let prior = resource.snapshot();
        // No Error notification: cancellation is not a user-facing failure.
        publish(
            &resource,
            prior.data.clone(),
            prior.error.clone(),
            !entry.in_flight.is_empty(),
            staleness,
        );
        info!(url = %resource.url(), "Request cancelled");
    }
}

/// Stores the next snapshot on the resource handle. Always called before
/// observers are notified, so observers re-reading state see the transition
/// that the event describes.
fn publish(
    resource: &Resource,
    data: Option<Arc<ResourceData>>,
    error: Option<Arc<ResourceError>>,
    loading: bool,
    staleness: Duration,
) {
    let expires_at = data.as_ref().map(|d| d.received_at + staleness);
    resource.publish_state(ResourceState {
        data,
        error,
        loading,
        expires_at,
    });
}

/// Event for the add-time ping, derived from current state: cached data
/// first, then error, then in-flight, then empty.
fn arrival_event(state: &ResourceState) -> ResourceEvent {
    if state.data.is_some() {
        ResourceEvent::NewDataFromCache
    } else if state.error.is_some() {
        ResourceEvent::Error
    } else if state.loading {
        ResourceEvent::Requested
    } else {
        ResourceEvent::Cleared
    }
}

enum LoadResult {
    NewData(ResourceData),
    NotModified(ResourceData),
    Failed(ResourceError),
}

/// Classifies a raw transport result into the resource-level outcome.
///
/// The 304 path reuses the prior payload unchanged and skips the pipeline
/// entirely (there is no new body to transform); only the timestamp and
/// validators are refreshed.
fn interpret(
    result: Result<TransportResponse, TransportError>,
    prior: Option<&Arc<ResourceData>>,
    chain: &TransformerChain,
) -> LoadResult {
    let response = match result {
        Ok(response) => response,
        Err(error) => return LoadResult::Failed(ResourceError::transport(error)),
    };
    let etag = response.header("etag").map(str::to_string);
    let last_modified = response.header("last-modified").map(str::to_string);

    if response.status == 304 {
        return match prior {
            Some(existing) => LoadResult::NotModified(ResourceData {
                content: existing.content.clone(),
                etag: etag.or_else(|| existing.etag.clone()),
                last_modified: last_modified.or_else(|| existing.last_modified.clone()),
                received_at: SystemTime::now(),
            }),
            // A 304 with nothing cached cannot be honored.
            None => LoadResult::Failed(ResourceError::server(304, response.body)),
        };
    }
    if !response.is_success() {
        return LoadResult::Failed(ResourceError::server(response.status, response.body));
    }

    let content_type = match response.header("content-type") {
        Some(ct) if !ct.eq_ignore_ascii_case("application/octet-stream") => ct.to_string(),
        _ => sniff_content_type(&response.body).to_string(),
    };
    let content = Content {
        value: ContentValue::Bytes(response.body),
        content_type,
    };
    match chain.process(content) {
        Ok(content) => LoadResult::NewData(ResourceData {
            content,
            etag,
            last_modified,
            received_at: SystemTime::now(),
        }),
        Err(error) => LoadResult::Failed(ResourceError::parse(error)),
    }
}
