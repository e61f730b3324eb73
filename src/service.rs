//! The `Service`: configuration root and resource registry for one API.
//!
//! A service owns a base URL, default staleness window, default transformer
//! chain, and the mapping from canonical URL to [`Resource`]. The mapping is
//! the single structure touched from arbitrary caller threads, so it sits
//! behind a mutex with get-or-create semantics: two simultaneous first
//! lookups of the same URL produce one winner, and the same canonical URL
//! always yields the identical `Resource` instance for the service's
//! lifetime. Everything else happens on the service's runtime task.
//!
//! Canonicalization happens before lookup: relative segments are resolved
//! against the base, duplicate slashes collapse, trailing slashes are
//! stripped, and default ports disappear — so `"items/123"` and
//! `"items//123/"` are the same resource.
//!
//! Resources are process-scoped state owned by one `Service` instance, not
//! ambient globals: two services never share resources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;

use crate::error::ServiceError;
use crate::pipeline::TransformerChain;
use crate::resource::Resource;
use crate::runtime::{Command, ServiceRuntime};
use crate::transport::Transport;

/// Default staleness window when none is configured.
const DEFAULT_STALENESS: Duration = Duration::from_secs(30);

const COMMAND_BUFFER: usize = 64;

/// Configuration for a [`Service`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    base_url: String,
    staleness: Duration,
    transformers: TransformerChain,
}

impl ServiceConfig {
    /// Starts from a base URL with a 30-second staleness window and the
    /// standard transformer chain.
    pub fn new(base_url: impl Into<String>) -> Self {
        ServiceConfig {
            base_url: base_url.into(),
            staleness: DEFAULT_STALENESS,
            transformers: TransformerChain::standard(),
        }
    }

    /// How long loaded data counts as fresh. `Duration::ZERO` means always
    /// stale: every `load_if_needed` fetches.
    pub fn staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Replaces the default transformer chain.
    pub fn transformers(mut self, transformers: TransformerChain) -> Self {
        self.transformers = transformers;
        self
    }
}

pub(crate) struct ServiceShared {
    base: Url,
    sender: mpsc::Sender<Command>,
    registry: Mutex<HashMap<Url, Resource>>,
    runtime: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServiceShared {
    /// Get-or-create with a single winner; the registry lock covers the
    /// whole check-then-insert.
    fn intern(self: &Arc<Self>, url: Url) -> Resource {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(resource) = registry.get(&url) {
            return resource.clone();
        }
        debug!(url = %url, "Resource created");
        let resource = Resource::new(url.clone(), self.sender.clone(), Arc::downgrade(self));
        registry.insert(url, resource.clone());
        resource
    }

    pub(crate) fn child_of(
        self: &Arc<Self>,
        parent: &Url,
        segment: &str,
    ) -> Result<Resource, ServiceError> {
        let base = ensure_trailing_slash(parent.clone());
        let url = canonicalize(&base, segment)?;
        Ok(self.intern(url))
    }
}

/// Registry + configuration root producing [`Resource`]s for one API.
///
/// Construction spawns the service runtime task, so a tokio runtime must be
/// current. Handles are cheap clones sharing the same registry and runtime.
#[derive(Clone)]
pub struct Service {
    shared: Arc<ServiceShared>,
}

impl Service {
    /// Builds the service and spawns its runtime with the given transport
    /// adapter.
    pub fn new(config: ServiceConfig, transport: impl Transport) -> Result<Self, ServiceError> {
        let base = Url::parse(&config.base_url).map_err(|e| ServiceError::InvalidPath {
            path: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        let base = ensure_trailing_slash(base);

        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let runtime = ServiceRuntime::new(
            receiver,
            Arc::new(transport),
            config.staleness,
            config.transformers,
        );
        let handle = tokio::spawn(runtime.run());

        Ok(Service {
            shared: Arc::new(ServiceShared {
                base,
                sender,
                registry: Mutex::new(HashMap::new()),
                runtime: Mutex::new(Some(handle)),
            }),
        })
    }

    /// The canonical base URL (always with a trailing slash).
    pub fn base_url(&self) -> &Url {
        &self.shared.base
    }

    /// The resource for `path`, resolved against the base URL.
    ///
    /// Safe to call from any thread. Two spellings that canonicalize
    /// identically return the same instance ([`Resource::ptr_eq`]).
    pub fn resource(&self, path: &str) -> Result<Resource, ServiceError> {
        let url = canonicalize(&self.shared.base, path)?;
        Ok(self.shared.intern(url))
    }

    /// Number of distinct resources created so far.
    pub fn resource_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the runtime task and waits for it to finish. In-flight
    /// exchanges complete in the background but their results are dropped.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        let (respond_to, response) = oneshot::channel();
        if self
            .shared
            .sender
            .send(Command::Shutdown { respond_to })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
        let handle = self
            .shared
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| ServiceError::RuntimeFailed(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("base", &self.shared.base.as_str())
            .field("resources", &self.resource_count())
            .finish()
    }
}

/// Resolves `path` against `base` and normalizes the result.
pub(crate) fn canonicalize(base: &Url, path: &str) -> Result<Url, ServiceError> {
    let joined = base.join(path).map_err(|e| ServiceError::InvalidPath {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    Ok(normalize(joined))
}

/// Collapses duplicate slashes, strips the trailing slash, drops fragments.
/// Dot segments and default ports are already resolved by URL parsing.
fn normalize(mut url: Url) -> Url {
    let path = url.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let normalized = if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    };
    if normalized != path {
        url.set_path(&normalized);
    }
    url.set_fragment(None);
    url
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
