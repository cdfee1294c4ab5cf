//! The offline cache agent: one versioned cache store and a network-first
//! request policy.
//!
//! The host delivers three lifecycle events, modelled by [`LifecycleEvent`]:
//!
//! | Event      | Agent reaction                                                   |
//! |------------|------------------------------------------------------------------|
//! | `Install`  | Open the versioned store and pre-cache every static asset.       |
//! | `Activate` | Delete every store whose name is not the current version.        |
//! | `Fetch`    | GET only: network first, write 200s back, fall back to the cache. |
//!
//! Storage and network are injected, so the same agent runs against
//! [`MemoryStorage`](crate::cache::MemoryStorage) and
//! [`StubNetwork`](crate::fetch::StubNetwork) in tests and against a real
//! origin behind the [`server`](crate::server) proxy.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheKey, CacheStorage};
use crate::config::{AgentConfig, OFFLINE_PAGE};
use crate::fetch::{FetchError, Fetcher};
use crate::http::{Method, Request, Response, StatusCode};

/// Errors that fail a lifecycle event. Per-request failures never surface
/// here; they are absorbed by the fallback path.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to fetch static asset {asset}: {source}")]
    AssetFetch {
        asset: String,
        #[source]
        source: FetchError,
    },

    #[error("static asset {asset} answered {status}")]
    AssetStatus { asset: String, status: StatusCode },

    #[error("static asset fetch did not complete: {0}")]
    AssetTask(#[from] JoinError),

    #[error("cache store error: {0}")]
    Cache(#[from] CacheError),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },
}

/// Where an agent version is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Constructed, never installed.
    Parsed,
    Installing,
    /// Installed and waiting to activate.
    Installed,
    Activating,
    Activated,
    /// Failed to install, or superseded by a newer version.
    Redundant,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        })
    }
}

/// A lifecycle signal from the host.
#[derive(Debug)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(Request),
}

/// What handling a [`LifecycleEvent`] produced.
#[derive(Debug)]
pub enum EventOutcome {
    /// Every static asset is stored.
    Installed,
    /// Stale stores that were deleted.
    Activated { deleted: Vec<String> },
    Fetch(FetchOutcome),
}

/// Result of routing one request through the agent.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request itself, untouched.
    PassThrough(Request),
    /// The agent answered.
    Respond(Served),
}

impl FetchOutcome {
    /// The response the agent supplied, if it intercepted and had one.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::PassThrough(_) => None,
            Self::Respond(served) => served.response,
        }
    }
}

/// Which tier of the network-first policy produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    /// Exact match from a cache store.
    Cache,
    /// The cached root page, served in place of an uncached request.
    OfflinePage,
    /// Network failed and nothing usable was cached.
    Empty,
}

/// An intercepted request's answer.
#[derive(Debug)]
pub struct Served {
    /// `None` only when `source` is [`ResponseSource::Empty`].
    pub response: Option<Response>,
    pub source: ResponseSource,
    /// The detached write-back of a `200` network response, if one was started.
    pub cache_write: Option<CacheWrite>,
}

impl Served {
    fn from_cache(response: Option<Response>, source: ResponseSource) -> Self {
        match response {
            Some(response) => Self {
                response: Some(response),
                source,
                cache_write: None,
            },
            None => Self {
                response: None,
                source: ResponseSource::Empty,
                cache_write: None,
            },
        }
    }
}

/// Handle to a detached cache write.
///
/// Dropping it leaves the write running. Its outcome is only reported through
/// logging; [`finished`](Self::finished) exists so callers that care (tests,
/// orderly shutdown) can wait for it.
#[derive(Debug)]
pub struct CacheWrite {
    key: CacheKey,
    task: JoinHandle<bool>,
}

impl CacheWrite {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the write; `true` if the entry was stored.
    pub async fn finished(self) -> bool {
        self.task.await.unwrap_or(false)
    }
}

/// One version of the offline cache agent.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use offcache::agent::{OfflineAgent, ResponseSource, FetchOutcome};
/// use offcache::cache::MemoryStorage;
/// use offcache::config::AgentConfig;
/// use offcache::fetch::StubNetwork;
/// use offcache::http::{Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), offcache::agent::AgentError> {
/// let network = StubNetwork::new()
///     .route("/", Response::new(StatusCode::OK).body("home"))
///     .route("/a.js", Response::new(StatusCode::OK).body("a"));
/// let agent = OfflineAgent::new(
///     AgentConfig::new("site-v1", &["/", "/a.js"]),
///     Arc::new(MemoryStorage::new()),
///     Arc::new(network.clone()),
/// );
/// agent.install().await?;
/// agent.activate().await?;
///
/// network.set_offline(true);
/// let FetchOutcome::Respond(served) = agent.handle_fetch(Request::get("/a.js")).await else {
///     unreachable!("GET is always intercepted");
/// };
/// assert_eq!(served.source, ResponseSource::Cache);
/// # Ok(())
/// # }
/// ```
pub struct OfflineAgent {
    config: AgentConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Fetcher>,
    state: RwLock<AgentState>,
}

impl fmt::Debug for OfflineAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineAgent")
            .field("cache_name", &self.config.cache_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl OfflineAgent {
    pub fn new(
        config: AgentConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            storage,
            network,
            state: RwLock::new(AgentState::Parsed),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: AgentState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    // Moves to `next` if the current state is one of `from`; returns the previous state.
    fn begin(
        &self,
        operation: &'static str,
        from: &[AgentState],
        next: AgentState,
    ) -> Result<AgentState, AgentError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !from.contains(&state) {
            return Err(AgentError::InvalidState {
                operation,
                state: *state,
            });
        }
        let previous = *state;
        *state = next;
        Ok(previous)
    }

    /// Marks this version as superseded. It receives no further events.
    pub(crate) fn retire(&self) {
        info!(cache = %self.config.cache_name, "agent version retired");
        self.set_state(AgentState::Redundant);
    }

    /// Routes a lifecycle event to its handler.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventOutcome, AgentError> {
        match event {
            LifecycleEvent::Install => self.install().await.map(|()| EventOutcome::Installed),
            LifecycleEvent::Activate => self
                .activate()
                .await
                .map(|deleted| EventOutcome::Activated { deleted }),
            LifecycleEvent::Fetch(request) => Ok(EventOutcome::Fetch(self.handle_fetch(request).await)),
        }
    }

    /// Opens the current store and fills it with every static asset.
    ///
    /// The batch is all-or-nothing: if any asset fails to fetch, or answers a
    /// non-2xx status, nothing is stored, the agent becomes
    /// [`Redundant`](AgentState::Redundant), and the error is returned.
    /// Re-running on an installed or activated agent re-fetches and overwrites.
    ///
    /// # Errors
    ///
    /// - [`AgentError::AssetFetch`] / [`AgentError::AssetStatus`]: an asset could not be fetched.
    /// - [`AgentError::AssetTask`]: an asset fetch panicked or was cancelled.
    /// - [`AgentError::Cache`]: the store could not be opened or written.
    /// - [`AgentError::InvalidState`]: a lifecycle operation is already running,
    ///   or the agent is redundant.
    pub async fn install(&self) -> Result<(), AgentError> {
        let previous = self.begin(
            "install",
            &[AgentState::Parsed, AgentState::Installed, AgentState::Activated],
            AgentState::Installing,
        )?;
        info!(
            cache = %self.config.cache_name,
            assets = self.config.static_assets.len(),
            "installing"
        );

        match self.precache().await {
            Ok(()) => {
                let settled = if previous == AgentState::Activated {
                    AgentState::Activated
                } else {
                    AgentState::Installed
                };
                self.set_state(settled);
                info!(cache = %self.config.cache_name, "install complete");
                Ok(())
            }
            Err(e) => {
                warn!(cache = %self.config.cache_name, error = %e, "install failed");
                self.set_state(AgentState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<(), AgentError> {
        let cache = self.storage.open(&self.config.cache_name).await?;

        let mut fetches = JoinSet::new();
        for (index, asset) in self.config.static_assets.iter().enumerate() {
            let network = Arc::clone(&self.network);
            let request = Request::get(asset);
            fetches.spawn(async move {
                let result = network.fetch(&request).await;
                (index, request, result)
            });
        }

        let mut fetched: Vec<Option<(CacheKey, Response)>> =
            (0..self.config.static_assets.len()).map(|_| None).collect();

        // Returning early drops the JoinSet, which aborts the remaining fetches.
        while let Some(joined) = fetches.join_next().await {
            let (index, request, result) = joined?;
            let asset = &self.config.static_assets[index];
            let response = result.map_err(|source| AgentError::AssetFetch {
                asset: asset.clone(),
                source,
            })?;
            if !response.status().is_success() {
                return Err(AgentError::AssetStatus {
                    asset: asset.clone(),
                    status: response.status(),
                });
            }
            debug!(cache = %self.config.cache_name, asset = %asset, "asset fetched");
            fetched[index] = Some((CacheKey::from(&request), response));
        }

        cache.put_all(fetched.into_iter().flatten().collect()).await?;
        Ok(())
    }

    /// Deletes every store whose name differs from the current version and
    /// returns the deleted names. Re-running is a no-op.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Cache`]: a store could not be enumerated or deleted;
    ///   the agent stays installed.
    /// - [`AgentError::InvalidState`]: the agent has not installed.
    pub async fn activate(&self) -> Result<Vec<String>, AgentError> {
        let previous = self.begin(
            "activate",
            &[AgentState::Installed, AgentState::Activated],
            AgentState::Activating,
        )?;

        match self.purge_stale().await {
            Ok(deleted) => {
                self.set_state(AgentState::Activated);
                info!(
                    cache = %self.config.cache_name,
                    deleted = deleted.len(),
                    "activated"
                );
                Ok(deleted)
            }
            Err(e) => {
                warn!(cache = %self.config.cache_name, error = %e, "activation failed");
                self.set_state(previous);
                Err(e)
            }
        }
    }

    async fn purge_stale(&self) -> Result<Vec<String>, AgentError> {
        let mut deleted = Vec::new();
        for name in self.storage.keys().await? {
            if name == self.config.cache_name {
                continue;
            }
            if self.storage.delete(&name).await? {
                debug!(cache = %name, "deleted stale cache store");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Applies the network-first policy to one request.
    ///
    /// Non-GET requests come back as [`FetchOutcome::PassThrough`] without
    /// touching the cache. GET requests go to the network first; a `200` is
    /// written back to the current store by a detached task while the original
    /// response is returned. Any other status is returned uncached. If the
    /// network fails, the cached entry for the request is served, then the
    /// cached root page, then nothing.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        if request.method() != &Method::Get {
            debug!(method = %request.method(), url = %request.url(), "not intercepted");
            return FetchOutcome::PassThrough(request);
        }

        let key = CacheKey::from(&request);
        match self.network.fetch(&request).await {
            Ok(response) => {
                let cache_write = (response.status() == StatusCode::OK)
                    .then(|| self.spawn_cache_write(key, response.duplicate()));
                FetchOutcome::Respond(Served {
                    response: Some(response),
                    source: ResponseSource::Network,
                    cache_write,
                })
            }
            Err(e) => {
                debug!(url = %request.url(), error = %e, "network failed, falling back to cache");
                FetchOutcome::Respond(self.fallback(&key).await)
            }
        }
    }

    async fn fallback(&self, key: &CacheKey) -> Served {
        if let Some(hit) = self.lookup(key).await {
            return Served::from_cache(Some(hit), ResponseSource::Cache);
        }

        let offline_page = CacheKey::for_url(OFFLINE_PAGE);
        if &offline_page == key {
            return Served::from_cache(None, ResponseSource::Empty);
        }
        let page = self.lookup(&offline_page).await;
        if page.is_none() {
            debug!(key = %key, "nothing cached for request or offline page");
        }
        Served::from_cache(page, ResponseSource::OfflinePage)
    }

    // Read failures degrade to a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<Response> {
        match self.storage.match_any(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed");
                None
            }
        }
    }

    // Writes `response` under `key` without the caller waiting on it.
    fn spawn_cache_write(&self, key: CacheKey, response: Response) -> CacheWrite {
        let storage = Arc::clone(&self.storage);
        let cache_name = self.config.cache_name.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let result = match storage.open(&cache_name).await {
                Ok(cache) => cache.put(task_key.clone(), response).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!(cache = %cache_name, key = %task_key, "cached network response");
                    true
                }
                Err(e) => {
                    warn!(cache = %cache_name, key = %task_key, error = %e, "cache write failed");
                    false
                }
            }
        });

        CacheWrite { key, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BoxFuture, Cache, MemoryStorage};
    use crate::fetch::StubNetwork;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    fn ok(body: &'static str) -> Response {
        Response::new(StatusCode::OK).body(body)
    }

    fn agent_with(
        name: &str,
        assets: &[&str],
        storage: &MemoryStorage,
        network: &StubNetwork,
    ) -> OfflineAgent {
        OfflineAgent::new(
            AgentConfig::new(name, assets),
            Arc::new(storage.clone()),
            Arc::new(network.clone()),
        )
    }

    fn served(outcome: FetchOutcome) -> Served {
        match outcome {
            FetchOutcome::Respond(served) => served,
            FetchOutcome::PassThrough(req) => panic!("{} was not intercepted", req.url()),
        }
    }

    async fn cached(storage: &MemoryStorage, name: &str, url: &str) -> Option<Response> {
        let cache = storage.open(name).await.unwrap();
        cache.get(&CacheKey::for_url(url)).await.unwrap()
    }

    #[tokio::test]
    async fn install_stores_every_static_asset() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new()
            .route("/", ok("home"))
            .route("/a.js", ok("a"));
        let agent = agent_with("v1", &["/", "/a.js"], &storage, &network);

        agent.install().await.unwrap();

        assert_eq!(agent.state(), AgentState::Installed);
        let cache = storage.open("v1").await.unwrap();
        assert_eq!(
            cache.keys().await.unwrap(),
            vec![CacheKey::for_url("/"), CacheKey::for_url("/a.js")]
        );
    }

    #[tokio::test]
    async fn install_is_all_or_nothing() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new()
            .route("/", ok("home"))
            .route("/a.js", ok("a"));
        network.fail("/a.js");
        let agent = agent_with("v1", &["/", "/a.js"], &storage, &network);

        let err = agent.install().await.unwrap_err();

        assert!(matches!(err, AgentError::AssetFetch { ref asset, .. } if asset == "/a.js"));
        assert_eq!(agent.state(), AgentState::Redundant);
        assert!(cached(&storage, "v1", "/").await.is_none());
    }

    #[tokio::test]
    async fn install_rejects_non_success_assets() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new().route("/", ok("home"));
        let agent = agent_with("v1", &["/", "/missing.css"], &storage, &network);

        let err = agent.install().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::AssetStatus { status: StatusCode::NOT_FOUND, .. }
        ));
    }

    // A network whose fetch task panics instead of answering.
    struct PanickingNetwork;

    impl Fetcher for PanickingNetwork {
        fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
            Box::pin(async move {
                let result: Result<Response, FetchError> = panic!("fetch of {} blew up", request.url());
                result
            })
        }
    }

    #[tokio::test]
    async fn panicked_asset_fetch_is_a_task_error() {
        let storage = MemoryStorage::new();
        let agent = OfflineAgent::new(
            AgentConfig::new("v1", &["/"]),
            Arc::new(storage.clone()),
            Arc::new(PanickingNetwork),
        );

        let err = agent.install().await.unwrap_err();

        assert!(matches!(err, AgentError::AssetTask(ref e) if e.is_panic()));
        assert_eq!(agent.state(), AgentState::Redundant);
        assert!(cached(&storage, "v1", "/").await.is_none());
    }

    #[tokio::test]
    async fn failed_install_blocks_activation() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new();
        network.set_offline(true);
        let agent = agent_with("v1", &["/"], &storage, &network);

        assert!(agent.install().await.is_err());
        let err = agent.activate().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidState { state: AgentState::Redundant, .. }
        ));
    }

    #[tokio::test]
    async fn install_and_activate_rerun_cleanly() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new().route("/", ok("home"));
        let agent = agent_with("v1", &["/"], &storage, &network);

        agent.install().await.unwrap();
        agent.install().await.unwrap();
        assert!(agent.activate().await.unwrap().is_empty());
        agent.install().await.unwrap();
        assert_eq!(agent.state(), AgentState::Activated);
        assert!(agent.activate().await.unwrap().is_empty());
        assert_eq!(storage.keys().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn activate_before_install_is_rejected() {
        let agent = agent_with("v1", &[], &MemoryStorage::new(), &StubNetwork::new());
        assert!(matches!(
            agent.activate().await,
            Err(AgentError::InvalidState { operation: "activate", state: AgentState::Parsed })
        ));
    }

    #[tokio::test]
    async fn activate_keeps_only_current_version() {
        let storage = MemoryStorage::new();
        storage.open("v1").await.unwrap();
        storage.open("v2-current").await.unwrap();
        let agent = agent_with("v2-current", &[], &storage, &StubNetwork::new());

        agent.install().await.unwrap();
        let deleted = agent.activate().await.unwrap();

        assert_eq!(deleted, vec!["v1"]);
        assert_eq!(storage.keys().await.unwrap(), vec!["v2-current"]);
        assert_eq!(agent.state(), AgentState::Activated);
    }

    #[tokio::test]
    async fn activation_failure_leaves_agent_installed() {
        let storage = MemoryStorage::new();
        let agent = agent_with("v1", &[], &storage, &StubNetwork::new());
        agent.install().await.unwrap();

        storage.set_unavailable(true);
        assert!(matches!(agent.activate().await, Err(AgentError::Cache(_))));
        assert_eq!(agent.state(), AgentState::Installed);
    }

    #[tokio::test]
    async fn ok_response_is_returned_and_cached() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new().route("/page", ok("fresh"));
        let agent = agent_with("v1", &[], &storage, &network);

        let served = served(agent.handle_fetch(Request::get("/page")).await);

        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(served.response.as_ref().unwrap().body_bytes().as_ref(), b"fresh");
        let write = served.cache_write.expect("200 responses are written back");
        assert_eq!(write.key(), &CacheKey::for_url("/page"));
        assert!(write.finished().await);

        let stored = cached(&storage, "v1", "/page").await.unwrap();
        assert_eq!(stored.body_bytes().as_ref(), b"fresh");
    }

    #[tokio::test]
    async fn non_ok_response_is_returned_but_not_cached() {
        let storage = MemoryStorage::new();
        let network = StubNetwork::new()
            .route("/gone", Response::new(StatusCode::NOT_FOUND).body("nope"))
            .route("/created", Response::new(StatusCode::CREATED));
        let agent = agent_with("v1", &[], &storage, &network);

        for url in ["/gone", "/created"] {
            let served = served(agent.handle_fetch(Request::get(url)).await);
            assert_eq!(served.source, ResponseSource::Network);
            assert!(served.response.is_some());
            assert!(served.cache_write.is_none());
        }
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn network_failure_serves_cached_entry() {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(CacheKey::for_url("/page"), ok("cached page")).await.unwrap();
        cache.put(CacheKey::for_url("/"), ok("home")).await.unwrap();
        let network = StubNetwork::new();
        network.set_offline(true);
        let agent = agent_with("v1", &[], &storage, &network);

        let served = served(agent.handle_fetch(Request::get("/page")).await);

        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(served.response.unwrap().body_bytes().as_ref(), b"cached page");
        assert_eq!(network.calls(), vec![CacheKey::for_url("/page")]);
    }

    #[tokio::test]
    async fn network_failure_falls_back_to_root_page() {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(CacheKey::for_url("/"), ok("home")).await.unwrap();
        let network = StubNetwork::new();
        network.set_offline(true);
        let agent = agent_with("v1", &[], &storage, &network);

        let served = served(agent.handle_fetch(Request::get("/missing")).await);

        assert_eq!(served.source, ResponseSource::OfflinePage);
        assert_eq!(served.response.unwrap().body_bytes().as_ref(), b"home");
    }

    #[tokio::test]
    async fn network_failure_with_empty_cache_is_empty() {
        let network = StubNetwork::new();
        network.set_offline(true);
        let agent = agent_with("v1", &[], &MemoryStorage::new(), &network);

        for url in ["/missing", "/"] {
            let served = served(agent.handle_fetch(Request::get(url)).await);
            assert_eq!(served.source, ResponseSource::Empty);
            assert!(served.response.is_none());
        }
    }

    #[tokio::test]
    async fn cache_read_failure_degrades_to_empty() {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(CacheKey::for_url("/"), ok("home")).await.unwrap();
        storage.set_unavailable(true);
        let network = StubNetwork::new();
        network.set_offline(true);
        let agent = agent_with("v1", &[], &storage, &network);

        let served = served(agent.handle_fetch(Request::get("/page")).await);
        assert_eq!(served.source, ResponseSource::Empty);
    }

    #[tokio::test]
    async fn failed_write_does_not_fail_the_request() {
        let storage = MemoryStorage::new().with_quota(0);
        let network = StubNetwork::new().route("/page", ok("fresh"));
        let agent = agent_with("v1", &[], &storage, &network);

        let served = served(agent.handle_fetch(Request::get("/page")).await);

        assert_eq!(served.source, ResponseSource::Network);
        assert!(served.response.is_some());
        assert!(!served.cache_write.unwrap().finished().await);
    }

    #[tokio::test]
    async fn non_get_requests_pass_through_untouched() {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let post_key = CacheKey::from(&Request::new(Method::Post, "/events"));
        cache.put(post_key, ok("stale")).await.unwrap();
        let network = StubNetwork::new();
        let agent = agent_with("v1", &[], &storage, &network);

        let request = Request::new(Method::Post, "/events").body("payload");
        match agent.handle_fetch(request.clone()).await {
            FetchOutcome::PassThrough(passed) => assert_eq!(passed, request),
            FetchOutcome::Respond(_) => panic!("POST must not be intercepted"),
        }
        assert!(network.calls().is_empty());
        assert_eq!(cache.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_routes_each_event_kind() {
        let storage = MemoryStorage::new();
        storage.open("old").await.unwrap();
        let network = StubNetwork::new().route("/", ok("home"));
        let agent = agent_with("v1", &["/"], &storage, &network);

        assert!(matches!(
            agent.dispatch(LifecycleEvent::Install).await.unwrap(),
            EventOutcome::Installed
        ));
        match agent.dispatch(LifecycleEvent::Activate).await.unwrap() {
            EventOutcome::Activated { deleted } => assert_eq!(deleted, vec!["old"]),
            other => panic!("unexpected outcome {other:?}"),
        }
        match agent
            .dispatch(LifecycleEvent::Fetch(Request::get("/")))
            .await
            .unwrap()
        {
            EventOutcome::Fetch(outcome) => {
                assert_eq!(outcome.into_response().unwrap().status(), StatusCode::OK)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    // A storage whose writes park until released.
    #[derive(Clone)]
    struct GatedStorage {
        inner: MemoryStorage,
        gate: Arc<Notify>,
        entered: Arc<AtomicBool>,
    }

    struct GatedCache {
        inner: Arc<dyn Cache>,
        gate: Arc<Notify>,
        entered: Arc<AtomicBool>,
    }

    impl Cache for GatedCache {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn get<'a>(
            &'a self,
            key: &'a CacheKey,
        ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
            self.inner.get(key)
        }

        fn put(&self, key: CacheKey, response: Response) -> BoxFuture<'_, Result<(), CacheError>> {
            Box::pin(async move {
                self.entered.store(true, Ordering::SeqCst);
                self.gate.notified().await;
                self.inner.put(key, response).await
            })
        }

        fn put_all(
            &self,
            entries: Vec<(CacheKey, Response)>,
        ) -> BoxFuture<'_, Result<(), CacheError>> {
            self.inner.put_all(entries)
        }

        fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>> {
            self.inner.keys()
        }
    }

    impl CacheStorage for GatedStorage {
        fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn Cache>, CacheError>> {
            Box::pin(async move {
                let inner = self.inner.open(name).await?;
                Ok(Arc::new(GatedCache {
                    inner,
                    gate: Arc::clone(&self.gate),
                    entered: Arc::clone(&self.entered),
                }) as Arc<dyn Cache>)
            })
        }

        fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
            self.inner.has(name)
        }

        fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
            self.inner.delete(name)
        }

        fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
            self.inner.keys()
        }

        fn match_any<'a>(
            &'a self,
            key: &'a CacheKey,
        ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
            self.inner.match_any(key)
        }
    }

    #[tokio::test]
    async fn response_is_returned_before_cache_write_completes() {
        let storage = GatedStorage {
            inner: MemoryStorage::new(),
            gate: Arc::new(Notify::new()),
            entered: Arc::new(AtomicBool::new(false)),
        };
        let network = StubNetwork::new().route("/page", ok("fresh"));
        let agent = OfflineAgent::new(
            AgentConfig::new("v1", &[]),
            Arc::new(storage.clone()),
            Arc::new(network),
        );

        let served = served(agent.handle_fetch(Request::get("/page")).await);
        let write = served.cache_write.unwrap();
        assert!(served.response.is_some());
        assert!(!write.is_finished());

        // Wait until the write is parked on the gate, then release it.
        while !storage.entered.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        storage.gate.notify_one();
        assert!(write.finished().await);
        assert!(cached(&storage.inner, "v1", "/page").await.is_some());
    }
}
