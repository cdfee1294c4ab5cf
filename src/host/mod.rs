//! Host-side version lifecycle: which agent version is installed, waiting,
//! and active, and which one receives fetch events.
//!
//! ```text
//! register(v1)  ── install ──► Active (no version was active, so it activates at once)
//! register(v2)  ── install ──► Waiting
//! promote()     ── retire v1, activate v2 ──► Active
//! ```
//!
//! A version whose install fails never leaves `register`; the active version
//! keeps serving.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::{AgentError, FetchOutcome, OfflineAgent};
use crate::http::Request;

/// Where a freshly registered version ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// Installed and activated immediately.
    Active,
    /// Installed; becomes active on the next [`Registration::promote`].
    Waiting,
}

#[derive(Debug, Default)]
struct Slots {
    active: Option<Arc<OfflineAgent>>,
    waiting: Option<Arc<OfflineAgent>>,
}

/// Holds the installed versions of the agent and routes requests to the
/// active one.
///
/// Lifecycle operations (`register`, `promote`) run one at a time; fetches
/// run concurrently with them and with each other.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use offcache::agent::OfflineAgent;
/// use offcache::cache::MemoryStorage;
/// use offcache::config::AgentConfig;
/// use offcache::fetch::StubNetwork;
/// use offcache::host::{Registered, Registration};
/// use offcache::http::{Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), offcache::agent::AgentError> {
/// let storage = Arc::new(MemoryStorage::new());
/// let network = Arc::new(StubNetwork::new().route("/", Response::new(StatusCode::OK)));
/// let registration = Registration::new();
///
/// let v1 = OfflineAgent::new(AgentConfig::new("v1", &["/"]), storage.clone(), network.clone());
/// assert_eq!(registration.register(Arc::new(v1)).await?, Registered::Active);
///
/// let v2 = OfflineAgent::new(AgentConfig::new("v2", &["/"]), storage, network);
/// assert_eq!(registration.register(Arc::new(v2)).await?, Registered::Waiting);
///
/// registration.promote().await?;
/// assert_eq!(registration.active_version().as_deref(), Some("v2"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Registration {
    slots: RwLock<Slots>,
    lifecycle: Mutex<()>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> Option<Arc<OfflineAgent>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut Slots) -> T) -> T {
        f(&mut self.slots.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn active_version(&self) -> Option<String> {
        self.active().map(|a| a.cache_name().to_owned())
    }

    pub fn waiting_version(&self) -> Option<String> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .as_ref()
            .map(|a| a.cache_name().to_owned())
    }

    /// Installs `agent`, then activates it if nothing is active or parks it as
    /// waiting otherwise. A previously waiting version is retired either way,
    /// including one left behind by a failed [`promote`](Self::promote).
    ///
    /// # Errors
    ///
    /// Returns the install (or first activation) error. The failed version is
    /// discarded and the active version, if any, is unaffected.
    pub async fn register(&self, agent: Arc<OfflineAgent>) -> Result<Registered, AgentError> {
        let _guard = self.lifecycle.lock().await;

        agent.install().await?;

        if self.active().is_none() {
            agent.activate().await?;
            let stale = self.with_slots(|s| {
                s.active = Some(agent);
                s.waiting.take()
            });
            if let Some(old) = stale {
                old.retire();
            }
            return Ok(Registered::Active);
        }

        let replaced = self.with_slots(|s| s.waiting.replace(Arc::clone(&agent)));
        if let Some(old) = replaced {
            old.retire();
        }
        info!(cache = %agent.cache_name(), "new version waiting to activate");
        Ok(Registered::Waiting)
    }

    /// Retires the active version and activates the waiting one. Returns
    /// `false` if nothing was waiting.
    ///
    /// # Errors
    ///
    /// If activation fails the waiting version stays waiting and no version is
    /// active until the next successful `promote`; fetches pass through
    /// meanwhile.
    pub async fn promote(&self) -> Result<bool, AgentError> {
        let _guard = self.lifecycle.lock().await;

        let Some(next) = self.with_slots(|s| s.waiting.clone()) else {
            return Ok(false);
        };

        if let Some(old) = self.with_slots(|s| s.active.take()) {
            old.retire();
        }

        if let Err(e) = next.activate().await {
            warn!(cache = %next.cache_name(), error = %e, "promotion failed");
            return Err(e);
        }

        self.with_slots(|s| {
            s.waiting = None;
            s.active = Some(next);
        });
        Ok(true)
    }

    /// Routes a request to the active version; passes it through untouched
    /// when no version is active.
    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        match self.active() {
            Some(agent) => agent.handle_fetch(request).await,
            None => FetchOutcome::PassThrough(request),
        }
    }
}
