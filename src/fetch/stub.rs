//! Scripted in-memory network.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use super::{FetchError, Fetcher};
use crate::cache::{BoxFuture, CacheKey};
use crate::http::{Request, Response, StatusCode};

#[derive(Debug, Default)]
struct Script {
    offline: bool,
    routes: HashMap<CacheKey, Response>,
    failing: HashSet<CacheKey>,
    calls: Vec<CacheKey>,
}

/// A [`Fetcher`] that answers from a route table.
///
/// Unrouted requests get `404 Not Found`. While offline, or for URLs marked
/// with [`fail`](Self::fail), requests fail with [`FetchError::Offline`].
/// Every attempt is recorded, including failed ones.
///
/// # Examples
///
/// ```
/// use offcache::fetch::{Fetcher, StubNetwork};
/// use offcache::http::{Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let network = StubNetwork::new().route("/", Response::new(StatusCode::OK).body("home"));
/// assert!(network.fetch(&Request::get("/")).await.is_ok());
///
/// network.set_offline(true);
/// assert!(network.fetch(&Request::get("/")).await.is_err());
/// assert_eq!(network.calls().len(), 2);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StubNetwork {
    script: Arc<Mutex<Script>>,
}

impl StubNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `GET url` with `response`.
    #[must_use]
    pub fn route(self, url: &str, response: Response) -> Self {
        self.set_route(url, response);
        self
    }

    pub fn set_route(&self, url: &str, response: Response) {
        self.with(|s| s.routes.insert(CacheKey::for_url(url), response));
    }

    pub fn set_offline(&self, offline: bool) {
        self.with(|s| s.offline = offline);
    }

    /// Makes `GET url` fail at the transport level.
    pub fn fail(&self, url: &str) {
        self.with(|s| s.failing.insert(CacheKey::for_url(url)));
    }

    /// Every request attempted so far, in order.
    pub fn calls(&self) -> Vec<CacheKey> {
        self.with(|s| s.calls.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut script)
    }

    fn answer(&self, request: &Request) -> Result<Response, FetchError> {
        let key = CacheKey::from(request);
        self.with(|s| {
            s.calls.push(key.clone());
            if s.offline || s.failing.contains(&key) {
                return Err(FetchError::Offline(key.to_string()));
            }
            Ok(s
                .routes
                .get(&key)
                .map(Response::duplicate)
                .unwrap_or_else(|| Response::new(StatusCode::NOT_FOUND)))
        })
    }
}

impl Fetcher for StubNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
        Box::pin(async move {
            // Suspend once so callers observe a real await point.
            tokio::task::yield_now().await;
            self.answer(request)
        })
    }
}
