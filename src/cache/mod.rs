//! Versioned cache stores keyed by request identity.
//!
//! The agent talks to storage only through two traits:
//!
//! - [`CacheStorage`]: the set of named stores (open-or-create, enumerate,
//!   delete, search across all stores).
//! - [`Cache`]: a single named store mapping [`CacheKey`] to [`Response`].
//!
//! Both return boxed `Send` futures so implementations may suspend on real
//! I/O. [`MemoryStorage`] is the in-process implementation.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::http::{Method, Request, Response};

pub mod memory;

pub use memory::MemoryStorage;

/// A boxed, `Send` future borrowed for `'a`, as returned by the storage traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised by a cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store `{cache}` is full ({limit} entries)")]
    QuotaExceeded { cache: String, limit: usize },

    #[error("cache store `{0}` has been deleted")]
    Deleted(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The identity a response is stored under: request method plus
/// origin-form URL (query included, fragment excluded).
///
/// # Examples
///
/// ```
/// use offcache::cache::CacheKey;
/// use offcache::http::Request;
///
/// let key = CacheKey::from(&Request::get("/static/app.js#main"));
/// assert_eq!(key, CacheKey::for_url("/static/app.js"));
/// assert_eq!(key.to_string(), "GET /static/app.js");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    /// Key for a `GET` of `url`, normalized the same way as [`Request`] targets.
    pub fn for_url(url: impl AsRef<str>) -> Self {
        Self::from(&Request::get(url))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl From<&Request> for CacheKey {
    fn from(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            url: request.url().to_owned(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A single named store of request/response pairs.
pub trait Cache: Send + Sync {
    /// The store's name (its cache version identifier).
    fn name(&self) -> &str;

    /// Looks up the response stored for `key`.
    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Option<Response>, CacheError>>;

    /// Stores `response` under `key`, replacing any previous entry.
    fn put(&self, key: CacheKey, response: Response) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Stores every pair or none of them.
    fn put_all(&self, entries: Vec<(CacheKey, Response)>) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Keys currently stored, in insertion order.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>>;
}

/// The collection of named stores owned by one agent.
pub trait CacheStorage: Send + Sync {
    /// Opens the store called `name`, creating it if absent.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn Cache>, CacheError>>;

    /// Returns `true` if a store called `name` exists.
    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Deletes the store called `name`. Deleting an absent store is a no-op
    /// returning `false`.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Store names in creation order.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>>;

    /// Searches every store, oldest first, for `key`.
    fn match_any<'a>(
        &'a self,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<Response>, CacheError>>;
}
