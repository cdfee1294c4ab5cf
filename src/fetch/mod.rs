//! The network capability the agent issues outbound requests through.
//!
//! - [`Fetcher`]: the trait the agent depends on.
//! - [`HttpFetcher`]: plain HTTP/1.x over a tokio TCP connection to one origin.
//! - [`StubNetwork`]: a scripted in-memory network for tests and demos.

use thiserror::Error;

use crate::cache::BoxFuture;
use crate::http::{Request, Response, response::ResponseError};

pub mod http;
pub mod stub;

pub use http::HttpFetcher;
pub use stub::StubNetwork;

/// A request that could not complete at the transport level.
///
/// A response of any status (including 4xx/5xx) is not a `FetchError`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unreachable: {0}")]
    Offline(String),

    #[error("connecting to {origin} timed out")]
    Timeout { origin: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Malformed(#[from] ResponseError),
}

/// Performs a request over the network.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}
