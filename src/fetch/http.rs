//! HTTP/1.x client over tokio TCP.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{FetchError, Fetcher};
use crate::cache::BoxFuture;
use crate::http::{Request, Response};

/// Default connect timeout for [`HttpFetcher`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum reply size buffered per request (32 MiB).
const MAX_RESPONSE_SIZE: usize = 32 * 1024 * 1024;

/// Initial read buffer capacity per request.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// Fetches every request from a single origin (`host:port`).
///
/// Each request opens a fresh connection, sends an HTTP/1.0 request with
/// `Connection: close`, and reads the reply to EOF. A refused or timed-out
/// connection is reported as a [`FetchError`], which the agent treats as
/// being offline.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use offcache::fetch::{Fetcher, HttpFetcher};
/// use offcache::http::Request;
///
/// # async fn demo() -> Result<(), offcache::fetch::FetchError> {
/// let network = HttpFetcher::new("127.0.0.1:8000").connect_timeout(Duration::from_secs(2));
/// let response = network.fetch(&Request::get("/")).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    origin: String,
    connect_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    async fn connect(&self) -> Result<TcpStream, FetchError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.origin)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(FetchError::Offline(format!("{}: {e}", self.origin))),
            Err(_) => Err(FetchError::Timeout {
                origin: self.origin.clone(),
            }),
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response, FetchError> {
        let mut stream = self.connect().await?;
        stream.write_all(&request.to_wire(&self.origin)).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                break;
            }
            if buf.len() > MAX_RESPONSE_SIZE {
                warn!(origin = %self.origin, url = %request.url(), "response too large");
                return Err(FetchError::Io(std::io::Error::other("response exceeds size limit")));
            }
        }

        let response = Response::parse(&buf, request.method())?;
        debug!(
            origin = %self.origin,
            method = %request.method(),
            url = %request.url(),
            status = response.status().as_u16(),
            "fetched"
        );
        Ok(response)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
        Box::pin(self.round_trip(request))
    }
}
