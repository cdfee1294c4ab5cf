//! Offline proxy: an HTTP/1.1 front door that routes every request through
//! the active agent version.
//!
//! Requests the agent does not intercept are forwarded to the origin as-is.
//! When the agent intercepts a request but has nothing to offer (offline and
//! uncached), the proxy answers `504 Gateway Timeout`, which is what the
//! client would have seen without the agent.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::agent::{FetchOutcome, ResponseSource};
use crate::config::ProxyConfig;
use crate::fetch::Fetcher;
use crate::host::Registration;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the proxy server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a buffered client request (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The offline proxy server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use offcache::config::ProxyConfig;
/// use offcache::fetch::HttpFetcher;
/// use offcache::host::Registration;
/// use offcache::server::ProxyServer;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ProxyConfig::new("127.0.0.1:8080", "127.0.0.1:8000");
/// let network = Arc::new(HttpFetcher::new(&config.origin));
/// let registration = Arc::new(Registration::new());
///
/// let server = ProxyServer::bind(&config).await?;
/// server.run(registration, network).await?;
/// # Ok(())
/// # }
/// ```
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// Binds the proxy to `config.listen`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(config: &ProxyConfig) -> Result<Self, ServerError> {
        let addr = config.listen.as_str();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the process ends, one task per connection.
    ///
    /// `network` carries the requests the agent passes through.
    pub async fn run(
        self,
        registration: Arc<Registration>,
        network: Arc<dyn Fetcher>,
    ) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "offline proxy listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let registration = Arc::clone(&registration);
            let network = Arc::clone(&network);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, registration, network).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Produces the client-facing response for one request.
pub async fn respond(
    registration: &Registration,
    network: &dyn Fetcher,
    request: Request,
) -> Response {
    match registration.fetch(request).await {
        FetchOutcome::PassThrough(request) => match network.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url(), error = %e, "pass-through request failed");
                Response::new(StatusCode::BAD_GATEWAY).body("Bad Gateway")
            }
        },
        FetchOutcome::Respond(served) => {
            if served.source != ResponseSource::Network {
                debug!(source = ?served.source, "served offline");
            }
            served.response.unwrap_or_else(|| {
                Response::new(StatusCode::GATEWAY_TIMEOUT)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body("Offline and not cached")
            })
        }
    }
}

// Serves one client connection, one request per loop iteration, until the
// peer closes or asks for `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registration: Arc<Registration>,
    network: Arc<dyn Fetcher>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PAYLOAD_TOO_LARGE).body("Request entity too large");
            stream.write_all(&response.to_wire(false)).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}"));
                stream.write_all(&response.to_wire(false)).await?;
                break;
            }
        };

        let total_needed = body_offset + request.content_length().unwrap_or(0);
        if buf.len() < total_needed {
            continue;
        }

        let mut consumed = buf.split_to(total_needed);
        let body = consumed.split_off(body_offset).freeze();
        let request = request.with_body(body);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            url = %request.url(),
            "dispatching request"
        );

        let response = respond(&registration, network.as_ref(), request).await;
        stream.write_all(&response.to_wire(keep_alive)).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}
