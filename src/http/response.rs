//! HTTP responses: a fluent builder, HTTP/1.1 serialization, and parsing of
//! complete replies read from the network.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method, StatusCode};

/// Errors produced while reading a response off the wire.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete: {0}")]
    Incomplete(&'static str),

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),
}

/// An HTTP response, either fresh from the network or replayed from a cache store.
///
/// The body is a [`Bytes`] buffer. A response handed to a caller is consumed
/// by it, so anything that must also be persisted is copied first with
/// [`duplicate`](Self::duplicate).
///
/// # Examples
///
/// ```
/// use offcache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "text/css")
///     .body("body { margin: 0 }");
///
/// let wire = response.to_wire(true);
/// let text = std::str::from_utf8(&wire).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 18\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Maximum number of headers accepted when parsing a reply.
    const MAX_HEADERS: usize = 96;

    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns an independent copy suitable for persisting while `self` is
    /// handed back to the caller.
    pub fn duplicate(&self) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            body: Bytes::copy_from_slice(&self.body),
        }
    }

    /// Parses a complete HTTP/1.x reply to a `method` request.
    ///
    /// Replies to `HEAD`, and `1xx`, `204` and `304` replies, never carry a
    /// body whatever their `Content-Length` says. Otherwise the body is
    /// delimited by `Content-Length` when present, or is the rest of `buf`
    /// (the connection was read to EOF). Hop-by-hop headers are dropped so
    /// the result can be stored and replayed as-is.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`]: the head, or the advertised body, is truncated.
    /// - [`ResponseError::Parse`]: the data is not an HTTP response.
    pub fn parse(buf: &[u8], method: &Method) -> Result<Self, ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete("status line or headers")),
        };
        let code = raw.code.ok_or(ResponseError::Incomplete("status code"))?;

        let mut header_map = Headers::from_raw(raw.headers);
        let content_length = header_map.content_length();
        header_map.strip_hop_by_hop();

        let bodyless = *method == Method::Head || matches!(code, 100..=199 | 204 | 304);
        let rest = &buf[body_offset..];
        let body = match content_length {
            _ if bodyless => &[][..],
            Some(len) if rest.len() < len => return Err(ResponseError::Incomplete("body")),
            Some(len) => &rest[..len],
            None => rest,
        };

        Ok(Self {
            status: StatusCode::from_u16(code),
            headers: header_map,
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Serializes the response in HTTP/1.1 wire format.
    ///
    /// `Content-Length` and `Connection` are always written by this method;
    /// any stored values for them are replaced.
    pub fn to_wire(&self, keep_alive: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + self.body.len());

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.end_to_end() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        let connection = if keep_alive { "keep-alive" } else { "close" };
        buf.put(format!("Connection: {connection}\r\n").as_bytes());
        buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.clone());

        buf
    }
}
