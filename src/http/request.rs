//! HTTP requests: built in code or parsed from HTTP/1.1 wire bytes with [`httparse`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An outbound HTTP request as seen by the agent.
///
/// The target is kept in origin-form (`/path?query`). Absolute-form targets
/// (`http://host/path`) and fragments are normalized away on construction, so
/// two requests for the same resource always compare equal.
///
/// # Examples
///
/// ```
/// use offcache::http::{Method, Request};
///
/// let req = Request::get("http://app.local/static/app.js?v=3#top");
/// assert_eq!(req.method(), &Method::Get);
/// assert_eq!(req.url(), "/static/app.js?v=3");
/// assert_eq!(req.path(), "/static/app.js");
/// assert_eq!(req.query(), Some("v=3"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    url: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers accepted per request head.
    const MAX_HEADERS: usize = 64;

    pub fn new(method: Method, url: impl AsRef<str>) -> Self {
        Self {
            method,
            url: normalize_target(url.as_ref()),
            version: 1,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl AsRef<str>) -> Self {
        Self::new(Method::Get, url)
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

    /// Parses an HTTP/1.1 request head from `buf`.
    ///
    /// Returns the request (with an empty body) and the offset at which the
    /// body begins. Callers attach the body with [`Request::with_body`] once
    /// `Content-Length` bytes are buffered.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head is not fully buffered yet.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path, or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };
        let target = raw.path.ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut request = Self::new(method, target);
        request.version = version;
        request.headers = Headers::from_raw(raw.headers);
        Ok((request, body_offset))
    }

    /// Replaces the body in-place; used after [`Request::parse`].
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The origin-form target, query included.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The target without its query string.
    pub fn path(&self) -> &str {
        match self.url.find('?') {
            Some(pos) => &self.url[..pos],
            None => &self.url,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.url.find('?').map(|pos| &self.url[pos + 1..])
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 only with an explicit header.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.content_length()
    }

    /// Serializes the request for sending to `host`.
    ///
    /// Outbound requests are written as HTTP/1.0 with `Connection: close` so
    /// the origin never chunks the reply and it can be read to EOF.
    pub fn to_wire(&self, host: &str) -> BytesMut {
        let mut headers = self.headers.clone();
        headers.set("Host", host);
        headers.set("Connection", "close");
        headers.remove("content-length");

        let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + self.body.len());
        buf.put(format!("{} {} HTTP/1.0\r\n", self.method, self.url).as_bytes());
        buf.put(headers.to_string().as_bytes());
        if !self.body.is_empty() || !matches!(self.method, Method::Get | Method::Head) {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.clone());
        buf
    }
}

// Reduces any request target to origin-form without a fragment.
fn normalize_target(target: &str) -> String {
    let target = target.split('#').next().unwrap_or_default();

    let target = ["http://", "https://"]
        .iter()
        .find_map(|scheme| target.strip_prefix(scheme))
        .map(|rest| match rest.find(['/', '?']) {
            Some(pos) => &rest[pos..],
            None => "",
        })
        .unwrap_or(target);

    if target.is_empty() {
        "/".to_owned()
    } else if target.starts_with('?') {
        format!("/{target}")
    } else {
        target.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.url(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_absolute_form_target() {
        let raw = b"GET http://app.local/static/site.css?v=2 HTTP/1.1\r\nHost: app.local\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.url(), "/static/site.css?v=2");
        assert_eq!(req.path(), "/static/site.css");
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_offset_points_past_head() {
        let raw = b"POST /events HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&raw[offset..], b"hello");
    }

    #[test]
    fn normalizes_targets() {
        assert_eq!(normalize_target("http://host"), "/");
        assert_eq!(normalize_target("https://host?x=1"), "/?x=1");
        assert_eq!(normalize_target("/page#section"), "/page");
        assert_eq!(normalize_target(""), "/");
    }

    #[test]
    fn wire_format_forces_close() {
        let req = Request::get("/a.js").header("Connection", "keep-alive");
        let wire = req.to_wire("origin:8000");
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("GET /a.js HTTP/1.0\r\n"));
        assert!(text.contains("Host: origin:8000\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(!text.contains("Content-Length"));
    }
}
