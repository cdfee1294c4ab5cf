//! Ordered, case-insensitive header list for stored and replayed responses.

use std::fmt;

/// Connection-scoped header names. They describe one hop, so they are never
/// written to a cache store or replayed from one.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

/// Whether `name` is connection-scoped (see [`HOP_BY_HOP`]).
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// A case-insensitive, multi-value HTTP header list.
///
/// Entries keep their insertion order so a cached response replays its
/// headers exactly as the network delivered them.
///
/// # Examples
///
/// ```
/// use offcache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.append("Content-Type", "text/css");
/// headers.append("Vary", "Accept");
/// headers.append("Vary", "Origin");
/// headers.append("Connection", "keep-alive");
///
/// assert_eq!(headers.get("content-type"), Some("text/css"));
/// assert_eq!(headers.get_all("vary").count(), 2);
///
/// headers.strip_hop_by_hop();
/// assert!(!headers.contains("connection"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Copies the fields httparse produced. Values that are not UTF-8 are skipped.
    pub(crate) fn from_raw(raw: &[httparse::Header<'_>]) -> Self {
        raw.iter()
            .filter_map(|h| Some((h.name, std::str::from_utf8(h.value).ok()?)))
            .collect()
    }

    /// Adds an entry, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value for `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    ///
    /// The result borrows only from `self`, never from `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drops all entries named `name`; returns `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// The declared body length, if present and numeric.
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// Drops every connection-scoped entry, leaving only what is safe to
    /// persist and replay on another connection.
    pub fn strip_hop_by_hop(&mut self) {
        self.entries.retain(|(k, _)| !is_hop_by_hop(k));
    }

    /// Entries that survive [`strip_hop_by_hop`](Self::strip_hop_by_hop),
    /// without modifying `self`.
    pub fn end_to_end(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| !is_hop_by_hop(k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}
