//! HTTP/1.1 request framing.
//!
//! Headers are kept in a [`HeaderList`] so the order they were first added in
//! is the order they hit the wire, while later writers can still override a
//! value regardless of name casing.

mod response;

pub use response::{KeepAliveHints, Response};
pub(crate) use response::read_response;

use http::Method;
use url::Url;

/// Ordered, case-insensitive header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`, keeping its original position on replace.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => self.entries[index].1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Append without replacing, for repeated headers such as `Set-Cookie`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|index| self.entries[index].1.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.position(name)?;
        let (_, value) = self.entries.remove(index);
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        Some(value)
    }

    /// Apply every entry of `other` on top of this list.
    pub fn merge(&mut self, other: &HeaderList) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }
}

/// Request line plus header block, terminated by the blank line.
pub fn request_head(method: &Method, url: &Url, headers: &HeaderList) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", method, path_and_query(url));
    for (name, value) in headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// `Host` header value; the port is included only when it is not the
/// scheme default.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Methods whose requests carry `Content-Length`.
pub fn may_carry_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    )
}

/// `Accept-Language` for a culture name: `de-DE` becomes
/// `de-DE,de;q=0.8,en-US;q=0.6,en;q=0.4`. English cultures are sent as-is.
pub fn accept_language(culture: &str) -> String {
    let culture = culture.trim();
    let language = culture.split(['-', '_']).next().unwrap_or(culture);
    if language.eq_ignore_ascii_case("en") {
        return culture.to_string();
    }
    format!("{culture},{language};q=0.8,en-US;q=0.6,en;q=0.4")
}

pub fn accept_charset(charset: &str) -> String {
    let charset = charset.trim();
    if charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8") {
        "utf-8;q=0.7,*;q=0.3".to_string()
    } else {
        format!("{},utf-8;q=0.7,*;q=0.3", charset.to_ascii_lowercase())
    }
}
