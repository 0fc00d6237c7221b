//! Cookie storage shared by the engine and the challenge bypasses.
//!
//! The jar keeps cookies in memory behind an `RwLock` so a store handle can be
//! shared between sessions that should see the same clearance cookies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, RwLock};
use url::Url;

/// Single stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercase domain without a leading dot.
    pub domain: String,
    /// Only sent to exactly `domain`, not its subdomains.
    pub host_only: bool,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    /// Host-only cookie for `host` with path `/`.
    pub fn new(name: impl Into<String>, value: impl Into<String>, host: &str) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: normalize_domain(host),
            host_only: true,
            path: "/".to_string(),
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Parse a `Set-Cookie` header received from `url`.
    pub fn parse(header: &str, url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'), host);
        cookie.path = default_path(url);
        let mut max_age = None;

        for attribute in parts {
            let (key, raw) = match attribute.split_once('=') {
                Some((key, raw)) => (key.trim(), raw.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !raw.is_empty() => {
                    let domain = normalize_domain(raw);
                    // Refuse cookies for unrelated domains.
                    if !domain_matches(&domain, false, host) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if raw.starts_with('/') => cookie.path = raw.to_string(),
                "expires" => {
                    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
                        cookie.expires = Some(parsed.with_timezone(&Utc));
                    } else if let Ok(parsed) =
                        chrono::NaiveDateTime::parse_from_str(raw, "%a, %d-%b-%Y %H:%M:%S GMT")
                    {
                        cookie.expires = Some(parsed.and_utc());
                    }
                }
                "max-age" => max_age = raw.parse::<i64>().ok(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires.
        if let Some(seconds) = max_age {
            cookie.expires = Some(max_age_expiry(Utc::now(), seconds));
        }
        Some(cookie)
    }

    fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        !self.is_expired(now)
            && domain_matches(&self.domain, self.host_only, host)
            && path_matches(&self.path, url.path())
            && (!self.secure || url.scheme() == "https")
    }

    fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

/// Store contract the engine and bypasses rely on.
pub trait CookieStore: Send + Sync {
    /// `Cookie` header value for `url`, or `None` when nothing applies.
    fn cookie_header(&self, url: &Url) -> Option<String>;

    fn get(&self, url: &Url, name: &str) -> Option<Cookie>;

    /// Insert or replace a cookie. Always allowed, even when locked.
    fn set(&self, cookie: Cookie);

    /// Mark every cookie called `name` that applies to `url` as expired.
    fn expire(&self, url: &Url, name: &str);

    fn contains(&self, url: &Url, name: &str) -> bool {
        self.get(url, name).is_some()
    }

    /// Record `Set-Cookie` headers from a server response.
    fn store_response_cookies(&self, url: &Url, headers: &[&str]);
}

/// In-memory cookie jar.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    inner: Arc<RwLock<JarState>>,
}

#[derive(Debug, Default)]
struct JarState {
    cookies: Vec<Cookie>,
    locked: bool,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// When locked, server responses can no longer modify the jar.
    pub fn set_locked(&self, locked: bool) {
        if let Ok(mut state) = self.inner.write() {
            state.locked = locked;
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.read().map(|state| state.locked).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|state| state.cookies.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.write() {
            state.cookies.clear();
        }
    }

    fn insert(state: &mut JarState, cookie: Cookie) {
        let now = Utc::now();
        state.cookies.retain(|existing| !existing.same_identity(&cookie));
        // An already expired cookie is a deletion request.
        if !cookie.is_expired(now) {
            state.cookies.push(cookie);
        }
    }
}

impl CookieStore for CookieJar {
    fn cookie_header(&self, url: &Url) -> Option<String> {
        let state = self.inner.read().ok()?;
        let now = Utc::now();
        let mut matching: Vec<&Cookie> = state.cookies.iter().filter(|cookie| cookie.matches(url, now)).collect();
        if matching.is_empty() {
            return None;
        }
        // Longer paths first; stable sort keeps insertion order otherwise.
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        let pairs: Vec<String> = matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect();
        Some(pairs.join("; "))
    }

    fn get(&self, url: &Url, name: &str) -> Option<Cookie> {
        let state = self.inner.read().ok()?;
        let now = Utc::now();
        state
            .cookies
            .iter()
            .find(|cookie| cookie.name == name && cookie.matches(url, now))
            .cloned()
    }

    fn set(&self, cookie: Cookie) {
        if let Ok(mut state) = self.inner.write() {
            Self::insert(&mut state, cookie);
        }
    }

    fn expire(&self, url: &Url, name: &str) {
        let Ok(mut state) = self.inner.write() else {
            return;
        };
        let now = Utc::now();
        let expired_at = now - ChronoDuration::seconds(1);
        for cookie in state.cookies.iter_mut() {
            if cookie.name == name && cookie.matches(url, now) {
                cookie.expires = Some(expired_at);
            }
        }
    }

    fn store_response_cookies(&self, url: &Url, headers: &[&str]) {
        let Ok(mut state) = self.inner.write() else {
            return;
        };
        if state.locked {
            return;
        }
        for header in headers {
            match Cookie::parse(header, url) {
                Some(cookie) => Self::insert(&mut state, cookie),
                None => log::debug!("ignoring unusable Set-Cookie from {url}: {header}"),
            }
        }
    }
}

/// Expiry for a `Max-Age` value, saturating instead of overflowing.
fn max_age_expiry(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    let saturated = if seconds < 0 { DateTime::<Utc>::MIN_UTC } else { DateTime::<Utc>::MAX_UTC };
    ChronoDuration::try_seconds(seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(saturated)
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn domain_matches(domain: &str, host_only: bool, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if host == domain {
        return true;
    }
    !host_only && host.ends_with(domain) && host[..host.len() - domain.len()].ends_with('.')
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}
