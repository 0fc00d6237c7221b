//! Substitution-cipher protection bypass.
//!
//! The protection page ships a ciphertext, a shift, a cookie name and an
//! alphabet. Decoding the ciphertext with a shift that advances by one per
//! character yields the cookie value the page would set before reloading.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::BypassConfig;
use crate::modules::cookies::Cookie;
use crate::modules::events::{BypassEvent, ChallengeKind, EventDispatcher};
use crate::modules::wire::Response;
use crate::session::{RequestMode, RequestSession};

use super::{BypassContext, BypassError, ChallengeBypass};

const MARKERS: [&str; 2] = ["<h1>Stormwall DDoS protection</h1>", "://reports.stormwall.pro"];

static CIPHERTEXT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"const cE = "(?P<value>[^"]*)";"#).unwrap());
static SHIFT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"const cK = (?P<value>[^;]*);").unwrap());
static COOKIE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"const cN = "(?P<value>[^"]*)";"#).unwrap());
static ALPHABET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"var abc="(?P<value>[^"]*)","#).unwrap());

/// Whether a page body belongs to the cipher protection.
pub fn is_cipher_protected(body: &str) -> bool {
    MARKERS.iter().any(|marker| body.contains(marker))
}

/// Alphabet with its reverse index.
#[derive(Debug, Clone)]
pub struct CipherTable {
    alphabet: Vec<char>,
    index: HashMap<char, usize>,
}

impl CipherTable {
    pub fn new(alphabet: &str) -> Self {
        let alphabet: Vec<char> = alphabet.chars().collect();
        let index = alphabet.iter().enumerate().map(|(position, c)| (*c, position)).collect();
        Self { alphabet, index }
    }

    pub fn len(&self) -> usize {
        self.alphabet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphabet.is_empty()
    }

    /// Character `i` moves back by `shift + i` positions, wrapping around the
    /// alphabet. Characters outside the alphabet pass through.
    pub fn decode(&self, shift: i64, ciphertext: &str) -> String {
        self.substitute(ciphertext, |offset| -offset, shift)
    }

    /// Inverse of [`CipherTable::decode`].
    pub fn encode(&self, shift: i64, plaintext: &str) -> String {
        self.substitute(plaintext, |offset| offset, shift)
    }

    fn substitute(&self, text: &str, direction: impl Fn(i64) -> i64, shift: i64) -> String {
        let Ok(len) = i64::try_from(self.alphabet.len()) else {
            return text.to_string();
        };
        if len == 0 {
            return text.to_string();
        }

        let mut offset = shift.rem_euclid(len);
        text.chars()
            .map(|c| {
                let substituted = match self.index.get(&c) {
                    Some(&position) => {
                        let target = (position as i64 + direction(offset)).rem_euclid(len);
                        self.alphabet[target as usize]
                    }
                    None => c,
                };
                offset = (offset + 1) % len;
                substituted
            })
            .collect()
    }
}

/// Values embedded in a cipher protection page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherChallenge {
    pub ciphertext: String,
    pub shift: i64,
    pub cookie_name: String,
    pub alphabet: String,
}

impl CipherChallenge {
    pub fn parse(body: &str) -> Result<Self, BypassError> {
        let ciphertext = capture(&CIPHERTEXT_RE, body, "cE")?;
        let shift = capture(&SHIFT_RE, body, "cK")?
            .trim()
            .parse()
            .map_err(|_| BypassError::ChallengeMarkerNotFound("cK".to_string()))?;
        let cookie_name = capture(&COOKIE_NAME_RE, body, "cN")?;
        let alphabet = capture(&ALPHABET_RE, body, "abc")?;

        Ok(Self {
            ciphertext,
            shift,
            cookie_name,
            alphabet,
        })
    }

    /// Cookie value the page would compute.
    pub fn cookie_value(&self) -> String {
        CipherTable::new(&self.alphabet).decode(self.shift, &self.ciphertext)
    }
}

fn capture(re: &Regex, body: &str, name: &str) -> Result<String, BypassError> {
    re.captures(body)
        .and_then(|caps| caps.name("value"))
        .map(|value| value.as_str().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BypassError::ChallengeMarkerNotFound(name.to_string()))
}

/// Bypass for the substitution-cipher protection.
#[derive(Debug, Clone, Default)]
pub struct CipherBypass {
    config: BypassConfig,
}

impl CipherBypass {
    pub fn new(config: BypassConfig) -> Self {
        Self { config }
    }

    /// Solve an already fetched protection `page` for `url` and replay the
    /// request with the decoded cookie installed.
    pub async fn solve_page(
        &self,
        session: &mut RequestSession,
        url: &str,
        page: &str,
    ) -> Result<Response, BypassError> {
        let url = session.resolve_address(url)?;
        self.solve(session, &url, page, &EventDispatcher::for_bypass(None)).await
    }

    async fn solve(
        &self,
        session: &mut RequestSession,
        url: &Url,
        page: &str,
        events: &EventDispatcher,
    ) -> Result<Response, BypassError> {
        let challenge = CipherChallenge::parse(page)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let ttl = chrono::Duration::from_std(self.config.cipher_cookie_ttl).unwrap_or(chrono::Duration::seconds(30));
        let cookie = Cookie::new(challenge.cookie_name.clone(), challenge.cookie_value(), &host)
            .with_path("/")
            .with_expires(Utc::now() + ttl);
        session.cookies().set(cookie);
        events.dispatch(BypassEvent::CookieInstalled {
            name: challenge.cookie_name,
            host,
        });

        // The replay follows the session's own error policy.
        let mode = RequestMode::from_config(session.config());
        session.add_header("Referer", url.as_str());
        let response = session.send_with_mode(Method::GET, url.as_str(), None, mode).await?;

        if is_cipher_protected(&response.text()) {
            return Err(BypassError::StillProtected { url: url.clone() });
        }
        events.dispatch(BypassEvent::Cleared {
            url: url.clone(),
            attempts: 1,
            timestamp: Utc::now(),
        });
        Ok(response)
    }
}

#[async_trait]
impl ChallengeBypass for CipherBypass {
    fn name(&self) -> &'static str {
        "cipher"
    }

    async fn bypass(
        &self,
        session: &mut RequestSession,
        url: &str,
        ctx: BypassContext,
    ) -> Result<Response, BypassError> {
        let url = session.resolve_address(url)?;
        let events = EventDispatcher::for_bypass(ctx.observer.clone());
        ctx.check_cancelled()?;

        session.ensure_user_agent();
        let mode = RequestMode {
            follow_redirects: session.config().allow_auto_redirect,
            ignore_protocol_errors: true,
        };
        let response = session.send_with_mode(Method::GET, url.as_str(), None, mode).await?;
        let page = response.text();
        if !is_cipher_protected(&page) {
            return Ok(response);
        }

        events.dispatch(BypassEvent::ChallengeDetected {
            url: url.clone(),
            kind: ChallengeKind::Cipher,
            status: response.status(),
        });
        ctx.check_cancelled()?;

        let result = self.solve(session, &url, &page, &events).await;
        if let Err(err) = &result {
            events.dispatch(BypassEvent::Failed {
                url,
                reason: err.to_string(),
            });
        }
        result
    }
}
