//! Challenge bypasses.
//!
//! Each bypass drives a [`RequestSession`] through one protection system and
//! hands back the first unprotected response.

pub mod cipher;
pub mod js_challenge;

pub use cipher::{CipherBypass, CipherChallenge, CipherTable, is_cipher_protected};
pub use js_challenge::JsChallengeBypass;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::challenges::core::{Cancelled, ChallengeParseError};
use crate::error::HttpError;
use crate::external_deps::captcha::{CaptchaError, CaptchaProvider};
use crate::external_deps::interpreters::InterpreterError;
use crate::modules::events::BypassObserver;
use crate::modules::wire::Response;
use crate::session::RequestSession;

/// Per-call collaborators of a bypass.
#[derive(Clone, Default)]
pub struct BypassContext {
    pub observer: Option<BypassObserver>,
    pub cancel: Option<CancellationToken>,
    pub captcha: Option<Arc<dyn CaptchaProvider>>,
}

impl BypassContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: BypassObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_captcha(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
        self.captcha = Some(provider);
        self
    }

    fn check_cancelled(&self) -> Result<(), BypassError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(BypassError::Cancelled),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for BypassContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassContext")
            .field("observer", &self.observer.is_some())
            .field("cancel", &self.cancel)
            .field("captcha", &self.captcha.as_ref().map(|provider| provider.name()))
            .finish()
    }
}

/// Common interface of the protection bypasses.
#[async_trait]
pub trait ChallengeBypass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch `url` through the protection, returning the cleared response.
    async fn bypass(
        &self,
        session: &mut RequestSession,
        url: &str,
        ctx: BypassContext,
    ) -> Result<Response, BypassError>;
}

/// Bypass failures.
#[derive(Debug, Error)]
pub enum BypassError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("captcha solving failed: {0}")]
    Captcha(#[from] CaptchaError),
    #[error("challenge evaluation failed: {0}")]
    Interpreter(#[source] InterpreterError),
    #[error("protection still present after {attempts} attempt(s)")]
    RateLimitExceeded { attempts: u32 },
    #[error("protection page carries an unknown challenge type")]
    UnknownChallengeType,
    #[error("captcha challenge received but no captcha provider was supplied")]
    CaptchaCapabilityMissing,
    #[error("challenge marker not found: {0}")]
    ChallengeMarkerNotFound(String),
    #[error("bypass cancelled")]
    Cancelled,
    #[error("{url} is still protected after the challenge was solved")]
    StillProtected { url: Url },
}

impl From<InterpreterError> for BypassError {
    fn from(err: InterpreterError) -> Self {
        match err {
            InterpreterError::MissingMarker(name) => BypassError::ChallengeMarkerNotFound(name.to_string()),
            other => BypassError::Interpreter(other),
        }
    }
}

impl From<ChallengeParseError> for BypassError {
    fn from(err: ChallengeParseError) -> Self {
        BypassError::ChallengeMarkerNotFound(err.marker().to_string())
    }
}

impl From<Cancelled> for BypassError {
    fn from(_: Cancelled) -> Self {
        BypassError::Cancelled
    }
}
