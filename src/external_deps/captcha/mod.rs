//! Captcha capability.
//!
//! The challenge bypass never talks to a solving service directly. Callers
//! hand it a [`CaptchaProvider`] that turns a reCAPTCHA site key and page
//! address into a response token.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Details describing the captcha a protected page issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaTask {
    pub site_key: String,
    pub page_url: Url,
    /// `action` attribute of the challenge form, when the page has one.
    pub action: Option<String>,
}

impl CaptchaTask {
    pub fn new(site_key: impl Into<String>, page_url: Url) -> Self {
        Self {
            site_key: site_key.into(),
            page_url,
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Resolved captcha token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    pub token: String,
}

impl CaptchaSolution {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha solvers.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha provider request failed: {0}")]
    Provider(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha provider returned an empty token")]
    EmptyToken,
}

/// Ask `provider` for a token, giving up after `limit`.
pub async fn solve_within(
    provider: &dyn CaptchaProvider,
    task: &CaptchaTask,
    limit: Duration,
) -> CaptchaResult {
    let solution = tokio::time::timeout(limit, provider.solve(task))
        .await
        .map_err(|_| CaptchaError::Timeout(limit))??;
    if solution.token.is_empty() {
        return Err(CaptchaError::EmptyToken);
    }
    log::debug!(
        "captcha provider {} solved site key {} for {}",
        provider.name(),
        task.site_key,
        task.page_url
    );
    Ok(solution)
}
