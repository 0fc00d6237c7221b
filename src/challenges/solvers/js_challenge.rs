//! JS-arithmetic challenge bypass.
//!
//! Requests the page in manual mode; while the response is a protection page
//! it solves the arithmetic (or captcha) challenge, waits out the page timer,
//! submits the clearance query and inspects the outcome. The loop is bounded
//! by [`BypassConfig::max_retries`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use http::Method;
use url::Url;

use crate::challenges::core::{
    CLEARANCE_COOKIE, CaptchaPage, JsChallengePage, anti_bot_headers, classify, interruptible_delay,
    is_protected_response,
};
use crate::config::BypassConfig;
use crate::error::{HttpError, ProtocolError};
use crate::external_deps::captcha::{CaptchaTask, solve_within};
use crate::external_deps::interpreters::{ArithmeticChallenge, ArithmeticEvaluator, NativeArithmeticEvaluator};
use crate::modules::events::{BypassEvent, ChallengeKind, EventDispatcher};
use crate::modules::wire::Response;
use crate::session::{RequestMode, RequestSession};

use super::{BypassContext, BypassError, ChallengeBypass};

/// Bypass for JS-arithmetic protection pages.
pub struct JsChallengeBypass {
    config: BypassConfig,
    evaluator: Arc<dyn ArithmeticEvaluator>,
}

impl Default for JsChallengeBypass {
    fn default() -> Self {
        Self::new(BypassConfig::default())
    }
}

impl JsChallengeBypass {
    /// Bypass using the native evaluator.
    pub fn new(config: BypassConfig) -> Self {
        Self {
            config,
            evaluator: Arc::new(NativeArithmeticEvaluator::new()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ArithmeticEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &BypassConfig {
        &self.config
    }

    async fn run(
        &self,
        session: &mut RequestSession,
        url: &Url,
        ctx: &BypassContext,
        events: &EventDispatcher,
    ) -> Result<Response, BypassError> {
        session.ensure_user_agent();
        let budget = self.config.attempt_budget();
        let mut attempt = 0u32;

        loop {
            if budget.is_some_and(|budget| attempt >= budget) {
                return Err(BypassError::RateLimitExceeded { attempts: attempt });
            }
            ctx.check_cancelled()?;
            attempt += 1;
            events.dispatch(BypassEvent::Attempt {
                url: url.clone(),
                attempt,
                budget,
            });

            let response = fetch(session, url, url.as_str(), RequestMode::MANUAL).await?;
            if !is_protected_response(&response) {
                events.dispatch(BypassEvent::Cleared {
                    url: url.clone(),
                    attempts: attempt,
                    timestamp: Utc::now(),
                });
                return Ok(response);
            }

            session.cookies().expire(url, CLEARANCE_COOKIE);

            let body = response.text();
            let kind = classify(&body).ok_or(BypassError::UnknownChallengeType)?;
            events.dispatch(BypassEvent::ChallengeDetected {
                url: url.clone(),
                kind,
                status: response.status(),
            });

            let outcome = match kind {
                ChallengeKind::JsArithmetic => self.submit_arithmetic(session, url, &body, ctx, events).await?,
                ChallengeKind::Captcha => self.submit_captcha(session, url, &body, ctx, events).await?,
                ChallengeKind::Cipher => return Err(BypassError::UnknownChallengeType),
            };

            let retry_reason = match outcome.status() {
                403 | 503 => format!("challenge served again with status {}", outcome.status()),
                300..=399 if session.cookies().contains(url, CLEARANCE_COOKIE) => {
                    let Some(next) = outcome.redirect_address().cloned() else {
                        events.dispatch(BypassEvent::Cleared {
                            url: url.clone(),
                            attempts: attempt,
                            timestamp: Utc::now(),
                        });
                        return Ok(outcome);
                    };
                    // More redirects may follow the cleared one.
                    let mode = RequestMode {
                        follow_redirects: session.config().allow_auto_redirect,
                        ignore_protocol_errors: true,
                    };
                    let followed = fetch(session, &next, url.as_str(), mode).await?;
                    if !is_protected_response(&followed) {
                        events.dispatch(BypassEvent::Cleared {
                            url: url.clone(),
                            attempts: attempt,
                            timestamp: Utc::now(),
                        });
                        return Ok(followed);
                    }
                    format!("{next} is still protected")
                }
                300..=399 => "redirected without a clearance cookie".to_string(),
                other => format!("unexpected status {other} after submitting the solution"),
            };

            events.dispatch(BypassEvent::Retry {
                url: url.clone(),
                attempt,
                reason: retry_reason,
            });
        }
    }

    async fn submit_arithmetic(
        &self,
        session: &mut RequestSession,
        url: &Url,
        body: &str,
        ctx: &BypassContext,
        events: &EventDispatcher,
    ) -> Result<Response, BypassError> {
        let page = JsChallengePage::parse(body)?;
        let challenge = ArithmeticChallenge::extract(&page.script, url.host_str().unwrap_or_default())?;
        let answer = challenge.answer(self.evaluator.as_ref())?;
        log::debug!("{} evaluator answered {answer} for {url}", self.evaluator.name());

        let solution = page.into_solution(answer, challenge.integer_answer);
        let target = solution.clearance_url(url).map_err(HttpError::from)?;

        events.dispatch(BypassEvent::Waiting { delay: self.config.delay });
        interruptible_delay(self.config.delay, ctx.cancel.as_ref()).await?;

        events.dispatch(BypassEvent::SolutionSubmitted { url: target.clone() });
        fetch(session, &target, url.as_str(), RequestMode::MANUAL).await
    }

    async fn submit_captcha(
        &self,
        session: &mut RequestSession,
        url: &Url,
        body: &str,
        ctx: &BypassContext,
        events: &EventDispatcher,
    ) -> Result<Response, BypassError> {
        let page = CaptchaPage::parse(body)?;
        let provider = ctx.captcha.as_ref().ok_or(BypassError::CaptchaCapabilityMissing)?;

        let task = CaptchaTask::new(page.site_key, url.clone()).with_action(page.action.clone());
        let solution = solve_within(provider.as_ref(), &task, self.config.captcha_timeout).await?;

        let target = origin_url(url, &page.action)?;
        events.dispatch(BypassEvent::SolutionSubmitted { url: target.clone() });
        session.add_url_param("g-recaptcha-response", solution.token);
        fetch(session, &target, url.as_str(), RequestMode::MANUAL).await
    }
}

#[async_trait]
impl ChallengeBypass for JsChallengeBypass {
    fn name(&self) -> &'static str {
        "js-challenge"
    }

    async fn bypass(
        &self,
        session: &mut RequestSession,
        url: &str,
        ctx: BypassContext,
    ) -> Result<Response, BypassError> {
        let url = session.resolve_address(url)?;
        let events = EventDispatcher::for_bypass(ctx.observer.clone());

        let result = self.run(session, &url, &ctx, &events).await;
        if let Err(err) = &result {
            events.dispatch(BypassEvent::Failed {
                url,
                reason: err.to_string(),
            });
        }
        result
    }
}

/// GET carrying browser navigation headers.
async fn fetch(
    session: &mut RequestSession,
    url: &Url,
    referer: &str,
    mode: RequestMode,
) -> Result<Response, BypassError> {
    for (name, value) in anti_bot_headers(referer) {
        session.add_header(name, value);
    }
    Ok(session.send_with_mode(Method::GET, url.as_str(), None, mode).await?)
}

/// `{scheme}://{host}:{port}{path}` for the challenged address.
fn origin_url(url: &Url, path: &str) -> Result<Url, BypassError> {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    let address = format!("{}://{}:{}{}", url.scheme(), host, port, path);
    Url::parse(&address)
        .map_err(|err| HttpError::from(ProtocolError::InvalidAddress(format!("{address}: {err}"))).into())
}
