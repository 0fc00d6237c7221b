//! Challenge detection and page parsing.
//!
//! Decides whether a response is a protection page, which kind of challenge
//! it carries, and extracts the parameters the bypass loops need.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use thiserror::Error;

use crate::modules::events::ChallengeKind;
use crate::modules::wire::Response;

use super::types::ChallengeSolution;

/// Cookie issued once a JS challenge is passed.
pub const CLEARANCE_COOKIE: &str = "cf_clearance";

const ANTI_BOT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8";
const ANTI_BOT_LANGUAGE: &str = "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7";

/// Outcomes when a challenge page lacks something the solver needs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeParseError {
    #[error("challenge page is missing {0}")]
    MissingMarker(&'static str),
}

impl ChallengeParseError {
    pub fn marker(&self) -> &'static str {
        match self {
            ChallengeParseError::MissingMarker(name) => name,
        }
    }
}

/// Status 503 or 403 served by a `Server` mentioning cloudflare, in any case.
pub fn is_protected(status: u16, server: Option<&str>) -> bool {
    matches!(status, 403 | 503)
        && server.is_some_and(|value| value.to_ascii_lowercase().contains("cloudflare"))
}

pub fn is_protected_response(response: &Response) -> bool {
    is_protected(response.status(), response.header("Server"))
}

/// Challenge type announced by a protection page body.
pub fn classify(body: &str) -> Option<ChallengeKind> {
    if body.contains("jschl-answer") {
        Some(ChallengeKind::JsArithmetic)
    } else if body.contains("data-sitekey") || body.contains("g-recaptcha") {
        Some(ChallengeKind::Captcha)
    } else {
        None
    }
}

/// Headers a browser sends when navigating from `referer`.
pub fn anti_bot_headers(referer: &str) -> [(&'static str, String); 4] {
    [
        ("Referer", referer.to_string()),
        ("Accept", ANTI_BOT_ACCEPT.to_string()),
        ("Upgrade-Insecure-Requests", "1".to_string()),
        ("Accept-Language", ANTI_BOT_LANGUAGE.to_string()),
    ]
}

static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form#challenge-form").unwrap());
static VC_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"input[name="jschl_vc"]"#).unwrap());
static PASS_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse(r#"input[name="pass"]"#).unwrap());
static SCRIPT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());

static SITE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"data-sitekey\s*=\s*"(?P<key>[^"]*)""#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// Parameters of a JS-arithmetic challenge page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsChallengePage {
    pub clearance_page: String,
    pub verification_code: String,
    pub pass: String,
    /// Script holding the seed object and assignment steps.
    pub script: String,
}

impl JsChallengePage {
    pub fn parse(body: &str) -> Result<Self, ChallengeParseError> {
        let document = Html::parse_document(body);

        let clearance_page = form_action(&document)?;
        let verification_code = input_value(&document, &VC_SELECTOR)
            .ok_or(ChallengeParseError::MissingMarker("jschl_vc"))?;
        let pass = input_value(&document, &PASS_SELECTOR).ok_or(ChallengeParseError::MissingMarker("pass"))?;

        let script = document
            .select(&SCRIPT_SELECTOR)
            .map(|script| script.text().collect::<String>())
            .find(|text| text.contains("jschl-answer"))
            .ok_or(ChallengeParseError::MissingMarker("challenge script"))?;

        Ok(Self {
            clearance_page,
            verification_code,
            pass,
            script,
        })
    }

    pub fn into_solution(self, answer: f64, integer_tag: bool) -> ChallengeSolution {
        ChallengeSolution::new(self.clearance_page, self.verification_code, self.pass, answer)
            .with_integer_tag(integer_tag)
    }
}

/// Parameters of a reCAPTCHA challenge page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaPage {
    pub site_key: String,
    /// Path the solved form is submitted to.
    pub action: String,
}

impl CaptchaPage {
    pub fn parse(body: &str) -> Result<Self, ChallengeParseError> {
        let site_key = SITE_KEY_RE
            .captures(body)
            .and_then(|caps| caps.name("key"))
            .map(|key| html_escape::decode_html_entities(key.as_str()).into_owned())
            .filter(|key| !key.is_empty())
            .ok_or(ChallengeParseError::MissingMarker("data-sitekey"))?;

        let action = form_action(&Html::parse_document(body))?;
        Ok(Self { site_key, action })
    }
}

fn form_action(document: &Html) -> Result<String, ChallengeParseError> {
    document
        .select(&FORM_SELECTOR)
        .next()
        .and_then(|form| form.value().attr("action"))
        .filter(|action| !action.is_empty())
        .map(str::to_string)
        .ok_or(ChallengeParseError::MissingMarker("challenge-form action"))
}

fn input_value(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string)
}
