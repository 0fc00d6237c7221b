mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{FakeOrigin, Seen, response};
use tokio_util::sync::CancellationToken;
use url::Url;
use wirescraper_rs::challenges::solvers::CipherTable;
use wirescraper_rs::{
    BoaArithmeticEvaluator, BypassConfig, BypassContext, BypassError, BypassEvent, BypassObserver,
    CLEARANCE_COOKIE, CaptchaProvider, CaptchaResult, CaptchaSolution, CaptchaTask, ChallengeBypass,
    CipherBypass, Cookie, HttpError, JsChallengeBypass, ProtocolError, RequestSession,
};

// seed "2" + "0" = 20, then += 2; parseInt(22) + "127.0.0.1".len() = 31
const JS_PAGE: &str = r#"<!DOCTYPE html>
<html><head><title>Just a moment...</title></head>
<body>
  <script type="text/javascript">
    setTimeout(function(){
      var s,t,o,p,b,r,e,a,k,i,n,g,f, xYz={"abc":+((!+[]+!![]+[])+(+[]))};
      t = document.createElement('div');
      a = document.getElementById('jschl-answer');
      ;xYz.abc+=!+[]+!![];a.value = parseInt(xYz.abc, 10) + t.length;
    }, 4000);
  </script>
  <form id="challenge-form" action="/cdn-cgi/l/chk_jschl" method="get">
    <input type="hidden" name="jschl_vc" value="1a2b3c"/>
    <input type="hidden" name="pass" value="1500000000.123-abc"/>
    <input type="hidden" id="jschl-answer" name="jschl_answer"/>
  </form>
</body></html>"#;

const CAPTCHA_PAGE: &str = r#"<html><body>
  <form id="challenge-form" action="/cdn-cgi/l/chk_captcha" method="get">
    <div class="g-recaptcha" data-sitekey="site-key-1"></div>
  </form>
</body></html>"#;

fn challenge(status: u16, body: &str) -> String {
    response(status, "Service Unavailable", &[("Server", "cloudflare")], body)
}

fn fast(max_retries: i32) -> BypassConfig {
    BypassConfig::default()
        .with_max_retries(max_retries)
        .with_delay(Duration::ZERO)
}

fn has_clearance(seen: &Seen) -> bool {
    seen.header("Cookie").is_some_and(|cookie| cookie.contains("cf_clearance=ok"))
}

fn recorder() -> (BypassObserver, Arc<Mutex<Vec<BypassEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let observer: BypassObserver = Arc::new(move |event: &BypassEvent| sink.lock().unwrap().push(event.clone()));
    (observer, events)
}

#[tokio::test]
async fn exhausted_budget_reports_attempts_and_expires_clearance() {
    let origin = FakeOrigin::start(|_| challenge(503, JS_PAGE)).await;
    let mut session = RequestSession::new();
    let url = Url::parse(&origin.url("/")).unwrap();
    session.cookies().set(
        Cookie::new(CLEARANCE_COOKIE, "stale", "127.0.0.1").with_expires(Utc::now() + ChronoDuration::hours(1)),
    );

    let (observer, events) = recorder();
    let err = JsChallengeBypass::new(fast(3))
        .bypass(&mut session, url.as_str(), BypassContext::new().with_observer(observer))
        .await
        .unwrap_err();

    assert!(matches!(err, BypassError::RateLimitExceeded { attempts: 3 }), "{err}");
    assert!(!session.cookies().contains(&url, CLEARANCE_COOKIE));

    let requests = origin.requests();
    assert_eq!(requests.len(), 6);
    assert_eq!(requests[0].header("Cookie"), Some("cf_clearance=stale"));
    assert_eq!(requests[2].header("Cookie"), None);

    let events = events.lock().unwrap();
    let attempts = events.iter().filter(|event| matches!(event, BypassEvent::Attempt { .. })).count();
    assert_eq!(attempts, 3);
    assert!(matches!(events.last(), Some(BypassEvent::Failed { .. })));
}

#[tokio::test]
async fn solved_challenge_follows_clearance_redirect() {
    let origin = FakeOrigin::start(|seen| {
        if seen.path().starts_with("/cdn-cgi/l/chk_jschl") {
            response(
                302,
                "Found",
                &[("Set-Cookie", "cf_clearance=ok; Path=/"), ("Location", "/")],
                "",
            )
        } else if has_clearance(seen) {
            response(200, "OK", &[("Server", "cloudflare")], "welcome")
        } else {
            challenge(503, JS_PAGE)
        }
    })
    .await;
    let mut session = RequestSession::new();
    let url = origin.url("/");

    let response = JsChallengeBypass::new(fast(4))
        .bypass(&mut session, &url, BypassContext::new())
        .await
        .unwrap();
    assert_eq!(response.text(), "welcome");
    assert!(session.user_agent().is_some());

    let requests = origin.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[1].path(),
        "/cdn-cgi/l/chk_jschl?jschl_vc=1a2b3c&pass=1500000000.123-abc&jschl_answer=31"
    );
    assert_eq!(requests[1].header("Referer"), Some(url.as_str()));
    assert_eq!(requests[2].header("Upgrade-Insecure-Requests"), Some("1"));
}

#[tokio::test]
async fn clearance_redirect_chain_is_followed_to_the_end() {
    let origin = FakeOrigin::start(|seen| match seen.path() {
        path if path.starts_with("/cdn-cgi/l/chk_jschl") => response(
            302,
            "Found",
            &[("Set-Cookie", "cf_clearance=ok; Path=/"), ("Location", "/")],
            "",
        ),
        "/" if has_clearance(seen) => response(301, "Moved Permanently", &[("Location", "/home")], ""),
        "/home" if has_clearance(seen) => response(200, "OK", &[], "welcome"),
        _ => challenge(503, JS_PAGE),
    })
    .await;
    let mut session = RequestSession::new();
    let url = origin.url("/");

    let response = JsChallengeBypass::new(fast(2))
        .bypass(&mut session, &url, BypassContext::new())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "welcome");

    let paths: Vec<String> = origin.requests().iter().map(|seen| seen.path().to_string()).collect();
    assert_eq!(paths.len(), 4);
    assert_eq!(paths[2], "/");
    assert_eq!(paths[3], "/home");
}

#[tokio::test]
async fn clearance_submission_carries_navigation_headers() {
    let origin = FakeOrigin::start(|seen| {
        if seen.path().starts_with("/cdn-cgi/l/chk_jschl") {
            response(200, "OK", &[], "cleared")
        } else {
            challenge(503, JS_PAGE)
        }
    })
    .await;
    let mut session = RequestSession::new();
    let url = origin.url("/");

    JsChallengeBypass::new(fast(1))
        .bypass(&mut session, &url, BypassContext::new())
        .await
        .unwrap_err();

    let submission = &origin.requests()[1];
    assert!(submission.path().starts_with("/cdn-cgi/l/chk_jschl"));
    assert_eq!(submission.header("Referer"), Some(url.as_str()));
    assert_eq!(submission.header("Upgrade-Insecure-Requests"), Some("1"));
    assert!(submission.header("Accept").is_some_and(|accept| accept.contains("text/html")));
    assert!(submission.header("Accept-Language").is_some());
}

#[tokio::test]
async fn negative_retry_budget_is_unbounded() {
    let submissions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&submissions);
    let origin = FakeOrigin::start(move |seen| {
        if seen.path().starts_with("/cdn-cgi/l/chk_jschl") {
            if counter.fetch_add(1, Ordering::SeqCst) < 6 {
                challenge(503, JS_PAGE)
            } else {
                response(302, "Found", &[("Set-Cookie", "cf_clearance=ok; Path=/"), ("Location", "/")], "")
            }
        } else if has_clearance(seen) {
            response(200, "OK", &[], "welcome")
        } else {
            challenge(503, JS_PAGE)
        }
    })
    .await;
    let mut session = RequestSession::new();

    let (observer, events) = recorder();
    let response = JsChallengeBypass::new(fast(-1))
        .bypass(&mut session, &origin.url("/"), BypassContext::new().with_observer(observer))
        .await
        .unwrap();
    assert_eq!(response.text(), "welcome");
    assert_eq!(submissions.load(Ordering::SeqCst), 7);

    let events = events.lock().unwrap();
    let retries = events.iter().filter(|event| matches!(event, BypassEvent::Retry { .. })).count();
    assert_eq!(retries, 6);
    assert!(events.iter().all(|event| match event {
        BypassEvent::Attempt { budget, .. } => budget.is_none(),
        _ => true,
    }));
}

#[tokio::test]
async fn boa_evaluator_produces_the_same_answer() {
    let origin = FakeOrigin::start(|seen| {
        if seen.path().contains("jschl_answer=31") {
            response(302, "Found", &[("Set-Cookie", "cf_clearance=ok; Path=/"), ("Location", "/")], "")
        } else if has_clearance(seen) {
            response(200, "OK", &[], "welcome")
        } else {
            challenge(503, JS_PAGE)
        }
    })
    .await;
    let mut session = RequestSession::new();

    let response = JsChallengeBypass::new(fast(2))
        .with_evaluator(Arc::new(BoaArithmeticEvaluator::new()))
        .bypass(&mut session, &origin.url("/"), BypassContext::new())
        .await
        .unwrap();
    assert_eq!(response.text(), "welcome");
}

#[tokio::test]
async fn unprotected_pages_return_immediately() {
    let origin = FakeOrigin::start(|_| response(200, "OK", &[("Server", "cloudflare")], "open")).await;
    let mut session = RequestSession::new();

    let response = JsChallengeBypass::new(fast(4))
        .bypass(&mut session, &origin.url("/"), BypassContext::new())
        .await
        .unwrap();
    assert_eq!(response.text(), "open");
    assert_eq!(origin.requests().len(), 1);
}

#[tokio::test]
async fn unknown_challenge_is_a_hard_failure() {
    let origin = FakeOrigin::start(|_| challenge(503, "<html>something else</html>")).await;
    let mut session = RequestSession::new();

    let err = JsChallengeBypass::new(fast(4))
        .bypass(&mut session, &origin.url("/"), BypassContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BypassError::UnknownChallengeType));
    assert_eq!(origin.requests().len(), 1);
}

#[tokio::test]
async fn captcha_without_provider_fails() {
    let origin = FakeOrigin::start(|_| challenge(403, CAPTCHA_PAGE)).await;
    let mut session = RequestSession::new();

    let err = JsChallengeBypass::new(fast(4))
        .bypass(&mut session, &origin.url("/"), BypassContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BypassError::CaptchaCapabilityMissing));
}

struct FixedToken;

#[async_trait]
impl CaptchaProvider for FixedToken {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        assert_eq!(task.site_key, "site-key-1");
        Ok(CaptchaSolution::new("token-xyz"))
    }
}

#[tokio::test]
async fn captcha_token_is_submitted_to_form_action() {
    let origin = FakeOrigin::start(|seen| {
        if seen.path().starts_with("/cdn-cgi/l/chk_captcha") {
            response(302, "Found", &[("Set-Cookie", "cf_clearance=ok; Path=/"), ("Location", "/")], "")
        } else if has_clearance(seen) {
            response(200, "OK", &[], "welcome")
        } else {
            challenge(403, CAPTCHA_PAGE)
        }
    })
    .await;
    let mut session = RequestSession::new();

    let response = JsChallengeBypass::new(fast(4))
        .bypass(
            &mut session,
            &origin.url("/"),
            BypassContext::new().with_captcha(Arc::new(FixedToken)),
        )
        .await
        .unwrap();
    assert_eq!(response.text(), "welcome");
    assert_eq!(
        origin.requests()[1].path(),
        "/cdn-cgi/l/chk_captcha?g-recaptcha-response=token-xyz"
    );
}

#[tokio::test]
async fn cancellation_interrupts_the_replay_delay() {
    let origin = FakeOrigin::start(|_| challenge(503, JS_PAGE)).await;
    let mut session = RequestSession::new();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let config = BypassConfig::default().with_delay(Duration::from_secs(30));
    let err = JsChallengeBypass::new(config)
        .bypass(&mut session, &origin.url("/"), BypassContext::new().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(matches!(err, BypassError::Cancelled));
    assert_eq!(origin.requests().len(), 1);
}

const ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn cipher_page() -> String {
    let ciphertext = CipherTable::new(ALPHABET).encode(7, "s3cr3tValue");
    format!(
        r#"<html><h1>Stormwall DDoS protection</h1><script>
        const cE = "{ciphertext}";
        const cK = 7;
        const cN = "swp_token";
        var abc="{ALPHABET}",x=1;
        </script></html>"#
    )
}

#[tokio::test]
async fn cipher_bypass_installs_decoded_cookie() {
    let origin = FakeOrigin::start(|seen| {
        let cleared = seen
            .header("Cookie")
            .is_some_and(|cookie| cookie.contains("swp_token=s3cr3tValue"));
        if cleared {
            response(200, "OK", &[], "welcome")
        } else {
            response(200, "OK", &[], &cipher_page())
        }
    })
    .await;
    let mut session = RequestSession::new();
    let url = origin.url("/");

    let (observer, events) = recorder();
    let response = CipherBypass::default()
        .bypass(&mut session, &url, BypassContext::new().with_observer(observer))
        .await
        .unwrap();
    assert_eq!(response.text(), "welcome");

    let requests = origin.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].header("Referer"), Some(url.as_str()));
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, BypassEvent::CookieInstalled { name, .. } if name == "swp_token"))
    );
}

#[tokio::test]
async fn cipher_bypass_fails_when_still_protected() {
    let origin = FakeOrigin::start(|_| response(200, "OK", &[], &cipher_page())).await;
    let mut session = RequestSession::new();

    let err = CipherBypass::new(BypassConfig::default())
        .bypass(&mut session, &origin.url("/"), BypassContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BypassError::StillProtected { .. }));
}

#[tokio::test]
async fn cipher_solve_page_uses_supplied_body() {
    let origin = FakeOrigin::start(|_| response(200, "OK", &[], "welcome")).await;
    let mut session = RequestSession::new();
    let url = origin.url("/");

    let response = CipherBypass::default()
        .solve_page(&mut session, &url, &cipher_page())
        .await
        .unwrap();
    assert_eq!(response.text(), "welcome");

    let cookie = session
        .cookies()
        .get(&Url::parse(&url).unwrap(), "swp_token")
        .unwrap();
    assert_eq!(cookie.value, "s3cr3tValue");
    assert_eq!(origin.requests().len(), 1);
}

#[tokio::test]
async fn cipher_replay_follows_session_error_policy() {
    let origin = FakeOrigin::start(|_| response(404, "Not Found", &[], "gone")).await;
    let url = origin.url("/");

    let mut strict = RequestSession::new();
    let err = CipherBypass::default()
        .solve_page(&mut strict, &url, &cipher_page())
        .await
        .unwrap_err();
    assert!(
        matches!(err, BypassError::Http(HttpError::Protocol(ProtocolError::ClientError { status: 404 }))),
        "{err}"
    );

    let mut lenient = RequestSession::new();
    lenient.config_mut().ignore_protocol_errors = true;
    let response = CipherBypass::default()
        .solve_page(&mut lenient, &url, &cipher_page())
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
