mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{FakeOrigin, read_head, response};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use wirescraper_rs::{
    CookieJar, CookieStore, HttpError, ProtocolError, RequestSession, SessionConfig, TransportError,
};

fn ok(body: &str) -> String {
    response(200, "OK", &[("Connection", "keep-alive")], body)
}

#[tokio::test]
async fn keep_alive_reuses_connection_until_request_cap() {
    let origin = FakeOrigin::start(|_| ok("hello")).await;
    let config = SessionConfig {
        max_keep_alive_requests: 2,
        ..SessionConfig::default()
    };
    let mut session = RequestSession::builder().with_config(config).build().unwrap();

    for _ in 0..3 {
        let response = session.get(&origin.url("/")).await.unwrap();
        assert_eq!(response.text(), "hello");
    }

    let connections: Vec<usize> = origin.requests().iter().map(|seen| seen.connection).collect();
    assert_eq!(connections, vec![0, 0, 1]);
    assert_eq!(session.keep_alive_request_count(), 1);
}

#[tokio::test]
async fn connection_close_forces_new_connection() {
    let origin = FakeOrigin::start(|_| response(200, "OK", &[("Connection", "close")], "bye")).await;
    let mut session = RequestSession::new();

    session.get(&origin.url("/a")).await.unwrap();
    assert!(!session.is_connected());
    session.get(&origin.url("/b")).await.unwrap();

    let connections: Vec<usize> = origin.requests().iter().map(|seen| seen.connection).collect();
    assert_eq!(connections, vec![0, 1]);
}

#[tokio::test]
async fn dropped_keep_alive_connection_is_replaced_once() {
    let origin = FakeOrigin::start(|_| {
        response(200, "OK", &[("Connection", "keep-alive"), ("X-Drop-Connection", "1")], "x")
    })
    .await;
    let mut session = RequestSession::new();

    session.get(&origin.url("/first")).await.unwrap();
    let second = session.get(&origin.url("/second")).await.unwrap();
    assert_eq!(second.status(), 200);

    let requests = origin.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].path(), "/second");
    assert_eq!(requests[1].connection, 1);
}

#[tokio::test]
async fn redirect_bound_stops_after_limit() {
    let origin = FakeOrigin::start(|_| response(302, "Found", &[("Location", "/loop")], "")).await;
    let config = SessionConfig {
        max_redirects: 3,
        ..SessionConfig::default()
    };
    let mut session = RequestSession::builder().with_config(config).build().unwrap();

    let err = session.get(&origin.url("/start")).await.unwrap_err();
    assert!(matches!(
        err,
        HttpError::Protocol(ProtocolError::TooManyRedirects { max: 3 })
    ));
    assert_eq!(origin.requests().len(), 4);
}

#[tokio::test]
async fn redirects_are_followed_with_get() {
    let origin = FakeOrigin::start(|seen| match seen.path() {
        "/old" => response(301, "Moved Permanently", &[("Location", "/new")], ""),
        _ => ok("arrived"),
    })
    .await;
    let mut session = RequestSession::new();

    let response = session.get(&origin.url("/old")).await.unwrap();
    assert_eq!(response.text(), "arrived");
    assert_eq!(response.url().path(), "/new");
    assert_eq!(session.redirect_count(), 1);
}

#[tokio::test]
async fn status_errors_follow_the_session_policy() {
    let origin = FakeOrigin::start(|_| response(404, "Not Found", &[], "missing")).await;
    let mut session = RequestSession::new();

    let err = session.get(&origin.url("/")).await.unwrap_err();
    assert!(matches!(err, HttpError::Protocol(ProtocolError::ClientError { status: 404 })));

    session.config_mut().ignore_protocol_errors = true;
    let response = session.get(&origin.url("/")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn cookies_round_trip_and_transient_params_reset() {
    let origin = FakeOrigin::start(|seen| match seen.path() {
        "/login" => response(200, "OK", &[("Set-Cookie", "sid=abc; Path=/")], "in"),
        _ => ok("page"),
    })
    .await;
    let jar = Arc::new(CookieJar::new());
    let mut session = RequestSession::builder()
        .with_cookie_store(jar.clone())
        .with_user_agent("test-agent/1.0")
        .build()
        .unwrap();

    session.get(&origin.url("/login")).await.unwrap();
    session
        .add_url_param("q", "rust")
        .add_header("X-Once", "1");
    session.get(&origin.url("/search")).await.unwrap();
    session.get(&origin.url("/plain")).await.unwrap();

    let requests = origin.requests();
    assert_eq!(requests[1].path(), "/search?q=rust");
    assert_eq!(requests[1].header("Cookie"), Some("sid=abc"));
    assert_eq!(requests[1].header("X-Once"), Some("1"));
    assert_eq!(requests[1].header("User-Agent"), Some("test-agent/1.0"));
    assert_eq!(requests[2].path(), "/plain");
    assert_eq!(requests[2].header("X-Once"), None);

    let url = url::Url::parse(&origin.url("/")).unwrap();
    assert!(jar.contains(&url, "sid"));
}

/// Server that hangs up on the first `drops` connections after reading the
/// request, then answers normally. Returns its address and accept counter.
async fn flaky_origin(drops: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() || index < drops {
                    return;
                }
                let reply = response(200, "OK", &[("Connection", "close")], "recovered");
                let _ = stream.write_all(reply.as_bytes()).await;
            });
        }
    });
    (addr, accepted)
}

fn reconnecting(limit: u32, delay: Duration) -> SessionConfig {
    SessionConfig {
        reconnect: true,
        reconnect_limit: limit,
        reconnect_delay: delay,
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn reconnect_retries_after_io_failure_with_fixed_delay() {
    let (addr, accepted) = flaky_origin(2).await;
    let delay = Duration::from_millis(50);
    let mut session = RequestSession::builder()
        .with_config(reconnecting(3, delay))
        .build()
        .unwrap();

    let started = Instant::now();
    let response = session.get(&format!("http://{addr}/")).await.unwrap();
    assert_eq!(response.text(), "recovered");
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= delay * 2);
}

#[tokio::test]
async fn reconnect_stops_at_the_limit() {
    let (addr, accepted) = flaky_origin(usize::MAX).await;
    let mut session = RequestSession::builder()
        .with_config(reconnecting(2, Duration::from_millis(10)))
        .build()
        .unwrap();

    let err = session.get(&format!("http://{addr}/")).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert_eq!(session.reconnect_count(), 2);
}

#[tokio::test]
async fn reconnect_disabled_fails_on_first_error() {
    let (addr, accepted) = flaky_origin(1).await;
    let mut session = RequestSession::new();

    session.get(&format!("http://{addr}/")).await.unwrap_err();
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(session.reconnect_count(), 0);
}

#[tokio::test]
async fn exhausted_reconnects_surface_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let delay = Duration::from_millis(20);
    let mut session = RequestSession::builder()
        .with_config(reconnecting(2, delay))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = session.get(&format!("http://{addr}/")).await.unwrap_err();
    assert!(matches!(err, HttpError::Transport(TransportError::Connect { .. })), "{err}");
    assert_eq!(session.reconnect_count(), 2);
    assert!(started.elapsed() >= delay * 2);
}

#[tokio::test]
async fn server_keep_alive_max_overrides_local_cap() {
    let origin = FakeOrigin::start(|_| response(200, "OK", &[("Keep-Alive", "timeout=30, max=1")], "x")).await;
    let mut session = RequestSession::new();

    for _ in 0..3 {
        session.get(&origin.url("/")).await.unwrap();
    }
    let connections: Vec<usize> = origin.requests().iter().map(|seen| seen.connection).collect();
    assert_eq!(connections, vec![0, 1, 2]);
}

#[tokio::test]
async fn server_keep_alive_timeout_overrides_idle_limit() {
    let origin = FakeOrigin::start(|_| response(200, "OK", &[("Keep-Alive", "timeout=30")], "x")).await;
    let mut session = RequestSession::builder()
        .with_keep_alive_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    session.get(&origin.url("/")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    session.get(&origin.url("/")).await.unwrap();

    let connections: Vec<usize> = origin.requests().iter().map(|seen| seen.connection).collect();
    assert_eq!(connections, vec![0, 0]);
}

#[tokio::test]
async fn idle_connection_expires_after_keep_alive_timeout() {
    let origin = FakeOrigin::start(|_| ok("x")).await;
    let mut session = RequestSession::builder()
        .with_keep_alive_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    session.get(&origin.url("/")).await.unwrap();
    session.get(&origin.url("/")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    session.get(&origin.url("/")).await.unwrap();

    let connections: Vec<usize> = origin.requests().iter().map(|seen| seen.connection).collect();
    assert_eq!(connections, vec![0, 0, 1]);
}
