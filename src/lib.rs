//! # wirescraper-rs
//!
//! An HTTP/1.1 client that writes requests straight onto a socket, tunnels
//! through SOCKS4/4a/5, HTTP CONNECT, or chains of them, and gets past
//! JS-arithmetic and substitution-cipher anti-bot pages.
//!
//! ## Features
//!
//! - Keep-alive connection reuse with reconnect and redirect policies
//! - Proxy chains with optional hop shuffling
//! - Cookie jar with domain, path, expiry, and secure matching
//! - Browser User-Agent generation from an injected random source
//! - JS challenge solving with a native or Boa evaluator, plus a captcha path
//! - Cancellable bypass loops reporting progress through observers
//!
//! ## Example
//!
//! ```no_run
//! use wirescraper_rs::{BypassContext, ChallengeBypass, JsChallengeBypass, ProxyTunnel, RequestSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = RequestSession::builder()
//!         .with_proxy("socks5://127.0.0.1:9050".parse::<ProxyTunnel>()?)
//!         .build()?;
//!
//!     let response = JsChallengeBypass::default()
//!         .bypass(&mut session, "https://example.com", BypassContext::new())
//!         .await?;
//!     println!("Response: {}", response.text());
//!     Ok(())
//! }
//! ```

mod error;
mod session;

pub mod challenges;
pub mod config;
pub mod external_deps;
pub mod modules;

pub use crate::error::{HttpError, HttpResult, ProtocolError, TransportError};

pub use crate::session::{RequestBody, RequestMode, RequestSession, SessionBuilder};

pub use crate::config::{
    BypassConfig,
    ConfigError,
    SessionConfig,
};

pub use crate::challenges::core::{
    CLEARANCE_COOKIE,
    ChallengeSolution,
    is_protected,
};

pub use crate::challenges::solvers::{
    BypassContext,
    BypassError,
    ChallengeBypass,
    CipherBypass,
    JsChallengeBypass,
};

pub use crate::challenges::user_agents::{
    BrowserFamily,
    random_user_agent,
};

pub use crate::external_deps::captcha::{
    CaptchaError,
    CaptchaProvider,
    CaptchaResult,
    CaptchaSolution,
    CaptchaTask,
};

pub use crate::external_deps::interpreters::{
    ArithmeticEvaluator,
    BoaArithmeticEvaluator,
    InterpreterError,
    InterpreterResult,
    NativeArithmeticEvaluator,
};

pub use crate::modules::{
    BypassEvent,
    BypassObserver,
    ChallengeKind,
    Cookie,
    CookieJar,
    CookieStore,
    Credentials,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    ProxyChain,
    ProxyEndpoint,
    ProxyError,
    ProxyTunnel,
    Response,
    TlsVerification,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
