//! Event system for the challenge bypasses.
//!
//! Bypass loops publish structured events at fixed points; handlers react
//! synchronously. A logging handler is always attached, and the caller may add
//! its own observer.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Which protection a bypass is dealing with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    JsArithmetic,
    Captcha,
    Cipher,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::JsArithmetic => "js-arithmetic",
            ChallengeKind::Captcha => "captcha",
            ChallengeKind::Cipher => "cipher",
        }
    }
}

#[derive(Debug, Clone)]
pub enum BypassEvent {
    /// A new attempt is starting. `budget` is `None` when unbounded.
    Attempt {
        url: Url,
        attempt: u32,
        budget: Option<u32>,
    },
    ChallengeDetected {
        url: Url,
        kind: ChallengeKind,
        status: u16,
    },
    Waiting { delay: Duration },
    SolutionSubmitted { url: Url },
    CookieInstalled { name: String, host: String },
    Retry {
        url: Url,
        attempt: u32,
        reason: String,
    },
    Cleared {
        url: Url,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    Failed { url: Url, reason: String },
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &BypassEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&BypassEvent) + Send + Sync,
{
    fn handle(&self, event: &BypassEvent) {
        self(event)
    }
}

/// Caller supplied observer handed to a bypass call.
pub type BypassObserver = Arc<dyn EventHandler>;

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Logging handler first, then the optional caller observer.
    pub fn for_bypass(observer: Option<BypassObserver>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        if let Some(observer) = observer {
            dispatcher.register_handler(observer);
        }
        dispatcher
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: BypassEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &BypassEvent) {
        match event {
            BypassEvent::Attempt { url, attempt, budget } => match budget {
                Some(budget) => log::debug!("bypass attempt {attempt}/{budget} for {url}"),
                None => log::debug!("bypass attempt {attempt} for {url}"),
            },
            BypassEvent::ChallengeDetected { url, kind, status } => {
                log::info!("{} challenge on {} (status {})", kind.as_str(), url, status);
            }
            BypassEvent::Waiting { delay } => {
                log::debug!("waiting {:.2}s before replay", delay.as_secs_f64());
            }
            BypassEvent::SolutionSubmitted { url } => log::debug!("submitting solution {url}"),
            BypassEvent::CookieInstalled { name, host } => {
                log::debug!("installed cookie {name} for {host}");
            }
            BypassEvent::Retry { url, attempt, reason } => {
                log::warn!("retry {url} after attempt {attempt}: {reason}");
            }
            BypassEvent::Cleared { url, attempts, .. } => {
                log::info!("cleared {url} after {attempts} attempt(s)");
            }
            BypassEvent::Failed { url, reason } => log::warn!("bypass of {url} failed: {reason}"),
        }
    }
}
