//! Engine building blocks
//!
//! Transport connections, proxy tunnels, HTTP/1.1 framing, cookie storage,
//! and the bypass event system.

pub mod connection;
pub mod cookies;
pub mod events;
pub mod proxy;
pub mod wire;

// Re-export commonly used types
pub use connection::{CertificateValidator, TlsVerification, TransportConnection};
pub use cookies::{Cookie, CookieJar, CookieStore};
pub use events::{BypassEvent, BypassObserver, ChallengeKind, EventDispatcher, EventHandler, LoggingHandler};
pub use proxy::{Credentials, ProxyChain, ProxyEndpoint, ProxyError, ProxyTunnel, Timeouts};
pub use wire::{HeaderList, KeepAliveHints, Response};
