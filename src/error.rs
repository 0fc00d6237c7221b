//! Error taxonomy of the request engine.

use std::io;

use thiserror::Error;

use crate::modules::proxy::ProxyError;

/// Socket level failures: connect, timeout, TLS.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out while {operation} {address}")]
    Timeout {
        operation: &'static str,
        address: String,
    },
    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },
    #[error("certificate presented by {host} was rejected")]
    CertificateRejected { host: String },
    #[error("i/o failure talking to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Classify an I/O error, lifting `TimedOut` into [`TransportError::Timeout`].
    pub(crate) fn from_io(operation: &'static str, address: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::TimedOut {
            TransportError::Timeout {
                operation,
                address: address.to_string(),
            }
        } else {
            TransportError::Io {
                address: address.to_string(),
                source,
            }
        }
    }
}

/// HTTP level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("client error: status {status}")]
    ClientError { status: u16 },
    #[error("server error: status {status}")]
    ServerError { status: u16 },
    #[error("server closed the connection without a response")]
    EmptyResponse,
    #[error("malformed status line: {0}")]
    MalformedStatusLine(String),
    #[error("malformed headers: {0}")]
    MalformedHeaders(String),
    #[error("exceeded the limit of {max} redirects")]
    TooManyRedirects { max: u32 },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("unable to decode response body: {0}")]
    BodyDecoding(String),
}

impl ProtocolError {
    /// Status-code policy: 4xx is a client error, 5xx a server error.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400..=499 => Some(ProtocolError::ClientError { status }),
            500.. => Some(ProtocolError::ServerError { status }),
            _ => None,
        }
    }
}

/// Anything a single `send` can fail with.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

impl HttpError {
    /// Whether the reconnect policy may retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Transport(_) => true,
            HttpError::Proxy(err) => !matches!(err, ProxyError::InvalidConfig(_)),
            HttpError::Protocol(err) => matches!(
                err,
                ProtocolError::EmptyResponse
                    | ProtocolError::MalformedStatusLine(_)
                    | ProtocolError::MalformedHeaders(_)
                    | ProtocolError::BodyDecoding(_)
            ),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Protocol(ProtocolError::ClientError { status })
            | HttpError::Protocol(ProtocolError::ServerError { status }) => Some(*status),
            _ => None,
        }
    }
}

pub type HttpResult<T> = Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_policy_splits_ranges() {
        assert_eq!(ProtocolError::from_status(200), None);
        assert_eq!(ProtocolError::from_status(302), None);
        assert_eq!(
            ProtocolError::from_status(404),
            Some(ProtocolError::ClientError { status: 404 })
        );
        assert_eq!(
            ProtocolError::from_status(503),
            Some(ProtocolError::ServerError { status: 503 })
        );
    }

    #[test]
    fn timeouts_are_lifted() {
        let err = TransportError::from_io(
            "reading from",
            "h:80",
            io::Error::new(io::ErrorKind::TimedOut, "slow"),
        );
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(HttpError::from(err).is_retryable());
        assert!(!HttpError::from(ProtocolError::TooManyRedirects { max: 1 }).is_retryable());
    }
}
