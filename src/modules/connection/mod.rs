//! Transport connection owned by a session.
//!
//! A connection is a tunnel stream to one scheme/host/port, wrapped in TLS
//! when the scheme is `https`. It is replaced, never shared.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::{HttpError, ProtocolError, TransportError};
use crate::modules::proxy::{BoxedStream, ProxyError, ProxyTunnel, TunnelRng, authority, io_timeout};
use crate::modules::wire::{Response, read_response};

/// Callback deciding whether a peer certificate (DER) is acceptable for a host.
pub type CertificateValidator = Arc<dyn Fn(&[u8], &str) -> bool + Send + Sync>;

/// How server certificates are checked.
#[derive(Clone, Default)]
pub enum TlsVerification {
    /// Accept any certificate and hostname.
    #[default]
    AcceptAll,
    /// Platform trust store with hostname checks.
    System,
    /// Handshake permissively, then ask the callback about the peer certificate.
    Custom(CertificateValidator),
}

impl fmt::Debug for TlsVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVerification::AcceptAll => f.write_str("AcceptAll"),
            TlsVerification::System => f.write_str("System"),
            TlsVerification::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl TlsVerification {
    fn connector(&self, host: &str) -> Result<tokio_native_tls::TlsConnector, TransportError> {
        let mut builder = native_tls::TlsConnector::builder();
        if !matches!(self, TlsVerification::System) {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let connector = builder.build().map_err(|err| TransportError::Tls {
            host: host.to_string(),
            reason: err.to_string(),
        })?;
        Ok(tokio_native_tls::TlsConnector::from(connector))
    }
}

/// Live stream to one origin.
pub struct TransportConnection {
    stream: BoxedStream,
    scheme: String,
    host: String,
    port: u16,
    read_write_timeout: Duration,
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl TransportConnection {
    /// Open a connection to the origin of `url` through `tunnel`.
    pub async fn open(
        tunnel: &ProxyTunnel,
        url: &Url,
        tls: &TlsVerification,
        read_write_timeout: Duration,
        rng: &mut TunnelRng,
    ) -> Result<Self, HttpError> {
        let (scheme, host, port) = origin(url)?;
        log::debug!("opening connection to {scheme}://{} via {tunnel}", authority(&host, port));

        let stream = tunnel.connect(&host, port, None, rng).await.map_err(|err| match err {
            // A direct dial failing is a transport problem, not a proxy one.
            ProxyError::Connect { source, .. } if tunnel.is_direct() => {
                HttpError::from(TransportError::from_io("connecting to", &authority(&host, port), source))
            }
            other => HttpError::from(other),
        })?;

        let stream = if scheme == "https" {
            upgrade_tls(stream, &host, tls, read_write_timeout).await?
        } else {
            stream
        };

        Ok(Self {
            stream,
            scheme,
            host,
            port,
            read_write_timeout,
        })
    }

    /// Whether this connection already points at the origin of `url`.
    pub fn targets(&self, url: &Url) -> bool {
        match origin(url) {
            Ok((scheme, host, port)) => scheme == self.scheme && host == self.host && port == self.port,
            Err(_) => false,
        }
    }

    pub fn address(&self) -> String {
        authority(&self.host, self.port)
    }

    /// Write one framed request and read its response.
    pub async fn exchange(&mut self, method: &Method, url: &Url, head: &[u8], body: &[u8]) -> Result<Response, HttpError> {
        let limit = self.read_write_timeout;
        let address = self.address();
        let mut message = Vec::with_capacity(head.len() + body.len());
        message.extend_from_slice(head);
        message.extend_from_slice(body);

        io_timeout(limit, self.stream.write_all(&message))
            .await
            .map_err(|err| TransportError::from_io("writing to", &address, err))?;
        io_timeout(limit, self.stream.flush())
            .await
            .map_err(|err| TransportError::from_io("writing to", &address, err))?;

        read_response(&mut self.stream, method, url, limit).await
    }

    /// Best-effort close of the underlying stream.
    pub async fn shutdown(mut self) {
        let _ = io_timeout(Duration::from_secs(1), self.stream.shutdown()).await;
    }
}

fn origin(url: &Url) -> Result<(String, String, u16), ProtocolError> {
    let scheme = url.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(ProtocolError::InvalidAddress(format!("unsupported scheme in {url}")));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ProtocolError::InvalidAddress(format!("missing host in {url}")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProtocolError::InvalidAddress(format!("missing port in {url}")))?;
    Ok((scheme, host, port))
}

async fn upgrade_tls(
    stream: BoxedStream,
    host: &str,
    tls: &TlsVerification,
    limit: Duration,
) -> Result<BoxedStream, HttpError> {
    let connector = tls.connector(host)?;
    let tls_stream = match tokio::time::timeout(limit, connector.connect(host, stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(TransportError::Tls {
                host: host.to_string(),
                reason: err.to_string(),
            }
            .into());
        }
        Err(_) => {
            return Err(TransportError::Timeout {
                operation: "negotiating TLS with",
                address: host.to_string(),
            }
            .into());
        }
    };

    if let TlsVerification::Custom(validator) = tls {
        let certificate = tls_stream
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|certificate| certificate.to_der().ok())
            .unwrap_or_default();
        if !validator(&certificate, host) {
            return Err(TransportError::CertificateRejected { host: host.to_string() }.into());
        }
    }

    Ok(Box::new(tls_stream))
}
