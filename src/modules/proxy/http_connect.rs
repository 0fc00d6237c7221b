use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ProxyEndpoint, ProxyError, authority, io_timeout};

const MAX_REPLY_HEAD: usize = 8 * 1024;

pub(super) async fn handshake<S>(
    stream: &mut S,
    endpoint: &ProxyEndpoint,
    host: &str,
    port: u16,
    label: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = connect_request(endpoint, host, port);
    let limit = endpoint.timeouts.read_write;

    io_timeout(limit, stream.write_all(request.as_bytes()))
        .await
        .map_err(|err| ProxyError::handshake(label, err))?;
    io_timeout(limit, stream.flush())
        .await
        .map_err(|err| ProxyError::handshake(label, err))?;

    let head = read_reply_head(stream, limit, label).await?;
    let status_line = head.lines().next().unwrap_or_default().trim().to_string();
    let status = parse_status(&status_line).ok_or_else(|| ProxyError::MalformedReply {
        proxy: label.to_string(),
        reason: format!("bad status line '{status_line}'"),
    })?;

    match status {
        200..=299 => Ok(()),
        407 => Err(ProxyError::AuthenticationFailed {
            proxy: label.to_string(),
        }),
        _ => Err(ProxyError::Rejected {
            proxy: label.to_string(),
            reason: status_line,
        }),
    }
}

fn connect_request(endpoint: &ProxyEndpoint, host: &str, port: u16) -> String {
    let target = authority(host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(credentials) = &endpoint.credentials {
        let token = STANDARD.encode(format!("{}:{}", credentials.username, credentials.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
    request
}

/// Read byte by byte so nothing past the blank line is consumed; those bytes
/// belong to the tunnelled protocol.
async fn read_reply_head<S>(
    stream: &mut S,
    limit: std::time::Duration,
    label: &str,
) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_REPLY_HEAD {
            return Err(ProxyError::MalformedReply {
                proxy: label.to_string(),
                reason: "reply header too large".to_string(),
            });
        }
        io_timeout(limit, stream.read_exact(&mut byte))
            .await
            .map_err(|err| ProxyError::handshake(label, err))?;
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn parse_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
