use std::net::{IpAddr, Ipv4Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;

use super::{ProxyEndpoint, ProxyError, io_timeout};

const VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const GRANTED: u8 = 0x5A;

/// Marker address telling a SOCKS4a server to resolve the trailing hostname.
const REMOTE_DNS_MARKER: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

pub(super) async fn handshake<S>(
    stream: &mut S,
    endpoint: &ProxyEndpoint,
    host: &str,
    port: u16,
    remote_dns: bool,
    label: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let user_id = endpoint
        .credentials
        .as_ref()
        .map(|credentials| credentials.username.as_str())
        .unwrap_or_default();

    let request = match host.parse::<Ipv4Addr>() {
        Ok(ip) => connect_request(ip, port, user_id, None),
        Err(_) if remote_dns => connect_request(REMOTE_DNS_MARKER, port, user_id, Some(host)),
        Err(_) => {
            let ip = resolve_ipv4(host, port).await.ok_or_else(|| ProxyError::Resolve {
                proxy: label.to_string(),
                host: host.to_string(),
            })?;
            connect_request(ip, port, user_id, None)
        }
    };

    let limit = endpoint.timeouts.read_write;
    io_timeout(limit, stream.write_all(&request))
        .await
        .map_err(|err| ProxyError::handshake(label, err))?;
    io_timeout(limit, stream.flush())
        .await
        .map_err(|err| ProxyError::handshake(label, err))?;

    let mut reply = [0u8; 8];
    io_timeout(limit, stream.read_exact(&mut reply))
        .await
        .map_err(|err| ProxyError::handshake(label, err))?;

    match reply[1] {
        GRANTED => Ok(()),
        0x5B | 0x5C | 0x5D => Err(ProxyError::Rejected {
            proxy: label.to_string(),
            reason: reply_reason(reply[1]).to_string(),
        }),
        other => Err(ProxyError::MalformedReply {
            proxy: label.to_string(),
            reason: format!("unknown reply code {other:#04x}"),
        }),
    }
}

fn connect_request(ip: Ipv4Addr, port: u16, user_id: &str, hostname: Option<&str>) -> Vec<u8> {
    let mut request = Vec::with_capacity(9 + user_id.len() + hostname.map_or(0, |h| h.len() + 1));
    request.push(VERSION);
    request.push(CMD_CONNECT);
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(user_id.as_bytes());
    request.push(0);
    if let Some(hostname) = hostname {
        request.extend_from_slice(hostname.as_bytes());
        request.push(0);
    }
    request
}

async fn resolve_ipv4(host: &str, port: u16) -> Option<Ipv4Addr> {
    lookup_host((host, port))
        .await
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x5B => "request rejected or failed",
        0x5C => "server cannot reach the client's identd",
        0x5D => "identd reported a different user-id",
        _ => "unknown error",
    }
}
