use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ProxyEndpoint, ProxyError, io_timeout};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xFF;
const PASSWORD_SUBNEGOTIATION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

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
    let limit = endpoint.timeouts.read_write;
    let io = |err: std::io::Error| ProxyError::handshake(label, err);
    let malformed = |reason: String| ProxyError::MalformedReply {
        proxy: label.to_string(),
        reason,
    };

    let greeting: &[u8] = if endpoint.has_credentials() {
        &[VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[VERSION, 1, AUTH_NONE]
    };
    io_timeout(limit, stream.write_all(greeting)).await.map_err(io)?;

    let mut choice = [0u8; 2];
    io_timeout(limit, stream.read_exact(&mut choice)).await.map_err(io)?;
    if choice[0] != VERSION {
        return Err(malformed(format!("unexpected version {:#04x}", choice[0])));
    }

    match choice[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD if endpoint.has_credentials() => {
            let request = password_request(endpoint, label)?;
            io_timeout(limit, stream.write_all(&request)).await.map_err(io)?;
            let mut status = [0u8; 2];
            io_timeout(limit, stream.read_exact(&mut status)).await.map_err(io)?;
            if status[1] != 0 {
                return Err(ProxyError::AuthenticationFailed {
                    proxy: label.to_string(),
                });
            }
        }
        AUTH_UNACCEPTABLE => {
            return Err(ProxyError::Rejected {
                proxy: label.to_string(),
                reason: "no acceptable authentication method".to_string(),
            });
        }
        other => return Err(malformed(format!("unsupported authentication method {other:#04x}"))),
    }

    let request = connect_request(host, port, label)?;
    io_timeout(limit, stream.write_all(&request)).await.map_err(io)?;
    io_timeout(limit, stream.flush()).await.map_err(io)?;

    let mut reply = [0u8; 4];
    io_timeout(limit, stream.read_exact(&mut reply)).await.map_err(io)?;
    if reply[0] != VERSION {
        return Err(malformed(format!("unexpected version {:#04x}", reply[0])));
    }
    if reply[1] != 0 {
        return Err(ProxyError::Rejected {
            proxy: label.to_string(),
            reason: reply_reason(reply[1]).to_string(),
        });
    }

    // Drain BND.ADDR and BND.PORT so the stream is positioned at tunnel data.
    let remaining = match reply[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            io_timeout(limit, stream.read_exact(&mut len)).await.map_err(io)?;
            usize::from(len[0]) + 2
        }
        other => return Err(malformed(format!("unknown address type {other:#04x}"))),
    };
    let mut bound = vec![0u8; remaining];
    io_timeout(limit, stream.read_exact(&mut bound)).await.map_err(io)?;
    Ok(())
}

fn password_request(endpoint: &ProxyEndpoint, label: &str) -> Result<Vec<u8>, ProxyError> {
    let Some(credentials) = &endpoint.credentials else {
        return Ok(vec![PASSWORD_SUBNEGOTIATION, 0, 0]);
    };
    let username = u8::try_from(credentials.username.len())
        .map_err(|_| ProxyError::InvalidConfig(format!("{label}: username longer than 255 bytes")))?;
    let password = u8::try_from(credentials.password.len())
        .map_err(|_| ProxyError::InvalidConfig(format!("{label}: password longer than 255 bytes")))?;

    let mut request = Vec::with_capacity(3 + credentials.username.len() + credentials.password.len());
    request.push(PASSWORD_SUBNEGOTIATION);
    request.push(username);
    request.extend_from_slice(credentials.username.as_bytes());
    request.push(password);
    request.extend_from_slice(credentials.password.as_bytes());
    Ok(request)
}

fn connect_request(host: &str, port: u16, label: &str) -> Result<Vec<u8>, ProxyError> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| ProxyError::InvalidConfig(format!("{label}: hostname longer than 255 bytes")))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
