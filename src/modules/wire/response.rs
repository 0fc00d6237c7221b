//! HTTP/1.1 response reader.
//!
//! Uses httparse for the head and raw reads for the body so the connection is
//! left positioned exactly after the message when it is kept alive.

use std::io::Read;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::Method;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use super::HeaderList;
use crate::error::{HttpError, ProtocolError, TransportError};
use crate::modules::proxy::{authority, io_timeout};

/// Maximum response header block size (64KB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 128;

/// Maximum body size accepted before decompression (256MB).
const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Connection lifetime hints advertised by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveHints {
    /// `Keep-Alive: timeout=N`
    pub timeout: Option<Duration>,
    /// `Keep-Alive: max=N`
    pub max: Option<u32>,
    /// The server asked for the connection to be closed.
    pub close: bool,
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct Response {
    url: Url,
    status: u16,
    reason: String,
    headers: HeaderList,
    body: Bytes,
    redirect: Option<Url>,
    keep_alive: KeepAliveHints,
}

impl Response {
    /// Address the request was sent to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Decoded body bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn has_redirect(&self) -> bool {
        self.redirect.is_some()
    }

    /// Absolute `Location` target for 3xx responses.
    pub fn redirect_address(&self) -> Option<&Url> {
        self.redirect.as_ref()
    }

    pub fn set_cookie_headers(&self) -> Vec<&str> {
        self.headers.get_all("Set-Cookie").collect()
    }

    pub fn keep_alive(&self) -> &KeepAliveHints {
        &self.keep_alive
    }
}

struct ParsedHead {
    length: usize,
    minor_version: u8,
    status: u16,
    reason: String,
    headers: HeaderList,
}

/// Read one response for `method` from `stream`.
pub(crate) async fn read_response<S>(
    stream: &mut S,
    method: &Method,
    url: &Url,
    limit: Duration,
) -> Result<Response, HttpError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let address = authority(url.host_str().unwrap_or_default(), url.port_or_known_default().unwrap_or(80));
    let mut reader = WireReader {
        stream,
        buf: BytesMut::with_capacity(8 * 1024),
        limit,
        address,
    };

    let head = loop {
        let head = reader.read_head().await?;
        // Interim responses precede the real one on the same connection.
        if (100..200).contains(&head.status) && head.status != 101 {
            continue;
        }
        break head;
    };

    let mut keep_alive = keep_alive_hints(&head.headers, head.minor_version);
    let status = head.status;
    let no_body = *method == Method::HEAD || status == 204 || status == 304 || (100..200).contains(&status);

    let raw = if no_body {
        Bytes::new()
    } else if is_chunked(&head.headers) {
        reader.read_chunked().await?
    } else if let Some(length) = content_length(&head.headers)? {
        reader.read_fixed(length).await?
    } else {
        keep_alive.close = true;
        reader.read_to_close().await?
    };

    let body = decode_body(raw, head.headers.get("Content-Encoding"))?;
    let redirect = if (300..400).contains(&status) {
        head.headers
            .get("Location")
            .and_then(|location| url.join(location.trim()).ok())
    } else {
        None
    };

    log::debug!("<- {} {} ({} bytes)", status, url, body.len());
    Ok(Response {
        url: url.clone(),
        status,
        reason: head.reason,
        headers: head.headers,
        body,
        redirect,
        keep_alive,
    })
}

struct WireReader<'a, S: ?Sized> {
    stream: &'a mut S,
    buf: BytesMut,
    limit: Duration,
    address: String,
}

impl<S> WireReader<'_, S>
where
    S: AsyncRead + Unpin + ?Sized,
{
    async fn fill(&mut self) -> Result<usize, HttpError> {
        self.buf.reserve(8 * 1024);
        io_timeout(self.limit, self.stream.read_buf(&mut self.buf))
            .await
            .map_err(|err| TransportError::from_io("reading from", &self.address, err).into())
    }

    async fn fill_or_eof(&mut self, context: &str) -> Result<(), HttpError> {
        if self.fill().await? == 0 {
            return Err(TransportError::Io {
                address: self.address.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed while reading {context}"),
                ),
            }
            .into());
        }
        Ok(())
    }

    async fn read_head(&mut self) -> Result<ParsedHead, HttpError> {
        loop {
            if let Some(head) = parse_head(&self.buf)? {
                self.buf.advance(head.length);
                return Ok(head);
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(ProtocolError::MalformedHeaders("header block too large".into()).into());
            }
            if self.fill().await? == 0 {
                let err = if self.buf.is_empty() {
                    ProtocolError::EmptyResponse
                } else {
                    ProtocolError::MalformedHeaders("connection closed inside the header block".into())
                };
                return Err(err.into());
            }
        }
    }

    async fn read_line(&mut self) -> Result<BytesMut, HttpError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|window| window == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(line);
            }
            self.fill_or_eof("a chunk header").await?;
        }
    }

    async fn read_fixed(&mut self, length: usize) -> Result<Bytes, HttpError> {
        while self.buf.len() < length {
            self.fill_or_eof("the body").await?;
        }
        Ok(self.buf.split_to(length).freeze())
    }

    async fn read_chunked(&mut self) -> Result<Bytes, HttpError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                // Trailer section ends with an empty line.
                while !self.read_line().await?.is_empty() {}
                return Ok(body.freeze());
            }
            let framed = size
                .checked_add(2)
                .filter(|_| body.len().saturating_add(size) <= MAX_BODY_SIZE)
                .ok_or_else(|| ProtocolError::MalformedHeaders(format!("chunk of {size} bytes exceeds the body limit")))?;
            while self.buf.len() < framed {
                self.fill_or_eof("chunk data").await?;
            }
            body.extend_from_slice(&self.buf[..size]);
            if &self.buf[size..framed] != b"\r\n" {
                return Err(ProtocolError::MalformedHeaders("chunk not terminated by CRLF".into()).into());
            }
            self.buf.advance(framed);
        }
    }

    async fn read_to_close(&mut self) -> Result<Bytes, HttpError> {
        while self.fill().await? > 0 {}
        Ok(self.buf.split().freeze())
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<ParsedHead>, HttpError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut parsed = httparse::Response::new(&mut storage);
    let length = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(length)) => length,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::Status | httparse::Error::Version) => {
            let line = buf.split(|byte| *byte == b'\n').next().unwrap_or_default();
            return Err(ProtocolError::MalformedStatusLine(String::from_utf8_lossy(line).trim().to_string()).into());
        }
        Err(err) => return Err(ProtocolError::MalformedHeaders(err.to_string()).into()),
    };

    let mut headers = HeaderList::new();
    for header in parsed.headers.iter() {
        headers.append(header.name, String::from_utf8_lossy(header.value).into_owned());
    }

    Ok(Some(ParsedHead {
        length,
        minor_version: parsed.version.unwrap_or(1),
        status: parsed.code.unwrap_or_default(),
        reason: parsed.reason.unwrap_or_default().to_string(),
        headers,
    }))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let text = String::from_utf8_lossy(line);
    let size = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16)
        .map_err(|_| ProtocolError::MalformedHeaders(format!("bad chunk size '{size}'")).into())
}

fn is_chunked(headers: &HeaderList) -> bool {
    headers
        .get("Transfer-Encoding")
        .and_then(|value| value.rsplit(',').next())
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderList) -> Result<Option<usize>, HttpError> {
    match headers.get("Content-Length") {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|length| *length <= MAX_BODY_SIZE)
            .map(Some)
            .ok_or_else(|| ProtocolError::MalformedHeaders(format!("bad Content-Length '{value}'")).into()),
    }
}

fn keep_alive_hints(headers: &HeaderList, minor_version: u8) -> KeepAliveHints {
    let mut hints = KeepAliveHints::default();

    if let Some(value) = headers.get("Keep-Alive") {
        for part in value.split(',') {
            let Some((key, raw)) = part.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "timeout" => hints.timeout = raw.trim().parse().ok().map(Duration::from_secs),
                "max" => hints.max = raw.trim().parse().ok(),
                _ => {}
            }
        }
    }

    let connection = headers.get("Connection").unwrap_or_default();
    let has_token = |token: &str| {
        connection
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    };
    hints.close = has_token("close") || (minor_version == 0 && !has_token("keep-alive"));
    hints
}

fn decode_body(raw: Bytes, encoding: Option<&str>) -> Result<Bytes, HttpError> {
    let encoding = encoding.unwrap_or_default().trim().to_ascii_lowercase();
    let decoded = match encoding.as_str() {
        "gzip" | "x-gzip" => inflate(GzDecoder::new(&raw[..]))?,
        // Servers disagree on whether deflate means zlib-wrapped or raw.
        "deflate" => match inflate(ZlibDecoder::new(&raw[..])) {
            Ok(decoded) => decoded,
            Err(_) => inflate(DeflateDecoder::new(&raw[..]))?,
        },
        _ => return Ok(raw),
    };
    Ok(Bytes::from(decoded))
}

fn inflate<R: Read>(mut decoder: R) -> Result<Vec<u8>, HttpError> {
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| ProtocolError::BodyDecoding(err.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tokio::io::{AsyncWriteExt, duplex};

    fn url() -> Url {
        Url::parse("http://example.com/start").unwrap()
    }

    async fn read(raw: Vec<u8>, method: Method) -> Result<Response, HttpError> {
        let (mut client, mut server) = duplex(64 * 1024);
        server.write_all(&raw).await.unwrap();
        drop(server);
        read_response(&mut client, &method, &url(), Duration::from_secs(5)).await
    }

    #[tokio::test]
    async fn reads_content_length_body_and_hints() {
        let response = read(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nKeep-Alive: timeout=7, max=3\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\nhelloEXTRA".to_vec(),
            Method::GET,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text(), "hello");
        assert_eq!(response.keep_alive().timeout, Some(Duration::from_secs(7)));
        assert_eq!(response.keep_alive().max, Some(3));
        assert!(!response.keep_alive().close);
        assert_eq!(response.set_cookie_headers(), vec!["a=1", "b=2"]);
    }

    #[tokio::test]
    async fn reads_chunked_gzip_body() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let gz = encoder.finish().unwrap();

        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: gzip\r\n\r\n".to_vec();
        let (first, second) = gz.split_at(gz.len() / 2);
        for part in [first, second] {
            raw.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
            raw.extend_from_slice(part);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"0\r\n\r\n");

        let response = read(raw, Method::GET).await.unwrap();
        assert_eq!(response.text(), "compressed payload");
    }

    #[tokio::test]
    async fn resolves_relative_redirects_and_skips_interim_responses() {
        let response = read(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 302 Found\r\nLocation: /next?x=1\r\nContent-Length: 0\r\n\r\n".to_vec(),
            Method::GET,
        )
        .await
        .unwrap();
        assert_eq!(response.status(), 302);
        assert_eq!(
            response.redirect_address().map(Url::as_str),
            Some("http://example.com/next?x=1")
        );
    }

    #[tokio::test]
    async fn reads_until_close_without_length() {
        let response = read(b"HTTP/1.0 200 OK\r\n\r\nbody".to_vec(), Method::GET)
            .await
            .unwrap();
        assert_eq!(response.text(), "body");
        assert!(response.keep_alive().close);
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let response = read(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec(), Method::HEAD)
            .await
            .unwrap();
        assert!(response.bytes().is_empty());
    }

    #[tokio::test]
    async fn oversized_lengths_are_rejected() {
        let err = read(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc\r\n0\r\n\r\n".to_vec(),
            Method::GET,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HttpError::Protocol(ProtocolError::MalformedHeaders(_))), "{err}");

        let err = read(
            b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc".to_vec(),
            Method::GET,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HttpError::Protocol(ProtocolError::MalformedHeaders(_))), "{err}");
    }

    #[tokio::test]
    async fn classifies_empty_and_malformed_replies() {
        let err = read(Vec::new(), Method::GET).await.unwrap_err();
        assert!(matches!(err, HttpError::Protocol(ProtocolError::EmptyResponse)));

        let err = read(b"NOPE\r\n\r\n".to_vec(), Method::GET).await.unwrap_err();
        assert!(matches!(err, HttpError::Protocol(ProtocolError::MalformedStatusLine(_))));
    }
}
