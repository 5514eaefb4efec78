//! HTTP Upgrade bootstrap for relay connections.
//!
//! The client sends a `GET` carrying `Upgrade: meshlink-relay` and
//! `Connection: Upgrade`; the server answers `101 Switching Protocols` and both
//! sides switch to the frame stream. Heads are read one byte at a time so no
//! frame bytes following the blank line are consumed.

use crate::error::{RelayError, Result};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upgrade token identifying the relay protocol
pub const UPGRADE_TOKEN: &str = "meshlink-relay";

/// Default request path
pub const DEFAULT_PATH: &str = "/relay";

const MAX_HEAD_LEN: usize = 8 * 1024;

/// Broker location parsed from a peer's relay URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUrl {
    /// Host name or IP literal (without brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request path
    pub path: String,
}

impl RelayUrl {
    /// `host:port` form used for `Host:` and connecting
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for RelayUrl {
    type Err = RelayError;

    /// Accepts `http://host[:port][/path]` or a bare `host[:port]`.
    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("http://").unwrap_or(s);
        if rest.contains("://") {
            return Err(RelayError::Upgrade(format!("unsupported scheme in {s}")));
        }

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, DEFAULT_PATH),
        };

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| RelayError::Upgrade(format!("unterminated IPv6 literal in {s}")))?;
            let host = &stripped[..end];
            let port = match stripped[end + 1..].strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None => crate::DEFAULT_RELAY_PORT,
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host, parse_port(p, s)?),
                None => (authority, crate::DEFAULT_RELAY_PORT),
            }
        };

        if host.is_empty() {
            return Err(RelayError::Upgrade(format!("missing host in {s}")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.authority(), self.path)
    }
}

fn parse_port(p: &str, url: &str) -> Result<u16> {
    p.parse()
        .map_err(|_| RelayError::Upgrade(format!("invalid port in {url}")))
}

/// Parsed request or response head
#[derive(Debug)]
struct Head {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl Head {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header lists `token` (case-insensitive)
    fn has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }
}

async fn read_head<S>(stream: &mut S) -> Result<Head>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut raw = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if raw.len() >= MAX_HEAD_LEN {
            return Err(RelayError::Upgrade("header section too large".into()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(RelayError::Closed);
        }
        raw.push(byte[0]);
    }

    let text = std::str::from_utf8(&raw[..raw.len() - 4])
        .map_err(|_| RelayError::Upgrade("header section is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| RelayError::Upgrade(format!("malformed header line {line:?}")))?;
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    Ok(Head {
        start_line,
        headers,
    })
}

/// Client side: request the upgrade and wait for `101`
///
/// # Errors
///
/// Returns [`RelayError::Upgrade`] if the server refuses or answers with
/// something other than a matching `101`.
pub async fn client_upgrade<S>(stream: &mut S, url: &RelayUrl, token: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: {token}\r\nConnection: Upgrade\r\n\r\n",
        url.path,
        url.authority()
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(stream).await?;
    let status = head.start_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "101" {
        return Err(RelayError::Upgrade(format!(
            "server answered {:?}",
            head.start_line
        )));
    }
    if !head.has_token("Upgrade", token) {
        return Err(RelayError::Upgrade(format!(
            "server switched to {:?}",
            head.header("Upgrade").unwrap_or_default()
        )));
    }
    debug!(url = %url, "relay upgrade complete");
    Ok(())
}

/// Server side: validate the request and answer `101`.
///
/// Returns the requested path. Refused requests get a `400` or `426`
/// response before the error is returned.
///
/// # Errors
///
/// Returns [`RelayError::Upgrade`] for malformed or non-relay requests.
pub async fn accept_upgrade<S>(stream: &mut S, token: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let head = read_head(stream).await?;
    let mut parts = head.start_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) if v.starts_with("HTTP/1.") => (m, p.to_string()),
        _ => {
            refuse(stream, "400 Bad Request", token).await?;
            return Err(RelayError::Upgrade(format!(
                "malformed request line {:?}",
                head.start_line
            )));
        }
    };

    if method != "GET" {
        refuse(stream, "400 Bad Request", token).await?;
        return Err(RelayError::Upgrade(format!("unexpected method {method}")));
    }
    if !head.has_token("Upgrade", token) || !head.has_token("Connection", "upgrade") {
        refuse(stream, "426 Upgrade Required", token).await?;
        return Err(RelayError::Upgrade("missing relay upgrade headers".into()));
    }

    let response =
        format!("HTTP/1.1 101 Switching Protocols\r\nUpgrade: {token}\r\nConnection: Upgrade\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(path)
}

async fn refuse<S>(stream: &mut S, status: &str, token: &str) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let response = format!(
        "HTTP/1.1 {status}\r\nUpgrade: {token}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_forms() {
        let url: RelayUrl = "http://relay.example.com:9000/mesh".parse().unwrap();
        assert_eq!(url.host, "relay.example.com");
        assert_eq!(url.port, 9000);
        assert_eq!(url.path, "/mesh");

        let url: RelayUrl = "127.0.0.1".parse().unwrap();
        assert_eq!(url.port, crate::DEFAULT_RELAY_PORT);
        assert_eq!(url.path, DEFAULT_PATH);

        let url: RelayUrl = "http://[::1]:7000".parse().unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.authority(), "[::1]:7000");
        assert_eq!(url.to_string(), "http://[::1]:7000/relay");
    }

    #[test]
    fn test_parse_url_rejects() {
        assert!("https://relay:443".parse::<RelayUrl>().is_err());
        assert!("relay:notaport".parse::<RelayUrl>().is_err());
        assert!(":8080".parse::<RelayUrl>().is_err());
    }

    #[tokio::test]
    async fn test_upgrade_handshake() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let url: RelayUrl = "http://localhost:8080/relay".parse().unwrap();

        let server_task = tokio::spawn(async move {
            let path = accept_upgrade(&mut server, UPGRADE_TOKEN).await.unwrap();
            // First frame byte after the head must still be unread
            let mut byte = [0u8; 1];
            server.read_exact(&mut byte).await.unwrap();
            (path, byte[0])
        });

        client_upgrade(&mut client, &url, UPGRADE_TOKEN).await.unwrap();
        client.write_all(b"M").await.unwrap();

        let (path, first) = server_task.await.unwrap();
        assert_eq!(path, "/relay");
        assert_eq!(first, b'M');
    }

    #[tokio::test]
    async fn test_wrong_token_refused() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let url: RelayUrl = "localhost:8080".parse().unwrap();

        let server_task =
            tokio::spawn(async move { accept_upgrade(&mut server, UPGRADE_TOKEN).await });

        let err = client_upgrade(&mut client, &url, "websocket").await.unwrap_err();
        assert!(matches!(err, RelayError::Upgrade(_)));
        assert!(server_task.await.unwrap().is_err());
    }
}
