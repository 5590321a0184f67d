//! Delay probe
//!
//! Measures round-trip delay to a URL through the engine's local SOCKS5
//! inbound.
//!
//! ```text
//! probe → SOCKS5 (127.0.0.1:socks_port) → engine → upstream → URL
//! ```
//!
//! For `http` URLs the measured span ends at the first response status
//! line of a `HEAD` request. For `https` URLs it ends at the SOCKS5
//! CONNECT reply, since no TLS stack is carried.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use url::{Host, Url};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported probe scheme: {0}")]
    UnsupportedScheme(String),

    #[error("SOCKS5 protocol error: {0}")]
    Socks(&'static str),

    #[error("SOCKS5 CONNECT rejected with code {0}")]
    Rejected(u8),

    #[error("Bad HTTP response: {0}")]
    BadResponse(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse and check a probe URL
pub fn parse_url(url: &str) -> Result<Url, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(ProbeError::UnsupportedScheme(other.to_string())),
    }
    if parsed.host().is_none() {
        return Err(ProbeError::InvalidUrl(format!("{}: missing host", url)));
    }
    Ok(parsed)
}

/// Measure the delay to `url` through the SOCKS5 proxy at `proxy`.
pub async fn measure(proxy: SocketAddr, url: &Url) -> Result<Duration, ProbeError> {
    let host = url
        .host()
        .ok_or_else(|| ProbeError::InvalidUrl(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::InvalidUrl(url.to_string()))?;

    let started = Instant::now();
    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;

    // ===== Greeting =====
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(ProbeError::Socks("invalid version"));
    }
    if choice[1] != AUTH_NO_AUTH {
        return Err(ProbeError::Socks("proxy requires authentication"));
    }

    // ===== CONNECT =====
    stream.write_all(&connect_request(&host, port)?).await?;
    read_reply(&mut stream).await?;

    if url.scheme() == "https" {
        let elapsed = started.elapsed();
        debug!(?elapsed, "probe reached {} (CONNECT only)", url);
        return Ok(elapsed);
    }

    // ===== HTTP HEAD =====
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: v2tun\r\nConnection: close\r\n\r\n",
        path,
        host_header(&host, port, url.port().is_some())
    );
    stream.write_all(request.as_bytes()).await?;

    let mut status_line = String::new();
    BufReader::new(&mut stream).read_line(&mut status_line).await?;
    let status = parse_status(&status_line)?;

    let elapsed = started.elapsed();
    debug!(status, ?elapsed, "probe reached {}", url);
    Ok(elapsed)
}

/// [`measure`] on a private runtime, bounded by `timeout`.
///
/// Must not be called from inside a tokio runtime.
pub fn measure_blocking(proxy: SocketAddr, url: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let url = parse_url(url)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match tokio::time::timeout(timeout, measure(proxy, &url)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        }
    })
}

fn connect_request(host: &Host<&str>, port: u16) -> Result<Vec<u8>, ProbeError> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match host {
        Host::Ipv4(ip) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Host::Ipv6(ip) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Host::Domain(domain) => {
            let len = u8::try_from(domain.len()).map_err(|_| ProbeError::Socks("domain too long"))?;
            request.push(ADDR_DOMAIN);
            request.push(len);
            request.extend_from_slice(domain.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

async fn read_reply(stream: &mut TcpStream) -> Result<(), ProbeError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(ProbeError::Socks("invalid version in reply"));
    }
    if header[1] != REPLY_SUCCESS {
        return Err(ProbeError::Rejected(header[1]));
    }

    // Bound address is unused, but must be drained
    let addr_len = match header[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(ProbeError::Socks("invalid address type in reply")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn host_header(host: &Host<&str>, port: u16, explicit_port: bool) -> String {
    let host = match host {
        Host::Ipv6(ip) => format!("[{}]", IpAddr::V6(*ip)),
        other => other.to_string(),
    };
    if explicit_port {
        format!("{}:{}", host, port)
    } else {
        host
    }
}

fn parse_status(line: &str) -> Result<u16, ProbeError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| ProbeError::BadResponse(line.trim().to_string())),
        _ => Err(ProbeError::BadResponse(line.trim().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal SOCKS5 server answering one connection with `reply`, then
    /// one HTTP status line.
    async fn fake_proxy(reply: u8) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await.unwrap();

            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            assert_eq!(header[3], ADDR_DOMAIN);
            let mut rest = vec![0u8; header[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();

            stream
                .write_all(&[SOCKS5_VERSION, reply, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            if reply != REPLY_SUCCESS {
                return rest;
            }

            let mut request = vec![0u8; 512];
            let n = stream.read(&mut request).await.unwrap();
            request.truncate(n);
            let _ = stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await;
            request
        });

        (addr, task)
    }

    #[tokio::test]
    async fn test_http_probe() {
        let (proxy, server) = fake_proxy(REPLY_SUCCESS).await;
        let url = parse_url("http://www.gstatic.com/generate_204").unwrap();

        let elapsed = measure(proxy, &url).await.unwrap();
        assert!(elapsed < Duration::from_secs(5));

        let request = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(request.starts_with("HEAD /generate_204 HTTP/1.1\r\n"));
        assert!(request.contains("Host: www.gstatic.com\r\n"));
    }

    #[tokio::test]
    async fn test_https_probe_stops_at_connect() {
        let (proxy, server) = fake_proxy(REPLY_SUCCESS).await;
        let url = parse_url("https://www.google.com/generate_204").unwrap();

        measure(proxy, &url).await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (proxy, server) = fake_proxy(0x05).await;
        let url = parse_url("http://example.com/").unwrap();

        let err = measure(proxy, &url).await.unwrap_err();
        assert!(matches!(err, ProbeError::Rejected(0x05)));

        let rest = server.await.unwrap();
        assert_eq!(&rest[..rest.len() - 2], b"example.com");
        assert_eq!(&rest[rest.len() - 2..], &80u16.to_be_bytes());
    }

    #[test]
    fn test_blocking_probe_times_out() {
        // Accepts but never answers the greeting
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy = listener.local_addr().unwrap();

        let started = Instant::now();
        let err = measure_blocking(proxy, "http://example.com/", Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, ProbeError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[test]
    fn test_parse_url() {
        assert!(parse_url("http://example.com/").is_ok());
        assert!(matches!(parse_url("ftp://example.com/"), Err(ProbeError::UnsupportedScheme(_))));
        assert!(matches!(parse_url("not a url"), Err(ProbeError::InvalidUrl(_))));
    }

    #[test]
    fn test_connect_request_encoding() {
        let request = connect_request(&Host::Ipv4("1.2.3.4".parse().unwrap()), 443).unwrap();
        assert_eq!(request, vec![5, 1, 0, ADDR_IPV4, 1, 2, 3, 4, 0x01, 0xBB]);
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("HTTP/1.1 204 No Content\r\n").unwrap(), 204);
        assert!(parse_status("garbage\r\n").is_err());
        assert!(parse_status("").is_err());
    }
}
