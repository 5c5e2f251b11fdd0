//! PROXY protocol v1/v2 sniffing listener (§4.L), grounded on the original
//! project's `service/socket/proxy_protocol.go`.

pub mod serve;

pub use serve::serve;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const PEEK_BUF_LEN: usize = 32;
const PEEK_DEADLINE: Duration = Duration::from_secs(2);
const V1_PREFIX: &[u8] = b"PROXY ";
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";

/// A TCP connection with zero or more bytes already read off the wire and
/// buffered for replay, plus the address callers should treat as the
/// "real" remote peer (the PROXY-protocol-reported address when present).
pub struct SniffedConnection {
    pub stream: TcpStream,
    pub replay: Vec<u8>,
    pub real_remote_addr: SocketAddr,
}

/// Peeks up to [`PEEK_BUF_LEN`] bytes (2s deadline) to detect a PROXY
/// protocol v1/v2 preamble. On any error, timeout, or non-PROXY prefix,
/// falls back to a plain passthrough that replays whatever was peeked.
pub async fn sniff(mut stream: TcpStream, fallback_addr: SocketAddr) -> SniffedConnection {
    let mut buf = [0u8; PEEK_BUF_LEN];
    let peeked = match tokio::time::timeout(PEEK_DEADLINE, peek_some(&mut stream, &mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(err)) => {
            debug!(error = %err, "peek failed, falling back to plain passthrough");
            0
        }
        Err(_) => {
            debug!("peek timed out, falling back to plain passthrough");
            0
        }
    };

    let peeked_bytes = &buf[..peeked];
    if peeked_bytes.starts_with(V1_PREFIX) {
        if let Some((real_addr, consumed)) = parse_v1(peeked_bytes) {
            return SniffedConnection {
                stream,
                replay: peeked_bytes[consumed..].to_vec(),
                real_remote_addr: real_addr,
            };
        }
    } else if peeked_bytes.starts_with(V2_SIGNATURE) {
        warn!("PROXY protocol v2 detected but this build only parses v1 headers; treating as plain");
    }

    SniffedConnection {
        stream,
        replay: peeked_bytes.to_vec(),
        real_remote_addr: fallback_addr,
    }
}

/// Reads whatever bytes are currently available (best-effort, non-blocking
/// past the first successful read) into `buf`, returning the count read.
async fn peek_some(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    std::future::poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match std::pin::Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
            std::task::Poll::Ready(Ok(())) => std::task::Poll::Ready(Ok(read_buf.filled().len())),
            std::task::Poll::Ready(Err(e)) => std::task::Poll::Ready(Err(e)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    })
    .await
}

/// Parses a PROXY protocol v1 header line (`"PROXY TCP4 src dst sport dport\r\n"`),
/// returning the source address and the number of bytes the header
/// occupied, so the remaining peeked bytes can be replayed to the reader.
fn parse_v1(buf: &[u8]) -> Option<(SocketAddr, usize)> {
    let text = std::str::from_utf8(buf).ok()?;
    let end = text.find("\r\n")?;
    let line = &text[..end];
    let mut parts = line.split_whitespace();
    let _proxy = parts.next()?;
    let _proto = parts.next()?;
    let src_ip = parts.next()?;
    let _dst_ip = parts.next()?;
    let src_port: u16 = parts.next()?.parse().ok()?;
    let addr: SocketAddr = format!("{src_ip}:{src_port}").parse().ok()?;
    Some((addr, end + 2))
}

/// Wraps a sniffed connection so the first read returns any replayed bytes
/// before falling through to the underlying socket.
pub struct ReplayStream {
    replay: Vec<u8>,
    inner: TcpStream,
}

impl ReplayStream {
    pub fn new(conn: SniffedConnection) -> Self {
        Self {
            replay: conn.replay,
            inner: conn.stream,
        }
    }

    /// Wraps a connection that was never peeked (PROXY protocol disabled).
    pub fn passthrough(stream: TcpStream) -> Self {
        Self {
            replay: Vec::new(),
            inner: stream,
        }
    }
}

impl AsyncRead for ReplayStream {
    fn poll_read(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut ReadBuf<'_>) -> std::task::Poll<io::Result<()>> {
        if !self.replay.is_empty() {
            let n = self.replay.len().min(buf.remaining());
            buf.put_slice(&self.replay[..n]);
            self.replay.drain(..n);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayStream {
    fn poll_write(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Stamps `X-Real-IP`/`X-Forwarded-For` from the effective remote address.
pub fn real_ip_headers(real_remote_addr: SocketAddr) -> [(&'static str, String); 2] {
    let ip = real_remote_addr.ip().to_string();
    [("x-real-ip", ip.clone()), ("x-forwarded-for", ip)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_v1_header_and_returns_bytes_consumed() {
        let line = b"PROXY TCP4 203.0.113.5 198.51.100.1 56324 443\r\nGET / HTTP/1.1\r\n";
        let (addr, consumed) = parse_v1(line).unwrap();
        assert_eq!(addr.to_string(), "203.0.113.5:56324");
        assert_eq!(&line[consumed..consumed + 3], b"GET");
    }

    #[test]
    fn non_proxy_prefix_is_rejected() {
        assert!(parse_v1(b"GET / HTTP/1.1\r\n").is_none());
    }

    #[test]
    fn real_ip_headers_are_derived_from_the_resolved_address() {
        let addr: SocketAddr = "203.0.113.5:56324".parse().unwrap();
        let headers = real_ip_headers(addr);
        assert_eq!(headers[0], ("x-real-ip", "203.0.113.5".to_string()));
        assert_eq!(headers[1], ("x-forwarded-for", "203.0.113.5".to_string()));
    }
}
