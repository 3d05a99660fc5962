/* Secure Proxy (AGPL-3.0)

Copyright (C) 2025 - Secure Proxy Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Connection preamble classification.
//!
//! The first bytes of every accepted connection are read into a buffer,
//! classified as TLS (leading `0x16` handshake record, hostname from the
//! ClientHello SNI extension) or plaintext HTTP (hostname from the `Host:`
//! header), and then replayed downstream through [`ReplayStream`] so the TLS
//! acceptor or HTTP reader observes an untouched byte stream.
//!
//! Every offset is bounds-checked; malformed or hostile preambles produce an
//! error (the caller closes the connection silently) rather than a panic.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use thiserror::Error;
use tls_parser::{TlsExtension, TlsMessage, TlsMessageHandshake};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::{timeout, Duration},
};

/// Upper bound on buffered preamble bytes.
pub const MAX_PREAMBLE: usize = 16 * 1024;
/// Deadline per read while waiting for enough bytes to classify.
const READ_DEADLINE: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum PeekError {
    #[error("connection closed before classification")]
    Closed,
    #[error("no bytes within the peek deadline")]
    Timeout,
    #[error("preamble exceeded {MAX_PREAMBLE} bytes")]
    TooLarge,
    #[error("malformed preamble: {0}")]
    Malformed(&'static str),
    #[error("preamble read failed: {0}")]
    Io(#[from] io::Error),
}

/// Protocol spoken by the intercepted client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Http,
}

/// Classified preamble: protocol, target hostname, and the exact bytes
/// consumed (replayed into the downstream reader).
#[derive(Debug)]
pub struct Preamble {
    pub protocol: Protocol,
    pub host: String,
    pub buffered: Vec<u8>,
}

enum Classified {
    NeedMore,
    Tls(String),
    Http(String),
    Malformed(&'static str),
}

/// Reads until the connection can be classified, or fails.
pub async fn read_preamble(stream: &mut TcpStream) -> Result<Preamble, PeekError> {
    let mut buffered = Vec::with_capacity(2048);
    let mut chunk = [0u8; 4096];

    loop {
        let n = timeout(READ_DEADLINE, stream.read(&mut chunk))
            .await
            .map_err(|_| PeekError::Timeout)??;
        if n == 0 {
            return Err(PeekError::Closed);
        }
        buffered.extend_from_slice(&chunk[..n]);

        match classify(&buffered) {
            Classified::Tls(host) => {
                return Ok(Preamble {
                    protocol: Protocol::Tls,
                    host: normalize_host(&host),
                    buffered,
                })
            }
            Classified::Http(host) => {
                return Ok(Preamble {
                    protocol: Protocol::Http,
                    host: normalize_host(&host),
                    buffered,
                })
            }
            Classified::Malformed(why) => return Err(PeekError::Malformed(why)),
            Classified::NeedMore => {
                if buffered.len() >= MAX_PREAMBLE {
                    return Err(PeekError::TooLarge);
                }
            }
        }
    }
}

fn classify(buf: &[u8]) -> Classified {
    match buf.first() {
        Some(0x16) => classify_tls(buf),
        Some(_) => classify_http(buf),
        None => Classified::NeedMore,
    }
}

/// TLS record header is 5 bytes: type, version, length. The whole first
/// record must be buffered before the ClientHello parse is attempted.
fn classify_tls(buf: &[u8]) -> Classified {
    if buf.len() < 5 {
        return Classified::NeedMore;
    }
    let record_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if record_len == 0 {
        return Classified::Malformed("empty TLS record");
    }
    if 5 + record_len > MAX_PREAMBLE {
        return Classified::Malformed("oversized TLS record");
    }
    if buf.len() < 5 + record_len {
        return Classified::NeedMore;
    }

    match extract_sni(&buf[..5 + record_len]) {
        Some(host) if !host.is_empty() => Classified::Tls(host),
        Some(_) => Classified::Malformed("empty SNI hostname"),
        None => Classified::Malformed("ClientHello without usable SNI"),
    }
}

/// Walks one complete TLS plaintext record looking for the `server_name`
/// extension (type `host_name`).
fn extract_sni(record: &[u8]) -> Option<String> {
    let (_, plaintext) = tls_parser::parse_tls_plaintext(record).ok()?;

    let TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) = plaintext.msg.first()?
    else {
        return None;
    };

    let ext_data = hello.ext?;
    let (_, extensions) = tls_parser::parse_tls_extensions(ext_data).ok()?;
    for ext in extensions {
        if let TlsExtension::SNI(names) = ext {
            for (kind, raw) in names {
                if kind == tls_parser::SNIType::HostName {
                    if let Ok(host) = std::str::from_utf8(raw) {
                        return Some(host.to_string());
                    }
                }
            }
        }
    }
    None
}

fn classify_http(buf: &[u8]) -> Classified {
    let Some(head_end) = find_double_crlf(buf) else {
        return Classified::NeedMore;
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let host = strip_port(value.trim());
            if host.is_empty() {
                return Classified::Malformed("empty Host header");
            }
            return Classified::Http(host.to_string());
        }
    }
    Classified::Malformed("missing Host header")
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Drops an explicit `:port` suffix. Bracketed IPv6 literals lose their
/// brackets so the result feeds straight into the resolver.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.split_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Serves the already-consumed preamble bytes before delegating to the inner
/// stream; writes pass straight through.
pub struct ReplayStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Hand-assembled minimal ClientHello carrying one SNI entry.
    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let name = host.as_bytes();

        // server_name extension payload: list length, type 0, name length, name.
        let mut sni = Vec::new();
        sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        sni.push(0);
        sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni.extend_from_slice(name);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // extension type 0 = server_name
        extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version TLS 1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id length
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
        body.push(1); // compression methods length
        body.push(0); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn classifies_client_hello_sni() {
        let record = client_hello_with_sni("Example.COM");
        match classify(&record) {
            Classified::Tls(host) => assert_eq!(host, "Example.COM"),
            _ => panic!("expected TLS classification"),
        }
    }

    #[test]
    fn partial_record_needs_more_bytes() {
        let record = client_hello_with_sni("example.com");
        for cut in [1, 4, 10, record.len() - 1] {
            assert!(matches!(classify(&record[..cut]), Classified::NeedMore));
        }
    }

    #[test]
    fn truncated_garbage_inside_record_is_malformed() {
        let mut record = client_hello_with_sni("example.com");
        let len = record.len();
        record[10..len].fill(0xff);
        assert!(matches!(classify(&record), Classified::Malformed(_)));
    }

    #[test]
    fn classifies_http_host_header() {
        let raw = b"GET /a HTTP/1.1\r\nUser-Agent: curl\r\nHOST: Example.com:8080\r\n\r\n";
        match classify(raw) {
            Classified::Http(host) => assert_eq!(host, "Example.com"),
            _ => panic!("expected HTTP classification"),
        }
    }

    #[test]
    fn http_without_host_is_malformed() {
        let raw = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(matches!(classify(raw), Classified::Malformed(_)));
    }

    #[test]
    fn incomplete_http_head_needs_more() {
        let raw = b"GET / HTTP/1.1\r\nHost: a.com\r\n";
        assert!(matches!(classify(raw), Classified::NeedMore));
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("host:notaport"), "host:notaport");
    }

    #[tokio::test]
    async fn replay_stream_serves_prefix_then_inner() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);

        let mut replay = ReplayStream::new(b"hello".to_vec(), client);
        let mut out = Vec::new();
        replay.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn preamble_read_times_out_on_silence() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();

        let err = read_preamble(&mut accepted).await.unwrap_err();
        assert!(matches!(err, PeekError::Timeout));
    }
}
