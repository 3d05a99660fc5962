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

//! Minimal HTTP/1.x request-head handling.
//!
//! The bridge forwards request bytes verbatim; this module only needs to
//! find request boundaries. It parses the request line and headers (bounded),
//! determines body framing (Content-Length or chunked), and serializes the
//! proxy's own 403/502 responses. Response bytes are never parsed: the relay
//! copies them opaquely, so chunked handling here is an incremental scanner
//! that tracks where a request body ends without buffering it.

use thiserror::Error;

/// Request line cap.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Header block cap (everything after the request line).
pub const MAX_HEADER_BLOCK: usize = 8 * 1024;
/// Header line count cap.
pub const MAX_HEADER_LINES: usize = 64;
/// Total head accumulation cap derived from the two block caps.
pub const MAX_HEAD: usize = MAX_REQUEST_LINE + MAX_HEADER_BLOCK;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("request head exceeds limits")]
    HeadTooLarge,
    #[error("request line exceeds {MAX_REQUEST_LINE} bytes")]
    RequestLineTooLong,
    #[error("header block exceeds {MAX_HEADER_BLOCK} bytes")]
    HeaderBlockTooLarge,
    #[error("more than {MAX_HEADER_LINES} header lines")]
    TooManyHeaders,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("invalid Content-Length header")]
    BadContentLength,
    #[error("invalid chunked framing")]
    BadChunk,
}

/// Parsed request head. `target` is the raw request-target including any
/// query string; rule matching is a literal prefix over it.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub host_header: Option<String>,
    pub framing: BodyFraming,
}

/// Index just past the `\r\n\r\n` terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parses a complete head (`head` includes the terminating blank line).
pub fn parse_head(head: &[u8]) -> Result<RequestHead, HttpError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HttpError::BadRequestLine)?;
    if request_line.len() > MAX_REQUEST_LINE {
        return Err(HttpError::RequestLineTooLong);
    }
    if head.len() - request_line.len() > MAX_HEADER_BLOCK + 2 {
        return Err(HttpError::HeaderBlockTooLarge);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(HttpError::BadRequestLine)?;
    let target = parts.next().ok_or(HttpError::BadRequestLine)?;
    if method.is_empty() || target.is_empty() {
        return Err(HttpError::BadRequestLine);
    }

    let mut host_header = None;
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut header_lines = 0usize;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        header_lines += 1;
        if header_lines > MAX_HEADER_LINES {
            return Err(HttpError::TooManyHeaders);
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host_header = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(value.parse().map_err(|_| HttpError::BadContentLength)?);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .to_ascii_lowercase()
                .split(',')
                .any(|enc| enc.trim() == "chunked");
        }
    }

    let framing = if chunked {
        BodyFraming::Chunked(ChunkScanner::new())
    } else {
        match content_length {
            Some(0) | None => BodyFraming::None,
            Some(len) => BodyFraming::Exact(len),
        }
    };

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        host_header,
        framing,
    })
}

/// How the request body is delimited on the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes remain.
    Exact(u64),
    /// Chunked transfer coding; tracked incrementally.
    Chunked(ChunkScanner),
}

impl BodyFraming {
    pub fn has_body(&self) -> bool {
        !matches!(self, BodyFraming::None)
    }

    /// Consumes body bytes from `data`. Returns how many bytes belong to this
    /// body and whether the body is now complete. All consumed bytes are
    /// forwarded verbatim (chunk size lines and trailers included).
    pub fn advance(&mut self, data: &[u8]) -> Result<(usize, bool), HttpError> {
        match self {
            BodyFraming::None => Ok((0, true)),
            BodyFraming::Exact(remaining) => {
                let take = (*remaining).min(data.len() as u64);
                *remaining -= take;
                Ok((take as usize, *remaining == 0))
            }
            BodyFraming::Chunked(scanner) => scanner.advance(data),
        }
    }
}

/// Incremental scanner for chunked transfer coding. Consumes bytes and
/// reports when the terminating chunk (and trailer section) has passed.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkScanner {
    state: ChunkState,
    /// Bytes left in the current chunk's data section.
    remaining: u64,
    /// Accumulated hex digits of the size line, capped defensively.
    size_line: Vec<u8>,
    /// Whether the current trailer line has any bytes (a bare CRLF ends the
    /// trailer section).
    trailer_line_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkState {
    SizeLine,
    Data,
    DataCr,
    DataLf,
    Trailer,
    Done,
}

const MAX_CHUNK_SIZE_LINE: usize = 256;

impl ChunkScanner {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeLine,
            remaining: 0,
            size_line: Vec::new(),
            trailer_line_len: 0,
        }
    }

    fn advance(&mut self, data: &[u8]) -> Result<(usize, bool), HttpError> {
        let mut i = 0usize;

        while i < data.len() && self.state != ChunkState::Done {
            match self.state {
                ChunkState::SizeLine => {
                    let byte = data[i];
                    i += 1;
                    if byte == b'\n' {
                        let size = parse_chunk_size(&self.size_line)?;
                        self.size_line.clear();
                        if size == 0 {
                            self.state = ChunkState::Trailer;
                            self.trailer_line_len = 0;
                        } else {
                            self.remaining = size;
                            self.state = ChunkState::Data;
                        }
                    } else {
                        if self.size_line.len() >= MAX_CHUNK_SIZE_LINE {
                            return Err(HttpError::BadChunk);
                        }
                        self.size_line.push(byte);
                    }
                }
                ChunkState::Data => {
                    // Skip over as much of the chunk as this buffer holds.
                    let take = self.remaining.min((data.len() - i) as u64);
                    i += take as usize;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if data[i] != b'\r' {
                        return Err(HttpError::BadChunk);
                    }
                    i += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if data[i] != b'\n' {
                        return Err(HttpError::BadChunk);
                    }
                    i += 1;
                    self.state = ChunkState::SizeLine;
                }
                ChunkState::Trailer => {
                    let byte = data[i];
                    i += 1;
                    if byte == b'\n' {
                        if self.trailer_line_len == 0 {
                            self.state = ChunkState::Done;
                        } else {
                            self.trailer_line_len = 0;
                        }
                    } else if byte != b'\r' {
                        self.trailer_line_len += 1;
                    }
                }
                ChunkState::Done => break,
            }
        }

        Ok((i, self.state == ChunkState::Done))
    }
}

impl Default for ChunkScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::BadChunk)?;
    let token = text
        .trim_end_matches('\r')
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    if token.is_empty() {
        return Err(HttpError::BadChunk);
    }
    u64::from_str_radix(token, 16).map_err(|_| HttpError::BadChunk)
}

/// The 403 the proxy answers with when a request is blocked. The reason is
/// the response body.
pub fn forbidden_response(reason: &str) -> Vec<u8> {
    text_response("403 Forbidden", reason)
}

/// Answered on the plaintext path when the upstream dial fails.
pub fn bad_gateway_response(reason: &str) -> Vec<u8> {
    text_response("502 Bad Gateway", reason)
}

fn text_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        parse_head(raw.as_bytes()).unwrap()
    }

    #[test]
    fn parses_request_line_and_headers() {
        let h = head("GET /repos/o/r?x=1 HTTP/1.1\r\nHost: api.github.com\r\nAccept: */*\r\n\r\n");
        assert_eq!(h.method, "GET");
        assert_eq!(h.target, "/repos/o/r?x=1");
        assert_eq!(h.host_header.as_deref(), Some("api.github.com"));
        assert_eq!(h.framing, BodyFraming::None);
    }

    #[test]
    fn content_length_framing() {
        let h = head("POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(h.framing, BodyFraming::Exact(5));
    }

    #[test]
    fn chunked_framing_wins_over_content_length() {
        let h = head(
            "POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(h.framing, BodyFraming::Chunked(_)));
    }

    #[test]
    fn rejects_garbage_request_line() {
        assert_eq!(
            parse_head(b"NOPE\r\n\r\n").unwrap_err(),
            HttpError::BadRequestLine
        );
        assert_eq!(
            parse_head(b"\r\n\r\n").unwrap_err(),
            HttpError::BadRequestLine
        );
    }

    #[test]
    fn rejects_bad_content_length() {
        assert_eq!(
            parse_head(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n").unwrap_err(),
            HttpError::BadContentLength
        );
    }

    #[test]
    fn rejects_too_many_header_lines() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..(MAX_HEADER_LINES + 1) {
            raw.push_str(&format!("X-Fill-{i}: v\r\n"));
        }
        raw.push_str("\r\n");
        assert_eq!(
            parse_head(raw.as_bytes()).unwrap_err(),
            HttpError::TooManyHeaders
        );
    }

    #[test]
    fn exact_framing_counts_down_across_reads() {
        let mut framing = BodyFraming::Exact(10);
        let (n, done) = framing.advance(b"12345").unwrap();
        assert_eq!((n, done), (5, false));
        let (n, done) = framing.advance(b"67890TRAILING").unwrap();
        assert_eq!((n, done), (5, true));
    }

    #[test]
    fn chunked_scanner_finds_end_single_buffer() {
        let body = b"5\r\nhello\r\n3\r\nabc\r\n0\r\n\r\nNEXT";
        let mut framing = BodyFraming::Chunked(ChunkScanner::new());
        let (n, done) = framing.advance(body).unwrap();
        assert!(done);
        assert_eq!(&body[n..], b"NEXT");
    }

    #[test]
    fn chunked_scanner_survives_byte_by_byte_delivery() {
        let body = b"4\r\nwiki\r\n0\r\nX-Trailer: v\r\n\r\n";
        let mut framing = BodyFraming::Chunked(ChunkScanner::new());
        let mut done = false;
        let mut total = 0;
        for i in 0..body.len() {
            let (n, d) = framing.advance(&body[i..i + 1]).unwrap();
            total += n;
            if d {
                done = true;
                assert_eq!(i, body.len() - 1);
            }
        }
        assert!(done);
        assert_eq!(total, body.len());
    }

    #[test]
    fn chunked_scanner_handles_chunk_extensions() {
        let body = b"5;ext=1\r\nhello\r\n0\r\n\r\n";
        let mut scanner = ChunkScanner::new();
        let (n, done) = scanner.advance(body).unwrap();
        assert!(done);
        assert_eq!(n, body.len());
    }

    #[test]
    fn chunked_scanner_rejects_bad_terminator() {
        let body = b"2\r\nab!!";
        let mut scanner = ChunkScanner::new();
        assert_eq!(scanner.advance(body).unwrap_err(), HttpError::BadChunk);
    }

    #[test]
    fn forbidden_response_embeds_reason() {
        let resp = forbidden_response("Host Not Allowed");
        let text = String::from_utf8(resp).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Length: 16\r\n"));
        assert!(text.ends_with("\r\n\r\nHost Not Allowed"));
    }
}
