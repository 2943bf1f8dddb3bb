//! HTTP/1.1 request parser and response generator.
//!
//! Implements just enough of HTTP/1.x to serve the targets:
//! - Request line and headers
//! - Bodies framed by Content-Length or chunked transfer coding
//! - Keep-alive negotiation and `Expect: 100-continue`

use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::str;

/// Maximum size of the request line plus headers
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of header fields
pub const MAX_HEADERS: usize = 100;

/// Server name sent in responses
pub const SERVER_NAME: &str = concat!("xxe-targets/", env!("CARGO_PKG_VERSION"));

/// Interim response sent before reading a body announced with `Expect: 100-continue`
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// HTTP protocol version of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (`/path?query`)
    pub target: String,
    /// Path component of the target
    pub path: String,
    /// Raw query string, without the `?`
    pub query: String,
    pub version: Version,
    pub headers: Vec<(String, String)>,
}

/// How the request body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
}

impl RequestHead {
    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Determine body framing from Transfer-Encoding and Content-Length
    pub fn body_framing(&self) -> Result<BodyFraming, ParseError> {
        if let Some(coding) = self.header("transfer-encoding") {
            let last = coding.rsplit(',').next().unwrap_or("").trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(BodyFraming::Chunked);
            }
            return Err(ParseError::UnsupportedTransferEncoding(coding.to_string()));
        }

        let mut lengths = self
            .headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| value.trim());

        let length = match lengths.next() {
            Some(value) => value,
            None => return Ok(BodyFraming::Empty),
        };
        if lengths.any(|other| other != length) {
            return Err(ParseError::InvalidContentLength(
                "conflicting Content-Length headers".to_string(),
            ));
        }

        match length.parse::<usize>() {
            Ok(0) => Ok(BodyFraming::Empty),
            Ok(n) => Ok(BodyFraming::Length(n)),
            Err(_) => Err(ParseError::InvalidContentLength(length.to_string())),
        }
    }

    /// Whether the client waits for `100 Continue` before sending the body
    pub fn expects_continue(&self) -> bool {
        self.version == Version::Http11
            && self
                .header("expect")
                .map(|value| value.trim().eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false)
    }

    /// Whether the connection stays open after the response
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.header_has_token("connection", "close"),
            Version::Http10 => self.header_has_token("connection", "keep-alive"),
        }
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Need more data to complete parsing
    Incomplete,
    /// Request line plus headers exceed `MAX_HEAD_SIZE`
    HeadTooLarge,
    /// More than `MAX_HEADERS` header fields
    TooManyHeaders,
    /// Malformed request line
    InvalidRequestLine(String),
    /// Protocol version other than HTTP/1.0 or HTTP/1.1
    UnsupportedVersion(String),
    /// Malformed header field
    InvalidHeader(String),
    /// Content-Length is not a number or conflicts
    InvalidContentLength(String),
    /// Transfer coding other than chunked
    UnsupportedTransferEncoding(String),
    /// Malformed chunked body
    InvalidChunk(String),
    /// Body exceeds the configured limit
    BodyTooLarge(usize),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "Incomplete request"),
            ParseError::HeadTooLarge => write!(f, "Request head too large"),
            ParseError::TooManyHeaders => write!(f, "Too many header fields"),
            ParseError::InvalidRequestLine(line) => write!(f, "Invalid request line: {}", line),
            ParseError::UnsupportedVersion(v) => write!(f, "Unsupported HTTP version: {}", v),
            ParseError::InvalidHeader(line) => write!(f, "Invalid header: {}", line),
            ParseError::InvalidContentLength(v) => write!(f, "Invalid Content-Length: {}", v),
            ParseError::UnsupportedTransferEncoding(v) => {
                write!(f, "Unsupported Transfer-Encoding: {}", v)
            }
            ParseError::InvalidChunk(msg) => write!(f, "Invalid chunk: {}", msg),
            ParseError::BodyTooLarge(limit) => {
                write!(f, "Request body exceeds {} bytes", limit)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Result of parsing a request head
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed head with bytes consumed (including the blank line)
    Complete(RequestHead, usize),
    /// Parse error
    Error(ParseError),
}

/// Result of feeding a buffer to a [`ChunkedDecoder`]
#[derive(Debug)]
pub enum ChunkedResult {
    /// Decoded body; the last chunk and trailers have been consumed
    Complete(Bytes),
    Error(ParseError),
}

/// Parser for HTTP/1.x requests
pub struct Parser;

impl Parser {
    /// Parse a request head from the buffer
    pub fn parse_head(buffer: &[u8]) -> ParseResult {
        // Tolerate empty lines before the request line
        let skipped = leading_empty_lines(buffer);
        let rest = &buffer[skipped..];

        let head_end = match find_head_end(rest) {
            Some(pos) => pos,
            None if buffer.len() > MAX_HEAD_SIZE => {
                return ParseResult::Error(ParseError::HeadTooLarge)
            }
            None => return ParseResult::Error(ParseError::Incomplete),
        };
        if skipped + head_end > MAX_HEAD_SIZE {
            return ParseResult::Error(ParseError::HeadTooLarge);
        }

        let head = match str::from_utf8(&rest[..head_end]) {
            Ok(s) => s,
            Err(_) => {
                return ParseResult::Error(ParseError::InvalidRequestLine(
                    "Invalid UTF-8 in request head".to_string(),
                ))
            }
        };

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or("");

        let parts: Vec<&str> = request_line.split(' ').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return ParseResult::Error(ParseError::InvalidRequestLine(request_line.to_string()));
        }

        let version = match parts[2] {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            other => return ParseResult::Error(ParseError::UnsupportedVersion(other.to_string())),
        };

        let target = parts[1];
        let (path, query) = match split_target(target) {
            Some(split) => split,
            None => {
                return ParseResult::Error(ParseError::InvalidRequestLine(
                    request_line.to_string(),
                ))
            }
        };

        let mut headers = Vec::new();
        for line in lines {
            if headers.len() >= MAX_HEADERS {
                return ParseResult::Error(ParseError::TooManyHeaders);
            }
            let (name, value) = match line.split_once(':') {
                Some((name, value)) if !name.is_empty() && !name.contains([' ', '\t']) => {
                    (name, value)
                }
                _ => return ParseResult::Error(ParseError::InvalidHeader(line.to_string())),
            };
            headers.push((name.to_string(), value.trim().to_string()));
        }

        ParseResult::Complete(
            RequestHead {
                method: parts[0].to_string(),
                target: target.to_string(),
                path: path.to_string(),
                query: query.to_string(),
                version,
                headers,
            },
            skipped + head_end + 4,
        )
    }
}

/// Incremental decoder for a chunked body.
///
/// Complete chunks are moved out of the read buffer as they arrive, so a
/// body trickling in over many reads is decoded once.
#[derive(Debug)]
pub struct ChunkedDecoder {
    body: BytesMut,
    max_body: usize,
    /// Bytes of trailer fields seen, once the last chunk has been read
    trailers: Option<usize>,
}

impl ChunkedDecoder {
    pub fn new(max_body: usize) -> Self {
        ChunkedDecoder {
            body: BytesMut::new(),
            max_body,
            trailers: None,
        }
    }

    /// Consume whatever can be decoded from the front of `buffer`.
    /// `Incomplete` means more input is needed; bytes after the body stay
    /// in the buffer.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> ChunkedResult {
        loop {
            let line_end = match find_crlf(buffer) {
                Some(end) => end,
                None if self.trailers.unwrap_or(0) + buffer.len() > MAX_HEAD_SIZE => {
                    return ChunkedResult::Error(ParseError::InvalidChunk(
                        "Chunk line too long".to_string(),
                    ))
                }
                None => return ChunkedResult::Error(ParseError::Incomplete),
            };

            if let Some(seen) = self.trailers {
                let seen = seen + line_end + 2;
                if seen > MAX_HEAD_SIZE {
                    return ChunkedResult::Error(ParseError::InvalidChunk(
                        "Trailer section too large".to_string(),
                    ));
                }
                buffer.advance(line_end + 2);
                if line_end == 0 {
                    return ChunkedResult::Complete(std::mem::take(&mut self.body).freeze());
                }
                self.trailers = Some(seen);
                continue;
            }

            let line = match str::from_utf8(&buffer[..line_end]) {
                Ok(s) => s,
                Err(_) => {
                    return ChunkedResult::Error(ParseError::InvalidChunk(
                        "Invalid UTF-8 in chunk size".to_string(),
                    ))
                }
            };
            // Chunk extensions are ignored
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = match usize::from_str_radix(size_str, 16) {
                Ok(size) => size,
                Err(_) => {
                    return ChunkedResult::Error(ParseError::InvalidChunk(format!(
                        "Invalid chunk size: {}",
                        size_str
                    )))
                }
            };

            if size == 0 {
                buffer.advance(line_end + 2);
                self.trailers = Some(0);
                continue;
            }

            if self.body.len().saturating_add(size) > self.max_body {
                return ChunkedResult::Error(ParseError::BodyTooLarge(self.max_body));
            }

            // The size line stays buffered until its whole chunk has arrived
            let data_start = line_end + 2;
            let data_end = data_start + size;
            if buffer.len() < data_end + 2 {
                return ChunkedResult::Error(ParseError::Incomplete);
            }
            if &buffer[data_end..data_end + 2] != b"\r\n" {
                return ChunkedResult::Error(ParseError::InvalidChunk(
                    "Missing CRLF after chunk data".to_string(),
                ));
            }

            buffer.advance(data_start);
            self.body.extend_from_slice(&buffer[..size]);
            buffer.advance(size + 2);
        }
    }
}

/// Split a request target into path and query. Absolute-form targets lose
/// their scheme and authority.
fn split_target(target: &str) -> Option<(&str, &str)> {
    // Fragments are never sent, but drop one if a client does
    let target = target.split('#').next().unwrap_or(target);

    let origin_form = match target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        Some(rest) => match rest.find(['/', '?']) {
            Some(at) if rest[at..].starts_with('/') => &rest[at..],
            Some(at) => return Some(("/", &rest[at + 1..])),
            None => return Some(("/", "")),
        },
        None => target,
    };

    if !origin_form.starts_with('/') {
        return None;
    }
    Some(match origin_form.split_once('?') {
        Some((path, query)) => (path, query),
        None => (origin_form, ""),
    })
}

/// A complete request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub head: RequestHead,
    pub body: Bytes,
    query: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new(head: RequestHead, body: Bytes) -> Self {
        // Later occurrences of a name replace earlier ones
        let query = url::form_urlencoded::parse(head.query.as_bytes())
            .into_owned()
            .collect();
        HttpRequest { head, body, query }
    }

    /// Decoded query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|value| value.as_str())
    }
}

/// Response status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16, pub &'static str);

impl Status {
    pub const OK: Status = Status(200, "OK");
    pub const FOUND: Status = Status(302, "Found");
    pub const BAD_REQUEST: Status = Status(400, "Bad Request");
    pub const NOT_FOUND: Status = Status(404, "Not Found");
    pub const PAYLOAD_TOO_LARGE: Status = Status(413, "Payload Too Large");
    pub const INTERNAL_SERVER_ERROR: Status = Status(500, "Internal Server Error");
    pub const NOT_IMPLEMENTED: Status = Status(501, "Not Implemented");
}

/// Response generator
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub content_type: &'static str,
    /// Redirect target sent as `Location`
    pub location: Option<String>,
    pub body: Bytes,
}

const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
const APPLICATION_JSON: &str = "application/json; charset=UTF-8";

impl Response {
    /// Plain-text response
    pub fn text(status: Status, body: impl Into<Bytes>) -> Self {
        Response {
            status,
            content_type: TEXT_PLAIN,
            location: None,
            body: body.into(),
        }
    }

    /// 200 with a JSON body
    pub fn json<T: serde::Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(mut body) => {
                body.push(b'\n');
                Response {
                    content_type: APPLICATION_JSON,
                    ..Self::ok(body)
                }
            }
            Err(e) => Self::text(Status::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
        }
    }

    /// 302 to `location`
    pub fn redirect(location: impl Into<String>) -> Self {
        let location = location.into();
        Response {
            location: Some(location.clone()),
            ..Self::text(Status::FOUND, format!("Redirecting to {}\n", location))
        }
    }

    /// 200 with a plain-text body
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::text(Status::OK, body)
    }

    pub fn not_found(path: &str) -> Self {
        Self::text(Status::NOT_FOUND, format!("No target at {}\n", path))
    }

    /// Response for a request that could not be parsed
    pub fn for_error(error: &ParseError) -> Self {
        let status = match error {
            ParseError::BodyTooLarge(_) => Status::PAYLOAD_TOO_LARGE,
            ParseError::UnsupportedTransferEncoding(_) => Status::NOT_IMPLEMENTED,
            _ => Status::BAD_REQUEST,
        };
        Self::text(status, format!("{}\n", error))
    }

    /// Encode status line, headers and (unless `head_only`) body
    pub fn encode(&self, keep_alive: bool, head_only: bool) -> BytesMut {
        let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
        let location = match &self.location {
            Some(location) => format!("Location: {}\r\n", location),
            None => String::new(),
        };
        let header = format!(
            "HTTP/1.1 {} {}\r\nServer: {}\r\nDate: {}\r\nContent-Type: {}\r\n{}Content-Length: {}\r\nConnection: {}\r\n\r\n",
            self.status.0,
            self.status.1,
            SERVER_NAME,
            date,
            self.content_type,
            location,
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" },
        );

        let mut response = BytesMut::with_capacity(header.len() + self.body.len());
        response.extend_from_slice(header.as_bytes());
        if !head_only {
            response.extend_from_slice(&self.body);
        }
        response
    }
}

/// Length of the run of empty lines (`\r\n` or bare `\n`) at the start of the buffer.
fn leading_empty_lines(buffer: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        if buffer[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if buffer[pos..].starts_with(b"\n") {
            pos += 1;
        } else {
            return pos;
        }
    }
}

/// Find the `\r\n\r\n` ending the head, returning the position of the first `\r`.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}
