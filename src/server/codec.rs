//! Minimal HTTP-shaped framing.
//!
//! This is deliberately not an HTTP implementation. One request per
//! connection, no chunking, no keep-alive: the server only needs the verb,
//! the path, `Content-Type`, `Content-Length` and the body, and every
//! response ends with `Connection: Closed`.

use super::request::Request;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const SCRIPT_CONTENT_TYPE: &str = "text/x-script";
pub const PNG_CONTENT_TYPE: &str = "image/png";

pub const SERVER_ID: &str = concat!("uiprobe/", env!("CARGO_PKG_VERSION"));

const VERBS: [&str; 3] = ["GET", "PUT", "POST"];
const CONTENT_TYPE: &str = "content-type:";
const CONTENT_LENGTH: &str = "content-length:";

/// Status line for a code. Unknown codes report as 500.
pub fn status_line(status: u16) -> &'static str {
    match status {
        100 => "100 Continue",
        200 => "200 OK",
        404 => "404 Not Found",
        _ => "500 Internal Server Error",
    }
}

pub fn build_response(body: &[u8], content_type: &str, status: u16) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 {}\nServer: {}\nContent-Type: {}\nContent-Length: {}\nConnection: Closed\n\n",
        status_line(status),
        SERVER_ID,
        content_type,
        body.len()
    );

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Parse a raw request buffer.
///
/// Never fails: whatever could be recognised is reported, and the caller
/// validates consistency (empty buffer, length mismatch).
pub fn parse_request(bytes: &[u8]) -> Request {
    let mut request = Request::default();
    let mut seen_verb = false;

    for line in Lines::new(bytes) {
        if line.text.is_empty() {
            request.body = bytes[line.next..].to_vec();
            break;
        }

        let text = String::from_utf8_lossy(line.text);

        if !seen_verb {
            if let Some((verb, path)) = parse_request_line(&text) {
                request.verb = verb;
                request.path = path;
                seen_verb = true;
                continue;
            }
        }

        if let Some(value) = header_value(&text, CONTENT_TYPE) {
            request.content_type = value.split(';').next().unwrap_or_default().trim().to_string();
        } else if let Some(value) = header_value(&text, CONTENT_LENGTH) {
            request.content_length = value.trim().parse().unwrap_or(0);
        }
    }

    request
}

/// Completeness tracking for a request that arrives in pieces.
///
/// Feed the growing buffer to [`advance`](Self::advance) after every read.
/// Each byte is scanned for the blank line at most once and the headers are
/// parsed once, so the total cost stays linear in the request size.
#[derive(Debug, Default)]
pub struct RequestFraming {
    line_start: usize,
    scanned: usize,
    body_start: Option<usize>,
    content_length: usize,
}

impl RequestFraming {
    /// `bytes` must extend the buffer passed on the previous call.
    pub fn advance(&mut self, bytes: &[u8]) -> bool {
        if self.body_start.is_none() {
            self.find_header_end(bytes);
        }
        match self.body_start {
            Some(start) => bytes.len() - start >= self.content_length,
            None => false,
        }
    }

    pub fn body_start(&self) -> Option<usize> {
        self.body_start
    }

    /// Declared body length; 0 until the headers are complete.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    fn find_header_end(&mut self, bytes: &[u8]) {
        while let Some(i) = bytes[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + i;
            let line = &bytes[self.line_start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let next = end + 1;

            if line.is_empty() {
                self.body_start = Some(next);
                self.content_length = parse_request(&bytes[..next]).content_length;
                self.scanned = next;
                return;
            }
            self.line_start = next;
            self.scanned = next;
        }
        self.scanned = bytes.len();
    }
}

/// A response as seen by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status: u16,
    pub content_type: String,
    pub content_length: usize,
    pub body: Vec<u8>,
}

/// Parse a complete response buffer. Returns `None` without a status line.
pub fn parse_response(bytes: &[u8]) -> Option<ParsedResponse> {
    let mut response = ParsedResponse::default();
    let mut seen_status = false;

    for line in Lines::new(bytes) {
        if line.text.is_empty() {
            let body = &bytes[line.next..];
            let len = response.content_length.min(body.len());
            response.body = body[..len].to_vec();
            break;
        }

        let text = String::from_utf8_lossy(line.text);
        if !seen_status {
            let mut parts = text.split_whitespace();
            if parts.next().is_some_and(|proto| proto.starts_with("HTTP/")) {
                response.status = parts.next()?.parse().ok()?;
                seen_status = true;
            }
            continue;
        }

        if let Some(value) = header_value(&text, CONTENT_TYPE) {
            response.content_type = value.trim().to_string();
        } else if let Some(value) = header_value(&text, CONTENT_LENGTH) {
            response.content_length = value.trim().parse().unwrap_or(0);
        }
    }

    seen_status.then_some(response)
}

fn parse_request_line(line: &str) -> Option<(String, String)> {
    let verb = VERBS.iter().find(|verb| {
        line.strip_prefix(**verb)
            .and_then(|rest| rest.chars().next())
            .is_some_and(char::is_whitespace)
    })?;

    let mut parts = line.split_whitespace().skip(1);
    let path = parts.next().unwrap_or_default();
    Some((verb.to_string(), path.to_string()))
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix = line.get(..name.len())?;
    prefix
        .eq_ignore_ascii_case(name)
        .then(|| &line[name.len()..])
}

struct Line<'a> {
    /// Line content without the terminator (and without a trailing `\r`).
    text: &'a [u8],
    /// Offset just past the terminator.
    next: usize,
}

struct Lines<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Line<'a>> {
        if self.pos >= self.bytes.len() {
            return None;
        }

        let rest = &self.bytes[self.pos..];
        let (mut text, next) = match rest.iter().position(|b| *b == b'\n') {
            Some(i) => (&rest[..i], self.pos + i + 1),
            None => (rest, self.bytes.len()),
        };
        if let Some(stripped) = text.strip_suffix(b"\r") {
            text = stripped;
        }

        self.pos = next;
        Some(Line { text, next })
    }
}
