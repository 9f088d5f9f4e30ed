//! Tunnel wire framing.
//!
//! Outbound frames carry a length-prefixed routing tag followed by a
//! literal HTTP head block and raw body bytes:
//!
//! ```text
//! [1-byte tag-len][tag][METHOD path VERSION\r\nName: value\r\n...\r\n\r\n][body...]
//! ```
//!
//! Inbound frames are the same without the tag prefix, starting at the
//! status line. There are no chunk-length prefixes and no end-of-body
//! marker: the channel's own message framing delimits deliveries, and
//! channel closure (or a `Content-Length` header) delimits the body.
//! Decoders are incremental and tolerate the CRLFCRLF boundary straddling
//! any number of deliveries.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};
use crate::protocol::MAX_TAG_LEN;

const BOUNDARY: &[u8; 4] = b"\r\n\r\n";

/// Request line and header block of a tunneled request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    /// Path plus query string.
    pub target: String,
    pub headers: Vec<(String, String)>,
}

/// Status line and header block of a tunneled response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Serialize as a plain HTTP head block (no routing tag).
    pub fn encode(&self, version: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_u8(b' ');
        out.put_slice(version.as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

impl ResponseHead {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128);
        out.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

/// Serialize an outbound request frame prefix: routing tag plus head block.
/// Body bytes follow separately, forwarded verbatim as the source yields them.
pub fn encode_request_head(tag: &str, head: &RequestHead, version: &str) -> Result<Bytes> {
    let tag_bytes = tag.as_bytes();
    if tag_bytes.len() > MAX_TAG_LEN {
        return Err(TunnelError::Protocol(format!(
            "routing tag too long: {} bytes",
            tag_bytes.len()
        )));
    }
    let head_bytes = head.encode(version);
    let mut out = BytesMut::with_capacity(1 + tag_bytes.len() + head_bytes.len());
    out.put_u8(tag_bytes.len() as u8);
    out.put_slice(tag_bytes);
    out.put_slice(&head_bytes);
    Ok(out.freeze())
}

/// Offset of the CRLFCRLF boundary in `buf`, if present.
pub fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(BOUNDARY.len()).position(|w| w == BOUNDARY)
}

/// Value of the Content-Length header, if present and well formed.
pub fn content_length(headers: &[(String, String)]) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Parse a response head block (everything before the boundary).
///
/// A status line that does not match `HTTP/<version> <status> <reason>`
/// yields status 200 rather than an error; header lines split on the
/// first colon, blank or colon-less lines are skipped.
pub fn parse_response_head(block: &[u8]) -> ResponseHead {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");

    let (status, reason) = lines.next().map_or((200, String::new()), parse_status_line);

    ResponseHead { status, reason, headers: parse_header_lines(lines) }
}

/// Parse a request head block. Unlike the response side, a request line
/// that cannot be split into method and target is a protocol error.
pub fn parse_request_head(block: &[u8]) -> Result<RequestHead> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| TunnelError::Protocol("empty request line".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| TunnelError::Protocol(format!("invalid request line: {request_line:?}")))?
        .to_string();

    Ok(RequestHead { method, target, headers: parse_header_lines(lines) })
}

fn parse_status_line(line: &str) -> (u16, String) {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => match code.parse() {
            Ok(status) => (status, parts.collect::<Vec<_>>().join(" ")),
            Err(_) => (200, String::new()),
        },
        _ => (200, String::new()),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// What an incremental decoder produced for one delivery.
#[derive(Debug, PartialEq)]
pub enum Decoded<H> {
    /// Boundary not seen yet; feed more bytes.
    NeedMore,
    /// Head block complete. `body` is whatever followed the boundary in
    /// the same delivery (possibly empty).
    Head { head: H, body: Bytes },
    /// A delivery after the head: raw body bytes, forward verbatim.
    Body(Bytes),
}

/// Incremental decoder for inbound response frames.
///
/// Accumulates deliveries until the CRLFCRLF boundary, then switches to
/// pass-through body mode.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buf: BytesMut,
    seen_head: bool,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the header boundary has been found.
    pub fn headers_seen(&self) -> bool {
        self.seen_head
    }

    /// True if no bytes at all have been consumed.
    pub fn is_empty(&self) -> bool {
        !self.seen_head && self.buf.is_empty()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Decoded<ResponseHead> {
        if self.seen_head {
            return Decoded::Body(Bytes::copy_from_slice(chunk));
        }
        self.buf.extend_from_slice(chunk);
        match find_boundary(&self.buf) {
            Some(at) => {
                let head = parse_response_head(&self.buf[..at]);
                let body = Bytes::copy_from_slice(&self.buf[at + BOUNDARY.len()..]);
                self.buf.clear();
                self.seen_head = true;
                Decoded::Head { head, body }
            }
            None => Decoded::NeedMore,
        }
    }
}

/// Incremental decoder for inbound request frames (the host side):
/// one length-prefixed routing tag, then the head block, then body bytes.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    buf: BytesMut,
    tag: Option<String>,
    seen_head: bool,
}

/// A fully decoded request frame prefix.
#[derive(Debug, PartialEq)]
pub struct TaggedRequest {
    pub tag: String,
    pub head: RequestHead,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Decoded<TaggedRequest>> {
        if self.seen_head {
            return Ok(Decoded::Body(Bytes::copy_from_slice(chunk)));
        }
        self.buf.extend_from_slice(chunk);

        if self.tag.is_none() {
            if self.buf.is_empty() {
                return Ok(Decoded::NeedMore);
            }
            let tag_len = self.buf[0] as usize;
            if self.buf.len() < 1 + tag_len {
                return Ok(Decoded::NeedMore);
            }
            let raw = self.buf.split_to(1 + tag_len);
            let tag = std::str::from_utf8(&raw[1..])
                .map_err(|_| TunnelError::Protocol("routing tag is not UTF-8".into()))?
                .to_string();
            self.tag = Some(tag);
        }

        match find_boundary(&self.buf) {
            Some(at) => {
                let head = parse_request_head(&self.buf[..at])?;
                let body = Bytes::copy_from_slice(&self.buf[at + BOUNDARY.len()..]);
                self.buf.clear();
                self.seen_head = true;
                let tag = self.tag.take().unwrap_or_default();
                Ok(Decoded::Head { head: TaggedRequest { tag, head }, body })
            }
            None => Ok(Decoded::NeedMore),
        }
    }

    /// True if no bytes at all have been consumed.
    pub fn is_empty(&self) -> bool {
        !self.seen_head && self.tag.is_none() && self.buf.is_empty()
    }
}
