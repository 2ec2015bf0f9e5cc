//! Cranker wire-protocol framing
//!
//! The cranker protocol multiplexes one HTTP exchange over one WebSocket.
//! The router sends the request head as a single text frame whose last two
//! bytes are a marker, streams any request body as binary frames terminated
//! by a `_3` text frame, and receives the response head as a text frame
//! followed by binary body frames. This crate holds the markers and the
//! pure encode/decode functions; it performs no I/O.

use thiserror::Error;

/// Protocol version sent in the registration handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Header carrying the protocol version on the registration upgrade.
pub const PROTOCOL_HEADER: &str = "CrankerProtocol";

/// Header carrying the route (service name) on the registration upgrade.
pub const ROUTE_HEADER: &str = "Route";

/// Path appended to the router URL for the registration upgrade.
pub const REGISTER_PATH: &str = "register";

/// Marker: a request body follows in subsequent binary frames.
pub const MARKER_REQ_BODY_PENDING: &[u8] = b"_1";

/// Marker: the request has no body.
pub const MARKER_REQ_HAS_NO_BODY: &[u8] = b"_2";

/// Marker: end of the request body stream.
pub const MARKER_REQ_BODY_ENDED: &[u8] = b"_3";

/// Upper bound on header lines in a request head frame.
const MAX_HEADERS: usize = 64;

/// How a request head frame says its body will arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMarker {
    /// `_1`: binary body frames follow, terminated by a `_3` text frame.
    BodyFollows,
    /// `_2`: the request is complete, no body frames.
    NoBody,
}

/// Decoded request head frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Absolute path (plus query) as sent by the router, route prefix intact.
    pub target: String,
    /// e.g. `HTTP/1.1`
    pub version: String,
    /// Header pairs in wire order, duplicates preserved.
    pub headers: Vec<(String, String)>,
    pub marker: BodyMarker,
}

/// Violations of the cranker framing rules.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("request head is not a valid HTTP/1.1 head: {0}")]
    MalformedHead(#[from] httparse::Error),

    #[error("request head frame is truncated")]
    TruncatedHead,

    #[error("unknown body marker {0:?}")]
    UnknownMarker(String),

    #[error("request head does not form a valid request: {0}")]
    InvalidHead(String),

    #[error("expected a text frame, received a binary frame")]
    UnexpectedBinaryFrame,

    #[error("expected a body frame or end-of-body marker, received text {0:?}")]
    UnexpectedTextFrame(String),

    #[error("request head of {len} bytes exceeds the {limit} byte limit")]
    OversizedHead { len: usize, limit: usize },
}

/// Parse a request head frame: HTTP/1.1 head terminated by a blank line,
/// with the frame's last two bytes being the body marker.
pub fn parse_request_head(payload: &[u8]) -> Result<RequestHead, ProtocolViolation> {
    if payload.len() < 2 {
        return Err(ProtocolViolation::TruncatedHead);
    }

    let (head, marker_bytes) = payload.split_at(payload.len() - 2);
    let marker = match marker_bytes {
        m if m == MARKER_REQ_BODY_PENDING => BodyMarker::BodyFollows,
        m if m == MARKER_REQ_HAS_NO_BODY => BodyMarker::NoBody,
        other => {
            return Err(ProtocolViolation::UnknownMarker(
                String::from_utf8_lossy(other).into_owned(),
            ))
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(ProtocolViolation::TruncatedHead),
    }

    let method = req.method.ok_or(ProtocolViolation::TruncatedHead)?.to_string();
    let target = req.path.ok_or(ProtocolViolation::TruncatedHead)?.to_string();
    let version = format!("HTTP/1.{}", req.version.unwrap_or(1));

    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
        marker,
    })
}

/// True when a text frame's entire payload is the end-of-body marker.
pub fn is_end_of_body_marker(payload: &[u8]) -> bool {
    payload == MARKER_REQ_BODY_ENDED
}

/// Encode a response head frame: status line followed by header lines.
/// The frame boundary delimits the head, so no trailing blank line is added.
pub fn encode_response_head(
    version: &str,
    status: u16,
    reason: &str,
    headers: &[(String, String)],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + headers.len() * 32);
    buf.extend_from_slice(version.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.to_string().as_bytes());
    if !reason.is_empty() {
        buf.push(b' ');
        buf.extend_from_slice(reason.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf
}
