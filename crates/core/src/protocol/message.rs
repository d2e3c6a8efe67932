use std::fmt;

use super::header::{Header, Headers};
use super::request::Request;
use super::response::Response;

/// The only protocol version this client speaks.
pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Marker byte that opens an interleaved binary frame (RFC 2326 §10.12).
pub const INTERLEAVED_MARKER: u8 = b'$';

/// A complete RTSP message as produced by the framed reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

/// `Content-Type` values the client cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    /// `application/sdp` (RFC 4566).
    Sdp,
    /// `text/parameters`, used by GET_PARAMETER / SET_PARAMETER bodies.
    TextParameters,
    Other(String),
}

impl MediaType {
    pub fn parse(value: &str) -> Self {
        let essence = value.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case("application/sdp") {
            MediaType::Sdp
        } else if essence.eq_ignore_ascii_case("text/parameters") {
            MediaType::TextParameters
        } else {
            MediaType::Other(essence.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Sdp => "application/sdp",
            Self::TextParameters => "text/parameters",
            Self::Other(value) => value,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body with its declared media type.
///
/// Only SDP is interpreted structurally (by the session); other types pass
/// through as opaque text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    pub media_type: MediaType,
    pub content: String,
}

impl MessageBody {
    pub fn new(media_type: MediaType, content: impl Into<String>) -> Self {
        Self {
            media_type,
            content: content.into(),
        }
    }

    pub fn is_sdp(&self) -> bool {
        self.media_type == MediaType::Sdp
    }
}

/// RTP/RTCP data carried on the control connection (RFC 2326 §10.12).
///
/// ```text
/// +--------+---------+-----------------+----------------+
/// |  '$'   | channel | length (16, BE) | payload ...    |
/// +--------+---------+-----------------+----------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

impl InterleavedFrame {
    pub fn new(channel: u8, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }

    /// Encode with the 4-byte `$` header. Payloads longer than `u16::MAX`
    /// are truncated to fit the length field.
    pub fn serialize(&self) -> Vec<u8> {
        let length = self.payload.len().min(u16::MAX as usize);
        let mut out = Vec::with_capacity(4 + length);
        out.push(INTERLEAVED_MARKER);
        out.push(self.channel);
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&self.payload[..length]);
        out
    }
}

/// Write headers and optional body after a start line.
///
/// `Content-Type`/`Content-Length` are derived from the body and never taken
/// from `headers`.
pub(crate) fn write_message(
    out: &mut String,
    start_line: &str,
    headers: &Headers,
    body: Option<&MessageBody>,
) {
    out.push_str(start_line);
    out.push_str("\r\n");

    for (name, value) in headers.iter() {
        if matches!(name, Header::ContentLength | Header::ContentType) {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", name, value));
    }

    match body {
        Some(body) => {
            out.push_str(&format!("Content-Type: {}\r\n", body.media_type));
            out.push_str(&format!("Content-Length: {}\r\n", body.content.len()));
            out.push_str("\r\n");
            out.push_str(&body.content);
        }
        None => out.push_str("\r\n"),
    }
}
