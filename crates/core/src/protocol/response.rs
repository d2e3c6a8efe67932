use super::header::{Header, Headers};
use super::message::{self, MessageBody, RTSP_VERSION};
use super::request;
use crate::error::{ParseErrorKind, Result, RtspError};

/// Status codes the client produces or reacts to (RFC 2326 §7.1.1).
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const METHOD_NOT_ALLOWED: u16 = 405;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
    pub const SESSION_NOT_FOUND: u16 = 454;
    pub const UNSUPPORTED_TRANSPORT: u16 = 461;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const VERSION_NOT_SUPPORTED: u16 = 505;
    pub const OPTION_NOT_SUPPORTED: u16 = 551;
}

/// Standard reason phrase for `code`, or `""` if unknown.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        250 => "Low on Storage Space",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        304 => "Not Modified",
        305 => "Use Proxy",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        451 => "Parameter Not Understood",
        452 => "Conference Not Found",
        453 => "Not Enough Bandwidth",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        456 => "Header Field Not Valid for Resource",
        457 => "Invalid Range",
        458 => "Parameter Is Read-Only",
        459 => "Aggregate Operation Not Allowed",
        460 => "Only Aggregate Operation Allowed",
        461 => "Unsupported Transport",
        462 => "Destination Unreachable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "RTSP Version Not Supported",
        551 => "Option Not Supported",
        _ => "",
    }
}

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`with_header`](Self::with_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<MessageBody>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            version: RTSP_VERSION.to_string(),
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 200 OK.
    pub fn ok() -> Self {
        Self::new(status::OK)
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(status::BAD_REQUEST)
    }

    pub fn with_header(mut self, header: Header, value: impl Into<String>) -> Self {
        self.headers.insert(header, value);
        self
    }

    pub fn with_body(mut self, body: MessageBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn cseq(&self) -> Option<u32> {
        self.headers.cseq()
    }

    pub fn header(&self, header: &Header) -> Option<&str> {
        self.headers.get(header)
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the `Version Code Reason` start line.
    pub fn parse_status_line(line: &str) -> Result<(String, u16, String)> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidStatusLine);

        let mut parts = line.splitn(3, ' ');
        let version = parts.next().filter(|v| v.starts_with("RTSP/")).ok_or_else(invalid)?;
        let code = parts
            .next()
            .filter(|code| code.len() == 3)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let reason = parts.next().unwrap_or_default().trim();

        Ok((version.to_string(), code, reason.to_string()))
    }

    /// Parse a response from its text representation.
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = match raw.find("\r\n\r\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 4..]),
            None => (raw, ""),
        };

        let mut lines = head.lines();
        let status_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(RtspError::parse(ParseErrorKind::EmptyMessage))?;

        let (version, status, reason) = Self::parse_status_line(status_line)?;
        let headers = request::parse_header_lines(lines)?;
        let body = request::body_from(&headers, body);

        Ok(Response {
            version,
            status,
            reason,
            headers,
            body,
        })
    }

    /// Serialize to the RTSP text wire format.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let start = format!("{} {} {}", self.version, self.status, self.reason);
        message::write_message(&mut out, &start, &self.headers, self.body.as_ref());
        out
    }
}
