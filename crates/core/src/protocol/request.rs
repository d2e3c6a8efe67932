use super::header::{Header, Headers};
use super::message::{self, MessageBody, RTSP_VERSION};
use super::method::Method;
use crate::error::{ParseErrorKind, Result, RtspError};

/// An RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Built with [`new`](Self::new) + [`with_header`](Self::with_header) on the
/// sending side, or produced by the framed reader when the server issues a
/// request of its own (ANNOUNCE, GET_PARAMETER, ...).
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct Request {
    pub method: Method,
    /// Request-URI (e.g. `rtsp://host:554/stream/trackID=1`) or `*`.
    pub url: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    pub headers: Headers,
    pub body: Option<MessageBody>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Request {
            method,
            url: url.into(),
            version: RTSP_VERSION.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, header: Header, value: impl Into<String>) -> Self {
        self.headers.insert(header, value);
        self
    }

    pub fn with_body(mut self, body: MessageBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<u32> {
        self.headers.cseq()
    }

    pub fn set_cseq(&mut self, cseq: u32) {
        self.headers.insert(Header::CSeq, cseq.to_string());
    }

    pub fn header(&self, header: &Header) -> Option<&str> {
        self.headers.get(header)
    }

    /// Parse the `Method URI Version` start line.
    pub fn parse_request_line(line: &str) -> Result<(Method, String, String)> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidRequestLine);

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let method: Method = parts[0].parse()?;
        let url = parts[1];
        let lowered = url.to_ascii_lowercase();
        if url != "*" && !lowered.starts_with("rtsp://") && !lowered.starts_with("rtsps://") {
            return Err(invalid());
        }
        if !parts[2].starts_with("RTSP/") {
            return Err(invalid());
        }

        Ok((method, url.to_string(), parts[2].to_string()))
    }

    /// Parse a request from its text representation.
    ///
    /// Expects the request line, headers and the blank line; anything after
    /// the blank line is taken as the body.
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = match raw.find("\r\n\r\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 4..]),
            None => (raw, ""),
        };

        let mut lines = head.lines();
        let request_line = lines
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or(RtspError::parse(ParseErrorKind::EmptyMessage))?;

        let (method, url, version) = Self::parse_request_line(request_line)?;
        let headers = parse_header_lines(lines)?;
        let body = body_from(&headers, body);

        Ok(Request {
            method,
            url,
            version,
            headers,
            body,
        })
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Type` and `Content-Length` are appended
    /// automatically (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let start = format!("{} {} {}", self.method, self.url, self.version);
        message::write_message(&mut out, &start, &self.headers, self.body.as_ref());
        out
    }
}

pub(crate) fn parse_header_line(line: &str) -> Result<(Header, String)> {
    let colon_pos = line
        .find(':')
        .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;
    let name = line[..colon_pos].trim();
    if name.is_empty() {
        return Err(RtspError::parse(ParseErrorKind::InvalidHeader));
    }
    Ok((Header::parse(name), line[colon_pos + 1..].trim().to_string()))
}

pub(crate) fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(line)?;
        headers.append(name, value);
    }
    Ok(headers)
}

pub(crate) fn body_from(headers: &Headers, raw: &str) -> Option<MessageBody> {
    if raw.is_empty() {
        return None;
    }
    let media_type = headers
        .get(&Header::ContentType)
        .map(super::message::MediaType::parse)
        .unwrap_or(super::message::MediaType::Other(String::new()));
    Some(MessageBody::new(media_type, raw))
}
