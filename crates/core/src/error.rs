//! Error types for the RTSP client library.

use std::fmt;
use std::io;

use crate::protocol::Method;

/// Errors that can occur in the RTSP client library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) for malformed RTSP or SDP text.
/// - **Transport**: [`Io`](Self::Io) for socket/network failures.
/// - **Session**: [`Client`](Self::Client) for typed failures raised by the
///   session state machine.
/// - **Media**: [`Media`](Self::Media) for failures scoped to one stream loader.
/// - **Setup**: [`InvalidUrl`](Self::InvalidUrl),
///   [`InvalidConfig`](Self::InvalidConfig), [`Closed`](Self::Closed).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an RTSP message or SDP body (RFC 2326 §6, §7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The presentation URL is not a usable `rtsp://` URL.
    #[error("invalid RTSP url: {0}")]
    InvalidUrl(String),

    /// A [`ClientConfig`](crate::client::ClientConfig) value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The client or its dispatcher has already been closed.
    #[error("client closed")]
    Closed,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl RtspError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        RtspError::Parse { kind }
    }
}

impl From<url::ParseError> for RtspError {
    fn from(err: url::ParseError) -> Self {
        RtspError::InvalidUrl(err.to_string())
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a valid size.
    InvalidContentLength,
    /// A line grew past the reader's limit without a terminator.
    LineTooLong,
    /// `Transport` header value could not be interpreted (RFC 2326 §12.39).
    InvalidTransport,
    /// `Range` header value could not be interpreted (RFC 2326 §12.29).
    InvalidRange,
    /// SDP body had no recognizable lines.
    InvalidSdp,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::LineTooLong => write!(f, "line too long"),
            Self::InvalidTransport => write!(f, "invalid transport"),
            Self::InvalidRange => write!(f, "invalid range"),
            Self::InvalidSdp => write!(f, "invalid session description"),
        }
    }
}

/// Typed failure reported by the session state machine.
///
/// Every variant is fatal to the current session. [`code`](Self::code)
/// returns a stable integer for engines that report numeric error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Connecting to the server did not complete in time.
    #[error("timed out connecting to server")]
    SocketTimeout,

    /// The retry monitor expired before a matching response arrived.
    #[error("no response to {method} (CSeq {cseq})")]
    NoResponse { method: Method, cseq: u32 },

    /// The server answered with a non-success status.
    #[error("server answered {method} with {status}")]
    UnSuccess { method: Method, status: u16 },

    /// The server rejected every credential scheme we could offer.
    #[error("server refused authorization for {method}")]
    Unauthorized { method: Method },

    /// A response arrived that could not be correlated or lacked `CSeq`.
    #[error("malformed response from server")]
    Malfunction,

    /// Reading from or writing to the control connection failed.
    #[error("connection error: {0}")]
    Io(String),

    /// The server reported `408 Request Timeout` for a request we no longer track.
    #[error("server reported request timeout")]
    RequestTimeOut,

    /// The DESCRIBE body was not `application/sdp`.
    #[error("unsupported session description type: {0}")]
    UnsupportedMediaType(String),
}

impl ClientError {
    pub fn code(&self) -> u32 {
        match self {
            Self::SocketTimeout => 6,
            Self::NoResponse { .. } => 7,
            Self::UnSuccess { .. } => 8,
            Self::Unauthorized { .. } => 9,
            Self::Malfunction => 10,
            Self::Io(_) => 11,
            Self::RequestTimeOut => 12,
            Self::UnsupportedMediaType(_) => 13,
        }
    }

    pub(crate) fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::SocketTimeout,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Failure scoped to a single stream loader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    /// No data source exists for the negotiated transport.
    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(String),

    /// No extractor could be built for the track's payload format.
    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),

    #[error("load canceled")]
    LoadCanceled,

    #[error("load failed: {0}")]
    LoadFailed(String),

    /// The data source went silent for longer than its read timeout.
    #[error("timed out waiting for media data")]
    LoadTimeout,
}

impl MediaError {
    pub fn code(&self) -> u32 {
        match self {
            Self::UnsupportedProtocol(_) => 1,
            Self::UnsupportedFormat(_) => 2,
            Self::LoadCanceled => 3,
            Self::LoadFailed(_) => 4,
            Self::LoadTimeout => 5,
        }
    }

    /// Classify a read failure from a data source.
    pub fn from_read_error(err: &io::Error) -> Self {
        if is_timeout(err) {
            Self::LoadTimeout
        } else {
            Self::LoadFailed(err.to_string())
        }
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
