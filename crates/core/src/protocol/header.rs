use std::fmt;

/// RTSP header names (RFC 2326 §12).
///
/// Known names are matched case-insensitively when parsed and always
/// serialized in their canonical spelling. Anything else is kept verbatim in
/// [`Header::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Header {
    Accept,
    AcceptEncoding,
    AcceptLanguage,
    Allow,
    Authorization,
    Bandwidth,
    Blocksize,
    CacheControl,
    Conference,
    Connection,
    ContentBase,
    ContentEncoding,
    ContentLanguage,
    ContentLength,
    ContentLocation,
    ContentType,
    CSeq,
    Date,
    Expires,
    From,
    Host,
    IfMatch,
    IfModifiedSince,
    LastModified,
    Location,
    ProxyAuthenticate,
    ProxyRequire,
    Public,
    Range,
    Referer,
    Require,
    RetryAfter,
    RtpInfo,
    Scale,
    Server,
    Session,
    Speed,
    Timestamp,
    Transport,
    Unsupported,
    UserAgent,
    Vary,
    Via,
    WwwAuthenticate,
    Other(String),
}

const KNOWN: [Header; 44] = [
    Header::Accept,
    Header::AcceptEncoding,
    Header::AcceptLanguage,
    Header::Allow,
    Header::Authorization,
    Header::Bandwidth,
    Header::Blocksize,
    Header::CacheControl,
    Header::Conference,
    Header::Connection,
    Header::ContentBase,
    Header::ContentEncoding,
    Header::ContentLanguage,
    Header::ContentLength,
    Header::ContentLocation,
    Header::ContentType,
    Header::CSeq,
    Header::Date,
    Header::Expires,
    Header::From,
    Header::Host,
    Header::IfMatch,
    Header::IfModifiedSince,
    Header::LastModified,
    Header::Location,
    Header::ProxyAuthenticate,
    Header::ProxyRequire,
    Header::Public,
    Header::Range,
    Header::Referer,
    Header::Require,
    Header::RetryAfter,
    Header::RtpInfo,
    Header::Scale,
    Header::Server,
    Header::Session,
    Header::Speed,
    Header::Timestamp,
    Header::Transport,
    Header::Unsupported,
    Header::UserAgent,
    Header::Vary,
    Header::Via,
    Header::WwwAuthenticate,
];

impl Header {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Accept => "Accept",
            Self::AcceptEncoding => "Accept-Encoding",
            Self::AcceptLanguage => "Accept-Language",
            Self::Allow => "Allow",
            Self::Authorization => "Authorization",
            Self::Bandwidth => "Bandwidth",
            Self::Blocksize => "Blocksize",
            Self::CacheControl => "Cache-Control",
            Self::Conference => "Conference",
            Self::Connection => "Connection",
            Self::ContentBase => "Content-Base",
            Self::ContentEncoding => "Content-Encoding",
            Self::ContentLanguage => "Content-Language",
            Self::ContentLength => "Content-Length",
            Self::ContentLocation => "Content-Location",
            Self::ContentType => "Content-Type",
            Self::CSeq => "CSeq",
            Self::Date => "Date",
            Self::Expires => "Expires",
            Self::From => "From",
            Self::Host => "Host",
            Self::IfMatch => "If-Match",
            Self::IfModifiedSince => "If-Modified-Since",
            Self::LastModified => "Last-Modified",
            Self::Location => "Location",
            Self::ProxyAuthenticate => "Proxy-Authenticate",
            Self::ProxyRequire => "Proxy-Require",
            Self::Public => "Public",
            Self::Range => "Range",
            Self::Referer => "Referer",
            Self::Require => "Require",
            Self::RetryAfter => "Retry-After",
            Self::RtpInfo => "RTP-Info",
            Self::Scale => "Scale",
            Self::Server => "Server",
            Self::Session => "Session",
            Self::Speed => "Speed",
            Self::Timestamp => "Timestamp",
            Self::Transport => "Transport",
            Self::Unsupported => "Unsupported",
            Self::UserAgent => "User-Agent",
            Self::Vary => "Vary",
            Self::Via => "Via",
            Self::WwwAuthenticate => "WWW-Authenticate",
            Self::Other(name) => name,
        }
    }

    /// Map a header name as received on the wire.
    pub fn parse(name: &str) -> Self {
        KNOWN
            .iter()
            .find(|header| header.as_str().eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| Header::Other(name.to_string()))
    }

    fn matches(&self, other: &Header) -> bool {
        match (self, other) {
            (Header::Other(a), Header::Other(b)) => a.eq_ignore_ascii_case(b),
            _ => self == other,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header map (RFC 2326 §4.2).
///
/// A name may appear more than once (e.g. several `WWW-Authenticate`
/// challenges); insertion order is kept for serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(Header, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `header`.
    pub fn get(&self, header: &Header) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.matches(header))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, header: &'a Header) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(name, _)| name.matches(header))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, header: &Header) -> bool {
        self.get(header).is_some()
    }

    /// Replace every value of `header` with `value`.
    pub fn insert(&mut self, header: Header, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(name, _)| name.matches(&header)) {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = 0;
                self.entries.retain(|(name, _)| {
                    if name.matches(&header) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((header, value)),
        }
    }

    /// Add a value without touching existing ones.
    pub fn append(&mut self, header: Header, value: impl Into<String>) {
        self.entries.push((header, value.into()));
    }

    /// Extend the most recent value with a folded continuation line.
    pub(crate) fn continue_last(&mut self, continuation: &str) -> bool {
        match self.entries.last_mut() {
            Some((_, value)) => {
                value.push(' ');
                value.push_str(continuation.trim());
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, header: &Header) {
        self.entries.retain(|(name, _)| !name.matches(header));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Header, &str)> {
        self.entries.iter().map(|(name, value)| (name, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed `CSeq` value (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<u32> {
        self.get(&Header::CSeq)?.trim().parse().ok()
    }

    pub fn content_length(&self) -> Option<&str> {
        self.get(&Header::ContentLength)
    }
}
