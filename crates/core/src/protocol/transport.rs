use std::fmt;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Payload carried by a transport (`RTP/...`, `MP2T/...`, `RAW/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Rtp,
    Mp2t,
    Raw,
}

impl TransportProtocol {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Rtp => "RTP",
            Self::Mp2t => "MP2T",
            Self::Raw => "RAW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    Tcp,
}

impl fmt::Display for LowerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => f.write_str("UDP"),
            Self::Tcp => f.write_str("TCP"),
        }
    }
}

/// An `a-b` pair (`client_port`, `server_port`, `interleaved`).
///
/// The second half is optional on the wire (`client_port=5000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair<T> {
    pub first: T,
    pub second: Option<T>,
}

impl<T: Copy + std::str::FromStr> Pair<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            first,
            second: Some(second),
        }
    }

    pub fn single(first: T) -> Self {
        Self {
            first,
            second: None,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(2, '-');
        let first = parts.next()?.trim().parse().ok()?;
        let second = match parts.next() {
            Some(second) => Some(second.trim().parse().ok()?),
            None => None,
        };
        Some(Self { first, second })
    }
}

impl<T: fmt::Display> fmt::Display for Pair<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.second {
            Some(second) => write!(f, "{}-{}", self.first, second),
            None => write!(f, "{}", self.first),
        }
    }
}

/// Transport descriptor (RFC 2326 §12.39).
///
/// Built from the SDP media line when the track is described, from the
/// server's `Transport` header after SETUP, or synthesized with
/// [`interleaved`](Self::interleaved) when requesting TCP delivery.
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=50000-50001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=50000-50001;server_port=6970-6971;ssrc=3D2F1A0B
/// ```
///
/// ## Examples
///
/// ```
/// use rtsp::protocol::transport::{LowerTransport, Transport};
///
/// let t = Transport::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
/// assert_eq!(t.lower, LowerTransport::Tcp);
/// assert_eq!(t.interleaved.unwrap().first, 0);
///
/// assert!(Transport::parse("HTTP/1.1").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub protocol: TransportProtocol,
    /// Profile, e.g. `AVP` or `SAVP`. Empty for `RAW` and `MP2T`.
    pub profile: String,
    pub lower: LowerTransport,
    pub multicast: bool,
    pub destination: Option<String>,
    pub source: Option<String>,
    pub client_port: Option<Pair<u16>>,
    pub server_port: Option<Pair<u16>>,
    pub interleaved: Option<Pair<u8>>,
    pub ssrc: Option<u32>,
    pub ttl: Option<u8>,
    pub mode: Option<String>,
}

/// Profile name for the RTP audio/video profile (RFC 3551).
pub const AVP_PROFILE: &str = "AVP";

impl Transport {
    /// Plain `RTP/AVP` over UDP with no parameters.
    pub fn rtp_avp() -> Self {
        Transport {
            protocol: TransportProtocol::Rtp,
            profile: AVP_PROFILE.to_string(),
            lower: LowerTransport::Udp,
            multicast: false,
            destination: None,
            source: None,
            client_port: None,
            server_port: None,
            interleaved: None,
            ssrc: None,
            ttl: None,
            mode: None,
        }
    }

    /// `RTP/AVP/TCP;unicast;interleaved=<channel>-<channel + 1>`.
    pub fn interleaved(channel: u8) -> Self {
        Transport {
            lower: LowerTransport::Tcp,
            interleaved: Some(Pair::new(channel, channel.wrapping_add(1))),
            ..Self::rtp_avp()
        }
    }

    /// Build from an SDP `m=` protocol field such as `RTP/AVP` or `RTP/AVP/TCP`.
    pub fn from_sdp_proto(proto: &str) -> Result<Self> {
        Self::parse_spec(proto.trim())
    }

    pub fn is_rtp(&self) -> bool {
        self.protocol == TransportProtocol::Rtp
    }

    pub fn is_tcp(&self) -> bool {
        self.lower == LowerTransport::Tcp
    }

    /// Parse the `Transport` header value (RFC 2326 §12.39).
    ///
    /// When the server lists alternatives separated by `,` the first one wins.
    pub fn parse(header: &str) -> Result<Self> {
        let first = header.split(',').next().unwrap_or_default();
        let mut parts = first.split(';').map(str::trim);
        let mut transport = Self::parse_spec(parts.next().unwrap_or_default())?;

        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim().trim_matches('"'))),
                None => (part, None),
            };
            match (key.to_ascii_lowercase().as_str(), value) {
                ("unicast", None) => transport.multicast = false,
                ("multicast", None) => transport.multicast = true,
                ("destination", Some(v)) => transport.destination = Some(v.to_string()),
                ("source", Some(v)) => transport.source = Some(v.to_string()),
                ("client_port", Some(v)) => transport.client_port = Pair::parse(v),
                ("server_port", Some(v)) => transport.server_port = Pair::parse(v),
                ("interleaved", Some(v)) => transport.interleaved = Pair::parse(v),
                ("ssrc", Some(v)) => transport.ssrc = u32::from_str_radix(v, 16).ok(),
                ("ttl", Some(v)) => transport.ttl = v.parse().ok(),
                ("mode", Some(v)) => transport.mode = Some(v.to_string()),
                _ => tracing::trace!(parameter = part, "ignoring transport parameter"),
            }
        }

        Ok(transport)
    }

    /// `transport-protocol/profile[/lower-transport]`.
    fn parse_spec(spec: &str) -> Result<Self> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidTransport);
        let fields: Vec<&str> = spec.split('/').map(str::trim).collect();

        let protocol = match fields.first().map(|p| p.to_ascii_uppercase()).as_deref() {
            Some("RTP") => TransportProtocol::Rtp,
            Some("MP2T") => TransportProtocol::Mp2t,
            Some("RAW") => TransportProtocol::Raw,
            _ => return Err(invalid()),
        };

        let profile = fields.get(1).copied().ok_or_else(invalid)?.to_ascii_uppercase();
        let lower = match fields.get(2).map(|l| l.to_ascii_uppercase()).as_deref() {
            None | Some("UDP") => LowerTransport::Udp,
            Some("TCP") => LowerTransport::Tcp,
            Some(_) => return Err(invalid()),
        };

        let profile = match protocol {
            TransportProtocol::Rtp => profile,
            // `MP2T/H2221/UDP`, `RAW/RAW/UDP`: the middle field is not an RTP profile.
            _ => String::new(),
        };

        Ok(Transport {
            protocol,
            profile,
            lower,
            ..Self::rtp_avp()
        })
    }

    fn spec(&self) -> String {
        let mut spec = self.protocol.as_str().to_string();
        match self.protocol {
            TransportProtocol::Rtp => {
                spec.push('/');
                spec.push_str(&self.profile);
            }
            TransportProtocol::Mp2t => spec.push_str("/H2221"),
            TransportProtocol::Raw => spec.push_str("/RAW"),
        }
        if self.lower == LowerTransport::Tcp {
            spec.push_str("/TCP");
        } else if self.protocol != TransportProtocol::Rtp {
            spec.push_str("/UDP");
        }
        spec
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec())?;
        f.write_str(if self.multicast { ";multicast" } else { ";unicast" })?;
        if let Some(destination) = &self.destination {
            write!(f, ";destination={}", destination)?;
        }
        if let Some(source) = &self.source {
            write!(f, ";source={}", source)?;
        }
        if let Some(interleaved) = &self.interleaved {
            write!(f, ";interleaved={}", interleaved)?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={}", ttl)?;
        }
        if let Some(port) = &self.client_port {
            write!(f, ";client_port={}", port)?;
        }
        if let Some(port) = &self.server_port {
            write!(f, ";server_port={}", port)?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={:08X}", ssrc)?;
        }
        if let Some(mode) = &self.mode {
            write!(f, ";mode={}", mode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_server_reply() {
        let t = Transport::parse(
            "RTP/AVP;unicast;client_port=50000-50001;server_port=6970-6971;ssrc=3D2F1A0B",
        )
        .unwrap();
        assert_eq!(t.lower, LowerTransport::Udp);
        assert_eq!(t.client_port, Some(Pair::new(50000, 50001)));
        assert_eq!(t.server_port, Some(Pair::new(6970, 6971)));
        assert_eq!(t.ssrc, Some(0x3D2F1A0B));
    }

    #[test]
    fn parse_single_port_and_first_alternative() {
        let t = Transport::parse("RTP/AVP;unicast;client_port=5000,RTP/AVP/TCP;interleaved=0-1")
            .unwrap();
        assert_eq!(t.client_port, Some(Pair::single(5000)));
        assert!(t.interleaved.is_none());
    }

    #[test]
    fn interleaved_request_format() {
        assert_eq!(
            Transport::interleaved(2).to_string(),
            "RTP/AVP/TCP;unicast;interleaved=2-3"
        );
    }

    #[test]
    fn non_rtp_specs() {
        let ts = Transport::from_sdp_proto("MP2T/H2221/UDP").unwrap();
        assert_eq!(ts.protocol, TransportProtocol::Mp2t);
        assert!(!ts.is_rtp());

        let raw = Transport::from_sdp_proto("RAW/RAW/TCP").unwrap();
        assert!(raw.is_tcp());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let mut t = Transport::rtp_avp();
        t.client_port = Some(Pair::new(50010, 50011));
        let parsed = Transport::parse(&t.to_string()).unwrap();
        assert_eq!(parsed, t);
    }
}
