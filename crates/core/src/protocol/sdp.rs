//! SDP (Session Description Protocol) parsing (RFC 4566 / RFC 8866).
//!
//! Reads the body of a DESCRIBE response. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (permanent session)
//! a=range:npt=0-596.48                          ← presentation range
//! m=video 0 RTP/AVP 96                          ← media description
//! b=AS:2000                                     ← bandwidth
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1                ← codec parameters
//! a=control:trackID=1                           ← track control URL
//! ```
//!
//! Parsing is lenient: lines that do not follow `<type>=<value>` and
//! unknown line types are skipped. Attribute order is preserved because
//! `a=fmtp` is only meaningful after its `a=rtpmap`.

use crate::error::{ParseErrorKind, Result, RtspError};

/// `a=<name>[:<value>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

/// `b=<type>:<kbps>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bandwidth<'a> {
    pub kind: &'a str,
    pub kbps: u32,
}

/// One `m=` block with the lines that follow it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDescription {
    /// `audio`, `video`, `text`, `application`, ...
    pub media: String,
    pub port: u16,
    /// Transport protocol field, e.g. `RTP/AVP`.
    pub proto: String,
    /// Format list (payload types for RTP).
    pub formats: Vec<String>,
    pub information: Option<String>,
    pub connection: Option<String>,
    pub bandwidths: Vec<String>,
    pub attributes: Vec<Attribute>,
}

/// A parsed session description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    pub version: Option<u32>,
    pub origin: Option<String>,
    pub session_name: Option<String>,
    pub information: Option<String>,
    pub connection: Option<String>,
    /// `t=<start> <stop>`.
    pub timing: Option<(u64, u64)>,
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

fn find_attribute<'a>(attributes: &'a [Attribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|attr| attr.name.eq_ignore_ascii_case(name))
        .map(|attr| attr.value.as_deref().unwrap_or_default())
}

fn parse_bandwidth(line: &str) -> Option<Bandwidth<'_>> {
    let (kind, kbps) = line.split_once(':')?;
    Some(Bandwidth {
        kind: kind.trim(),
        kbps: kbps.trim().parse().ok()?,
    })
}

impl SessionDescription {
    pub fn parse(input: &str) -> Result<Self> {
        let mut sdp = SessionDescription::default();
        let mut current: Option<MediaDescription> = None;
        let mut recognized = false;

        for line in input.lines() {
            let line = line.trim();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            if kind.len() != 1 {
                continue;
            }
            recognized = true;

            if kind == "m" {
                if let Some(media) = current.take() {
                    sdp.media.push(media);
                }
                current = parse_media_line(value);
                if current.is_none() {
                    tracing::warn!(line, "skipping malformed media line");
                }
                continue;
            }

            match (kind, current.as_mut()) {
                ("v", _) => sdp.version = value.trim().parse().ok(),
                ("o", _) => sdp.origin = Some(value.to_string()),
                ("s", _) => sdp.session_name = Some(value.to_string()),
                ("i", Some(media)) => media.information = Some(value.to_string()),
                ("i", None) => sdp.information = Some(value.to_string()),
                ("c", Some(media)) => media.connection = Some(value.to_string()),
                ("c", None) => sdp.connection = Some(value.to_string()),
                ("b", Some(media)) => media.bandwidths.push(value.to_string()),
                ("t", _) => {
                    let mut parts = value.split_whitespace().map(str::parse::<u64>);
                    if let (Some(Ok(start)), Some(Ok(stop))) = (parts.next(), parts.next()) {
                        sdp.timing = Some((start, stop));
                    }
                }
                ("a", media) => {
                    let attribute = match value.split_once(':') {
                        Some((name, value)) => Attribute {
                            name: name.trim().to_string(),
                            value: Some(value.trim().to_string()),
                        },
                        None => Attribute {
                            name: value.trim().to_string(),
                            value: None,
                        },
                    };
                    match media {
                        Some(media) => media.attributes.push(attribute),
                        None => sdp.attributes.push(attribute),
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current {
            sdp.media.push(media);
        }

        if !recognized {
            return Err(RtspError::parse(ParseErrorKind::InvalidSdp));
        }
        Ok(sdp)
    }

    /// First session-level attribute named `name`; `Some("")` for flags.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.attributes, name)
    }

    /// `t=0 0` or no timing at all: an unbounded, permanent session.
    pub fn is_permanent(&self) -> bool {
        matches!(self.timing, None | Some((0, 0)))
    }
}

impl MediaDescription {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.attributes, name)
    }

    pub fn bandwidth(&self) -> Option<Bandwidth<'_>> {
        self.bandwidths.iter().find_map(|line| parse_bandwidth(line))
    }
}

/// `<media> <port>[/<count>] <proto> <fmt> ...`.
fn parse_media_line(value: &str) -> Option<MediaDescription> {
    let mut parts = value.split_whitespace();
    let media = parts.next()?.to_string();
    let port = parts.next()?.split('/').next()?.parse().ok()?;
    let proto = parts.next()?.to_string();
    let formats = parts.map(str::to_string).collect();

    Some(MediaDescription {
        media,
        port,
        proto,
        formats,
        ..Default::default()
    })
}
