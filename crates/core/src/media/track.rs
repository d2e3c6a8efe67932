use std::fmt;

use crate::protocol::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio,
    Video,
    Text,
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
            Self::Text => f.write_str("text"),
        }
    }
}

/// RTP payload description assembled from `a=rtpmap`, `a=fmtp` and the
/// other per-format attributes of one media block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFormat {
    pub payload_type: u8,
    /// Encoding name as written in `a=rtpmap`, e.g. `H264`.
    pub encoding: Option<String>,
    pub clock_rate: Option<u32>,
    pub channels: Option<u16>,
    /// `a=fmtp` parameters in declaration order.
    pub parameters: Vec<(String, String)>,
    pub framerate: Option<f32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// `a=ptime`, milliseconds.
    pub ptime: Option<u32>,
    /// `a=maxptime`, milliseconds.
    pub max_ptime: Option<u32>,
    pub quality: Option<u32>,
}

impl PayloadFormat {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub track_type: TrackType,
    /// Transport advertised by the SDP `m=` line. The negotiated one lives
    /// with the stream loader.
    pub transport: Transport,
    /// Present for `RTP/AVP` tracks.
    pub payload: Option<PayloadFormat>,
    /// `b=AS:` in kbit/s.
    pub bitrate_kbps: Option<u32>,
}

/// One negotiable media stream of the presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaTrack {
    /// Absolute control URL used for SETUP.
    pub url: String,
    pub language: Option<String>,
    /// RTP and RTCP share one port (`a=rtcp-mux`, RFC 5761).
    pub muxed: bool,
    pub format: MediaFormat,
}

impl MediaTrack {
    pub fn track_type(&self) -> TrackType {
        self.format.track_type
    }

    pub fn clock_rate(&self) -> Option<u32> {
        self.format.payload.as_ref()?.clock_rate
    }
}
