//! Turning a DESCRIBE response into the track model.

use url::Url;

use super::track::{MediaFormat, MediaTrack, PayloadFormat, TrackType};
use crate::protocol::sdp::MediaDescription;
use crate::protocol::transport::AVP_PROFILE;
use crate::protocol::{Range, SessionDescription, Transport};

/// Default RTSP port (RFC 2326 §3.2).
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Presentation-level facts taken from the SDP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    /// `a=range` / `a=length`, microseconds.
    pub duration_us: Option<i64>,
    /// Any media block carried `a=rtcp-mux`.
    pub rtcp_muxed: bool,
}

/// Which media kinds the caller wants built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackFilter {
    pub disable_audio: bool,
    pub disable_video: bool,
}

/// Build the session info and audio/video tracks described by `sdp`.
///
/// `session_url` is the presentation URL (userinfo stripped), `base_url`
/// the `Content-Base` (or `Content-Location`) of the DESCRIBE response.
/// Tracks are only built for permanent sessions (`t=0 0`).
pub fn describe_tracks(
    sdp: &SessionDescription,
    session_url: &Url,
    base_url: Option<&str>,
    filter: TrackFilter,
) -> (SessionInfo, Vec<MediaTrack>) {
    let mut info = SessionInfo {
        name: sdp.session_name.clone(),
        description: sdp.information.clone(),
        language: sdp.attribute("sdplang").map(str::to_string),
        duration_us: None,
        rtcp_muxed: false,
    };

    if let Some(duration) = sdp.attribute("range").and_then(range_duration) {
        info.duration_us = Some(duration);
    }
    if let Some(duration) = sdp.attribute("length").and_then(length_duration) {
        info.duration_us = Some(duration);
    }

    let mut tracks = Vec::new();
    if !sdp.is_permanent() {
        tracing::warn!(timing = ?sdp.timing, "scheduled sessions are not supported");
        return (info, tracks);
    }

    for media in &sdp.media {
        let track_type = match media.media.as_str() {
            "audio" if !filter.disable_audio => TrackType::Audio,
            "video" if !filter.disable_video => TrackType::Video,
            _ => continue,
        };

        let transport = match Transport::from_sdp_proto(&media.proto) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(proto = %media.proto, error = %e, "skipping media block");
                continue;
            }
        };

        if let Some(duration) = media.attribute("range").and_then(range_duration) {
            info.duration_us = Some(duration);
        }

        let muxed = media.attribute("rtcp-mux").is_some();
        info.rtcp_muxed |= muxed;

        let control = media.attribute("control").unwrap_or("*");
        let payload = (transport.is_rtp() && transport.profile == AVP_PROFILE)
            .then(|| payload_format(media));

        tracks.push(MediaTrack {
            url: resolve_control_url(control, session_url, base_url),
            language: media.attribute("sdplang").map(str::to_string),
            muxed,
            format: MediaFormat {
                track_type,
                transport,
                payload,
                bitrate_kbps: media
                    .bandwidth()
                    .filter(|bw| bw.kind.eq_ignore_ascii_case("AS"))
                    .map(|bw| bw.kbps),
            },
        });
    }

    (info, tracks)
}

fn range_duration(value: &str) -> Option<i64> {
    Range::parse(value).ok()?.duration_us()
}

/// `a=length:npt=<seconds>` or a bare number of seconds.
fn length_duration(value: &str) -> Option<i64> {
    let seconds: f64 = value.trim().trim_start_matches("npt=").parse().ok()?;
    (seconds > 0.0).then(|| (seconds * 1_000_000.0).round() as i64)
}

/// Resolve an `a=control` value to the absolute URL used for SETUP
/// (RFC 2326 §C.1.1).
pub fn resolve_control_url(control: &str, session_url: &Url, base_url: Option<&str>) -> String {
    let base_url = base_url.filter(|base| !base.is_empty());

    if let Some(base) = base_url {
        if control.starts_with(base) {
            return control.to_string();
        }
    }
    if control.to_ascii_lowercase().starts_with("rtsp://") {
        return control.to_string();
    }

    let mut url = match base_url.filter(|base| base.to_ascii_lowercase().starts_with("rtsp://")) {
        Some(base) => base.to_string(),
        None => format!(
            "{}://{}:{}{}",
            session_url.scheme(),
            session_url.host_str().unwrap_or_default(),
            session_url.port().unwrap_or(DEFAULT_RTSP_PORT),
            session_url.path()
        ),
    };

    if control == "*" {
        return url;
    }
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str(control);
    url
}

/// Static payload types a server may use without `a=rtpmap` (RFC 3551 §6).
fn static_payload(payload_type: u8) -> Option<(&'static str, u32, Option<u16>)> {
    match payload_type {
        0 => Some(("PCMU", 8000, Some(1))),
        8 => Some(("PCMA", 8000, Some(1))),
        10 => Some(("L16", 44100, Some(2))),
        11 => Some(("L16", 44100, Some(1))),
        14 => Some(("MPA", 90000, None)),
        26 => Some(("JPEG", 90000, None)),
        32 => Some(("MPV", 90000, None)),
        33 => Some(("MP2T", 90000, None)),
        _ => None,
    }
}

/// Collect the payload attributes of one media block.
///
/// `a=fmtp` is only honoured once the `a=rtpmap` it refines has been seen.
fn payload_format(media: &MediaDescription) -> PayloadFormat {
    let payload_type = media
        .formats
        .first()
        .and_then(|fmt| fmt.parse().ok())
        .unwrap_or_default();

    let mut format = PayloadFormat {
        payload_type,
        ..Default::default()
    };
    if let Some((encoding, clock_rate, channels)) = static_payload(payload_type) {
        format.encoding = Some(encoding.to_string());
        format.clock_rate = Some(clock_rate);
        format.channels = channels;
    }

    let mut rtpmap_seen = false;
    for attribute in &media.attributes {
        let value = attribute.value.as_deref().unwrap_or_default().trim();
        match attribute.name.to_ascii_lowercase().as_str() {
            "rtpmap" => {
                if let Some((encoding, clock_rate, channels)) = parse_rtpmap(value) {
                    format.encoding = Some(encoding);
                    format.clock_rate = Some(clock_rate);
                    format.channels = channels.or(format.channels);
                    rtpmap_seen = true;
                }
            }
            "fmtp" if rtpmap_seen => {
                let params = value.split_once(' ').map(|(_, p)| p).unwrap_or_default();
                for param in params.split(';') {
                    if let Some((key, value)) = param.split_once('=') {
                        format
                            .parameters
                            .push((key.trim().to_string(), value.trim().to_string()));
                    }
                }
            }
            "framerate" | "x-framerate" => {
                if let Ok(rate) = value.parse() {
                    format.framerate = Some(rate);
                }
            }
            "framesize" => {
                if let Some((width, height)) = parse_framesize(value) {
                    format.width = Some(width);
                    format.height = Some(height);
                }
            }
            "x-dimensions" => {
                if let Some((width, height)) = parse_dimensions(value) {
                    format.width = Some(width);
                    format.height = Some(height);
                }
            }
            "ptime" => format.ptime = value.parse().ok().or(format.ptime),
            "maxptime" => format.max_ptime = value.parse().ok().or(format.max_ptime),
            "quality" => format.quality = value.parse().ok().or(format.quality),
            _ => {}
        }
    }
    format
}

/// `<pt> <encoding>/<clock>[/<channels>]`.
fn parse_rtpmap(value: &str) -> Option<(String, u32, Option<u16>)> {
    let (payload_type, mapping) = value.split_once(char::is_whitespace)?;
    payload_type.trim().parse::<u8>().ok()?;

    let mut parts = mapping.trim().split('/');
    let encoding = parts.next().map(str::trim).filter(|e| !e.is_empty())?;
    let clock_rate = parts.next()?.trim().parse().ok()?;
    let channels = parts.next().and_then(|c| c.trim().parse().ok());
    Some((encoding.to_string(), clock_rate, channels))
}

/// `<pt> <width>-<height>`.
fn parse_framesize(value: &str) -> Option<(u32, u32)> {
    let (_, size) = value.split_once(char::is_whitespace)?;
    let (width, height) = size.trim().split_once('-')?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

/// `<width>,<height>`.
fn parse_dimensions(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.split_once(',')?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}
