//! Boundary between the stream loaders and the demuxing / buffering side of
//! a playback engine.
//!
//! A loader owns a data source and drives an [`Extractor`] over it. The
//! extractor announces tracks through [`ExtractorOutput`] and writes
//! samples to the [`TrackOutput`] it gets back. The engine supplies the
//! [`SampleQueue`]s behind those outputs through a [`SampleQueueAllocator`].

use std::io;
use std::sync::Arc;

use super::rtp::{RtpPacket, is_rtcp};
use super::track::{MediaTrack, TrackType};
use crate::error::MediaError;

/// No time value.
pub const TIME_UNSET: i64 = i64::MIN + 1;

/// Loading reached the end of the source.
pub const TIME_END_OF_SOURCE: i64 = i64::MIN;

/// Default RTP clock rate when the SDP gives none (RFC 3551 §5).
pub const DEFAULT_CLOCK_RATE: u32 = 90_000;

/// Largest packet a data source hands to an extractor.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Sample format announced by an extractor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Format {
    pub id: Option<String>,
    pub sample_mime_type: Option<String>,
    pub codecs: Option<String>,
    pub clock_rate: Option<u32>,
    pub channels: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f32>,
    pub bitrate_kbps: Option<u32>,
    pub language: Option<String>,
    /// Codec-specific parameters, e.g. `a=fmtp` values.
    pub parameters: Vec<(String, String)>,
}

impl Format {
    /// Derive a format from a negotiated track. `None` when the track has no
    /// RTP payload description to derive one from.
    pub fn from_track(track: &MediaTrack) -> Option<Self> {
        let payload = track.format.payload.as_ref()?;
        let encoding = payload.encoding.as_deref()?;

        Some(Format {
            id: Some(track.url.clone()),
            sample_mime_type: Some(mime_type(track.track_type(), encoding)),
            codecs: Some(encoding.to_string()),
            clock_rate: payload.clock_rate,
            channels: payload.channels,
            width: payload.width,
            height: payload.height,
            frame_rate: payload.framerate,
            bitrate_kbps: track.format.bitrate_kbps,
            language: track.language.clone(),
            parameters: payload.parameters.clone(),
        })
    }
}

fn mime_type(track_type: TrackType, encoding: &str) -> String {
    let known = match encoding.to_ascii_uppercase().as_str() {
        "H264" => "video/avc",
        "H265" => "video/hevc",
        "MP4V-ES" => "video/mp4v-es",
        "JPEG" => "video/mjpeg",
        "MP2T" => "video/mp2t",
        "MPV" => "video/mpeg2",
        "VP8" => "video/x-vnd.on2.vp8",
        "VP9" => "video/x-vnd.on2.vp9",
        "MPEG4-GENERIC" => "audio/mp4a-latm",
        "MP4A-LATM" => "audio/mp4a-latm",
        "MPA" => "audio/mpeg",
        "AC3" => "audio/ac3",
        "OPUS" => "audio/opus",
        "PCMU" => "audio/g711-mlaw",
        "PCMA" => "audio/g711-alaw",
        "L16" => "audio/raw",
        _ => return format!("{track_type}/x-rtp-{}", encoding.to_ascii_lowercase()),
    };
    known.to_string()
}

/// Write side of one track's sample buffer.
pub trait TrackOutput: Send + Sync {
    fn format(&self, format: Format);

    /// Append payload bytes to the sample being assembled.
    fn sample_data(&self, data: &[u8]);

    /// Commit the last `size` bytes passed to [`sample_data`](Self::sample_data)
    /// as one sample.
    fn sample_metadata(&self, time_us: i64, keyframe: bool, size: usize);
}

/// Buffer of demuxed samples owned by the playback engine.
pub trait SampleQueue: TrackOutput {
    fn upstream_format(&self) -> Option<Format>;

    /// `i64::MIN` when nothing has been queued.
    fn largest_queued_timestamp_us(&self) -> i64;

    /// Move the read position to `time_us`. Returns false when the buffer
    /// does not cover that time and nothing was changed.
    fn seek_to(&self, time_us: i64, allow_time_beyond_buffer: bool) -> bool;

    /// Drop all samples. The upstream format is kept.
    fn reset(&self);

    fn discard_to(&self, time_us: i64, to_keyframe: bool);

    fn discard_to_end(&self);

    fn is_ready(&self, loading_finished: bool) -> bool;
}

pub trait SampleQueueAllocator: Send + Sync {
    fn create(&self, track_id: u32, track_type: TrackType) -> Arc<dyn SampleQueue>;
}

/// Receives track announcements from an extractor.
pub trait ExtractorOutput {
    fn track(&mut self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput>;

    /// All tracks have been announced.
    fn end_tracks(&mut self);

    fn seek_map(&mut self, seekable: bool);
}

/// Packet-oriented input: each call yields one datagram or interleaved
/// payload. `Ok(0)` is end of input.
pub trait ExtractorInput {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Continue,
    EndOfInput,
}

pub trait Extractor: Send {
    fn init(&mut self, output: &mut dyn ExtractorOutput);

    fn read(&mut self, input: &mut dyn ExtractorInput) -> io::Result<ReadResult>;

    /// Restart output so that the next sample maps to `time_us`.
    fn seek(&mut self, position: Option<u64>, time_us: i64);
}

pub trait ExtractorFactory: Send + Sync {
    /// `ssrc` is the one negotiated in the SETUP response, if any.
    fn create(
        &self,
        track: &MediaTrack,
        ssrc: Option<u32>,
    ) -> std::result::Result<Box<dyn Extractor>, MediaError>;
}

/// Builds an [`RtpPayloadExtractor`] for every RTP track with a known
/// encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractorFactory;

impl ExtractorFactory for DefaultExtractorFactory {
    fn create(
        &self,
        track: &MediaTrack,
        ssrc: Option<u32>,
    ) -> std::result::Result<Box<dyn Extractor>, MediaError> {
        if !track.format.transport.is_rtp() {
            return Err(MediaError::UnsupportedFormat(format!(
                "{:?} payloads need a container extractor",
                track.format.transport.protocol
            )));
        }
        let format = Format::from_track(track).ok_or_else(|| {
            MediaError::UnsupportedFormat(format!("no rtpmap for {}", track.url))
        })?;
        Ok(Box::new(RtpPayloadExtractor::new(
            track.track_type(),
            format,
            ssrc,
        )))
    }
}

/// Emits each RTP payload as one sample on a single track.
///
/// Packets from a foreign SSRC are dropped, as are RTCP packets that share
/// the port. RTP timestamps are extended past 32-bit wraparound and scaled
/// by the clock rate.
pub struct RtpPayloadExtractor {
    track_type: TrackType,
    format: Format,
    ssrc: Option<u32>,
    clock_rate: i64,
    output: Option<Arc<dyn TrackOutput>>,
    buf: Vec<u8>,
    last_timestamp: Option<u32>,
    extended: i64,
    /// (extended timestamp, time in µs) the timeline is anchored at.
    anchor: Option<(i64, i64)>,
    seek_time_us: i64,
    next_seq: Option<u16>,
    lost: u64,
}

impl RtpPayloadExtractor {
    pub fn new(track_type: TrackType, format: Format, ssrc: Option<u32>) -> Self {
        let clock_rate = i64::from(format.clock_rate.unwrap_or(DEFAULT_CLOCK_RATE).max(1));
        RtpPayloadExtractor {
            track_type,
            format,
            ssrc,
            clock_rate,
            output: None,
            buf: vec![0; MAX_PACKET_SIZE],
            last_timestamp: None,
            extended: 0,
            anchor: None,
            seek_time_us: 0,
            next_seq: None,
            lost: 0,
        }
    }

    /// Packets missing from the sequence so far.
    pub fn lost_packets(&self) -> u64 {
        self.lost
    }

    fn extend(&mut self, timestamp: u32) -> i64 {
        if let Some(last) = self.last_timestamp {
            self.extended += i64::from(timestamp.wrapping_sub(last) as i32);
        } else {
            self.extended = i64::from(timestamp);
        }
        self.last_timestamp = Some(timestamp);
        self.extended
    }

    fn time_us(&mut self, timestamp: u32) -> i64 {
        let extended = self.extend(timestamp);
        let (base, base_us) = *self.anchor.get_or_insert((extended, self.seek_time_us));
        base_us + (extended - base) * 1_000_000 / self.clock_rate
    }
}

impl Extractor for RtpPayloadExtractor {
    fn init(&mut self, output: &mut dyn ExtractorOutput) {
        let track = output.track(0, self.track_type);
        track.format(self.format.clone());
        output.end_tracks();
        output.seek_map(false);
        self.output = Some(track);
    }

    fn read(&mut self, input: &mut dyn ExtractorInput) -> io::Result<ReadResult> {
        let len = input.read_packet(&mut self.buf)?;
        if len == 0 {
            return Ok(ReadResult::EndOfInput);
        }

        let data = &self.buf[..len];
        if is_rtcp(data) {
            return Ok(ReadResult::Continue);
        }
        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!(error = %e, len, "dropping packet");
                return Ok(ReadResult::Continue);
            }
        };

        match self.ssrc {
            Some(ssrc) if ssrc != packet.ssrc => {
                tracing::trace!(
                    expected = format_args!("{ssrc:08x}"),
                    got = format_args!("{:08x}", packet.ssrc),
                    "dropping packet from foreign ssrc"
                );
                return Ok(ReadResult::Continue);
            }
            Some(_) => {}
            None => self.ssrc = Some(packet.ssrc),
        }

        let (sequence, timestamp) = (packet.sequence, packet.timestamp);
        if let Some(expected) = self.next_seq {
            let gap = sequence.wrapping_sub(expected);
            if gap < 0x8000 {
                self.lost += u64::from(gap);
            }
        }
        self.next_seq = Some(sequence.wrapping_add(1));

        let payload_len = packet.payload.len();
        if let Some(output) = &self.output {
            output.sample_data(packet.payload);
        }
        let time_us = self.time_us(timestamp);
        if let Some(output) = &self.output {
            output.sample_metadata(time_us, true, payload_len);
        }
        Ok(ReadResult::Continue)
    }

    fn seek(&mut self, _position: Option<u64>, time_us: i64) {
        self.anchor = None;
        self.seek_time_us = time_us;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;
    use crate::media::rtp::RtpHeader;
    use crate::media::track::{MediaFormat, PayloadFormat};
    use crate::protocol::Transport;

    #[derive(Default)]
    struct Recorder {
        format: Mutex<Option<Format>>,
        pending: Mutex<Vec<u8>>,
        samples: Mutex<Vec<(i64, Vec<u8>)>>,
    }

    impl TrackOutput for Recorder {
        fn format(&self, format: Format) {
            *self.format.lock() = Some(format);
        }

        fn sample_data(&self, data: &[u8]) {
            self.pending.lock().extend_from_slice(data);
        }

        fn sample_metadata(&self, time_us: i64, _keyframe: bool, size: usize) {
            let mut pending = self.pending.lock();
            let start = pending.len() - size;
            let data = pending.split_off(start);
            self.samples.lock().push((time_us, data));
        }
    }

    struct Output(Arc<Recorder>, bool);

    impl ExtractorOutput for Output {
        fn track(&mut self, _id: u32, _track_type: TrackType) -> Arc<dyn TrackOutput> {
            self.0.clone()
        }

        fn end_tracks(&mut self) {
            self.1 = true;
        }

        fn seek_map(&mut self, _seekable: bool) {}
    }

    struct Packets(VecDeque<Vec<u8>>);

    impl ExtractorInput for Packets {
        fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => Ok(0),
            }
        }
    }

    fn video_track(encoding: Option<&str>) -> MediaTrack {
        MediaTrack {
            url: "rtsp://cam/track1".into(),
            language: None,
            muxed: false,
            format: MediaFormat {
                track_type: TrackType::Video,
                transport: Transport::rtp_avp(),
                payload: Some(PayloadFormat {
                    payload_type: 96,
                    encoding: encoding.map(str::to_string),
                    clock_rate: Some(90_000),
                    ..Default::default()
                }),
                bitrate_kbps: None,
            },
        }
    }

    fn run(extractor: &mut dyn Extractor, packets: Vec<Vec<u8>>) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let mut output = Output(recorder.clone(), false);
        extractor.init(&mut output);
        assert!(output.1);

        let mut input = Packets(packets.into());
        while extractor.read(&mut input).unwrap() == ReadResult::Continue {}
        recorder
    }

    #[test]
    fn format_mapping() {
        let format = Format::from_track(&video_track(Some("H264"))).unwrap();
        assert_eq!(format.sample_mime_type.as_deref(), Some("video/avc"));
        assert_eq!(format.clock_rate, Some(90_000));
        assert!(Format::from_track(&video_track(None)).is_none());
    }

    #[test]
    fn factory_rejects_unknown_payload() {
        let factory = DefaultExtractorFactory;
        assert!(factory.create(&video_track(Some("H264")), None).is_ok());
        assert!(matches!(
            factory.create(&video_track(None), None),
            Err(MediaError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn timestamps_are_scaled_and_unwrapped() {
        let mut header = RtpHeader::new(96, 7);
        header.advance_timestamp(u32::MAX - 8999);
        let mut packets = vec![header.packet(false, b"a")];
        header.advance_timestamp(9000);
        packets.push(header.packet(false, b"b"));
        header.advance_timestamp(9000);
        packets.push(header.packet(true, b"c"));

        let mut extractor =
            DefaultExtractorFactory.create(&video_track(Some("H264")), None).unwrap();
        let recorder = run(extractor.as_mut(), packets);

        let samples = recorder.samples.lock();
        let times: Vec<i64> = samples.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0, 100_000, 200_000]);
        assert_eq!(samples[2].1, b"c");
    }

    #[test]
    fn foreign_ssrc_and_rtcp_are_dropped() {
        let mut ours = RtpHeader::new(96, 0x1234);
        let mut theirs = RtpHeader::new(96, 0x9999);
        let packets = vec![
            theirs.packet(false, b"x"),
            vec![0x80, 200, 0, 1, 0, 0, 0, 0],
            ours.packet(false, b"y"),
        ];

        let mut extractor = RtpPayloadExtractor::new(
            TrackType::Video,
            Format::default(),
            Some(0x1234),
        );
        let recorder = run(&mut extractor, packets);
        let samples = recorder.samples.lock();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1, b"y");
    }

    #[test]
    fn seek_reanchors_timeline() {
        let mut header = RtpHeader::new(96, 1);
        let mut extractor = RtpPayloadExtractor::new(TrackType::Video, Format::default(), None);
        let recorder = Arc::new(Recorder::default());
        extractor.init(&mut Output(recorder.clone(), false));

        let mut input = Packets(vec![header.packet(false, b"a")].into());
        extractor.read(&mut input).unwrap();

        extractor.seek(None, 5_000_000);
        header.advance_timestamp(123_456);
        let mut input = Packets(vec![header.packet(false, b"b")].into());
        extractor.read(&mut input).unwrap();

        let samples = recorder.samples.lock();
        assert_eq!(samples[1].0, 5_000_000);
    }

    #[test]
    fn counts_sequence_gaps() {
        let mut header = RtpHeader::new(96, 1);
        let first = header.packet(false, b"a");
        header.packet(false, b"lost");
        header.packet(false, b"lost");
        let fourth = header.packet(false, b"d");

        let mut extractor = RtpPayloadExtractor::new(TrackType::Video, Format::default(), None);
        run(&mut extractor, vec![first, fourth]);
        assert_eq!(extractor.lost_packets(), 2);
    }
}
