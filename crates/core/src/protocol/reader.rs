//! Framed transport reader.
//!
//! The control connection carries two kinds of traffic once media is
//! interleaved (RFC 2326 §10.12): text RTSP messages and `$`-framed binary
//! packets. [`FrameDecoder`] is a sans-IO state machine that is fed arbitrary
//! byte chunks and yields complete frames; [`FramedReader`] drives it from
//! any [`Read`] source.
//!
//! Parse errors are reported per message and leave the decoder usable.
//! Only I/O errors (including EOF) are terminal.

use std::io::{self, Read};

use super::header::{Header, Headers};
use super::message::{INTERLEAVED_MARKER, InterleavedFrame, MediaType, Message, MessageBody};
use super::method::Method;
use super::request::{self, Request};
use super::response::Response;
use crate::error::{ParseErrorKind, Result, RtspError};

const MAX_LINE_LENGTH: usize = 8 * 1024;
const MAX_BODY_LENGTH: usize = 4 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// One unit of traffic read from the control connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Interleaved(InterleavedFrame),
}

#[derive(Debug)]
enum StartLine {
    Request {
        method: Method,
        url: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

#[derive(Debug)]
enum State {
    Idle,
    /// A `$` header has been consumed; `remaining` payload bytes are due.
    Interleaved {
        channel: u8,
        remaining: usize,
        payload: Vec<u8>,
    },
    Headers {
        start: StartLine,
        headers: Headers,
    },
    Body {
        start: StartLine,
        headers: Headers,
        length: usize,
    },
    /// Skipping the header block of a message that failed to parse.
    Discard,
    /// A body of unknown length followed; message boundaries are lost.
    Corrupt,
}

/// Incremental decoder for the control connection byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: State,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(READ_CHUNK),
            state: State::Idle,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a completed frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// `Ok(None)` means more input is needed. An `Err` describes one bad
    /// message; calling `decode` again continues with the following input,
    /// except after [`ParseErrorKind::InvalidContentLength`]: the body length
    /// is unknown, so every later call fails the same way.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        loop {
            match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle => {
                    let Some(&first) = self.buffer.first() else {
                        return Ok(None);
                    };

                    if first == INTERLEAVED_MARKER {
                        if self.buffer.len() < 4 {
                            return Ok(None);
                        }
                        let channel = self.buffer[1];
                        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
                        self.buffer.drain(..4);
                        self.state = State::Interleaved {
                            channel,
                            remaining: length,
                            payload: Vec::with_capacity(length),
                        };
                        continue;
                    }

                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        continue;
                    }
                    match parse_start_line(&line) {
                        Ok(start) => {
                            self.state = State::Headers {
                                start,
                                headers: Headers::new(),
                            }
                        }
                        Err(e) => {
                            self.state = State::Discard;
                            return Err(e);
                        }
                    }
                }

                State::Interleaved {
                    channel,
                    mut remaining,
                    mut payload,
                } => {
                    let take = remaining.min(self.buffer.len());
                    payload.extend(self.buffer.drain(..take));
                    remaining -= take;
                    if remaining == 0 {
                        return Ok(Some(Frame::Interleaved(InterleavedFrame::new(
                            channel, payload,
                        ))));
                    }
                    self.state = State::Interleaved {
                        channel,
                        remaining,
                        payload,
                    };
                    return Ok(None);
                }

                State::Headers { start, mut headers } => {
                    let line = match self.take_line() {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            self.state = State::Headers { start, headers };
                            return Ok(None);
                        }
                        Err(e) => {
                            self.state = State::Discard;
                            return Err(e);
                        }
                    };

                    if line.is_empty() {
                        let length = match headers.content_length() {
                            None => 0,
                            Some(value) => match value.trim().parse::<usize>() {
                                Ok(length) if length <= MAX_BODY_LENGTH => length,
                                _ => {
                                    self.buffer.clear();
                                    self.state = State::Corrupt;
                                    return Err(RtspError::parse(
                                        ParseErrorKind::InvalidContentLength,
                                    ));
                                }
                            },
                        };
                        if length == 0 {
                            return Ok(Some(build_frame(start, headers, None)));
                        }
                        self.state = State::Body {
                            start,
                            headers,
                            length,
                        };
                        continue;
                    }

                    // Folded header value (RFC 2616 §2.2 LWS).
                    if line.starts_with([' ', '\t']) && headers.continue_last(&line) {
                        self.state = State::Headers { start, headers };
                        continue;
                    }

                    match request::parse_header_line(&line) {
                        Ok((name, value)) => {
                            headers.append(name, value);
                            self.state = State::Headers { start, headers };
                        }
                        Err(e) => {
                            self.state = State::Discard;
                            return Err(e);
                        }
                    }
                }

                State::Body {
                    start,
                    headers,
                    length,
                } => {
                    if self.buffer.len() < length {
                        self.state = State::Body {
                            start,
                            headers,
                            length,
                        };
                        return Ok(None);
                    }
                    let raw: Vec<u8> = self.buffer.drain(..length).collect();
                    let content = String::from_utf8_lossy(&raw).into_owned();
                    return Ok(Some(build_frame(start, headers, Some(content))));
                }

                State::Corrupt => {
                    self.buffer.clear();
                    self.state = State::Corrupt;
                    return Err(RtspError::parse(ParseErrorKind::InvalidContentLength));
                }

                State::Discard => {
                    if self.buffer.first() == Some(&INTERLEAVED_MARKER) {
                        continue;
                    }
                    match self.take_line()? {
                        Some(line) if line.is_empty() => {}
                        Some(_) => self.state = State::Discard,
                        None => {
                            self.state = State::Discard;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Remove one LF- or CRLF-terminated line from the buffer.
    fn take_line(&mut self) -> Result<Option<String>> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) if pos > MAX_LINE_LENGTH => {
                self.buffer.drain(..=pos);
                Err(RtspError::parse(ParseErrorKind::LineTooLong))
            }
            Some(pos) => {
                let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            None if self.buffer.len() > MAX_LINE_LENGTH => {
                self.buffer.clear();
                Err(RtspError::parse(ParseErrorKind::LineTooLong))
            }
            None => Ok(None),
        }
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if line.starts_with("RTSP/") {
        let (version, status, reason) = Response::parse_status_line(line)?;
        Ok(StartLine::Response {
            version,
            status,
            reason,
        })
    } else {
        let (method, url, version) = Request::parse_request_line(line)?;
        Ok(StartLine::Request {
            method,
            url,
            version,
        })
    }
}

fn build_frame(start: StartLine, headers: Headers, content: Option<String>) -> Frame {
    let body = content.map(|content| {
        let media_type = headers
            .get(&Header::ContentType)
            .map(MediaType::parse)
            .unwrap_or(MediaType::Other(String::new()));
        MessageBody::new(media_type, content)
    });

    let message = match start {
        StartLine::Request {
            method,
            url,
            version,
        } => Message::Request(Request {
            method,
            url,
            version,
            headers,
            body,
        }),
        StartLine::Response {
            version,
            status,
            reason,
        } => Message::Response(Response {
            version,
            status,
            reason,
            headers,
            body,
        }),
    };
    Frame::Message(message)
}

/// Blocking reader over a byte stream, usually the control `TcpStream`.
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: Read> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Block until one frame is available.
    ///
    /// Returns [`RtspError::Parse`] for a malformed message (the reader stays
    /// usable) and [`RtspError::Io`] when the stream fails or reaches EOF.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(frame);
            }

            let n = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )
                .into());
            }
            self.decoder.feed(&self.chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match decoder.decode() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return frames,
                Err(_) => continue,
            }
        }
    }

    fn decode_chunked(bytes: &[u8], sizes: &[usize]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let mut offset = 0;
        let mut sizes = sizes.iter().cycle();
        while offset < bytes.len() {
            let size = sizes.next().copied().unwrap_or(1).max(1);
            let end = (offset + size).min(bytes.len());
            decoder.feed(&bytes[offset..end]);
            frames.extend(decode_all(&mut decoder));
            offset = end;
        }
        frames
    }

    #[test]
    fn decodes_response_with_sdp_body() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(
            b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\n\
              Content-Length: 5\r\n\r\nv=0\r\n",
        );
        let Some(Frame::Message(Message::Response(resp))) = decoder.decode().unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.cseq(), Some(2));
        let body = resp.body.unwrap();
        assert!(body.is_sdp());
        assert_eq!(body.content, "v=0\r\n");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn waits_for_complete_body() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 10\r\n\r\n12345");
        assert!(decoder.decode().unwrap().is_none());
        decoder.feed(b"67890");
        assert!(matches!(decoder.decode().unwrap(), Some(Frame::Message(_))));
    }

    #[test]
    fn interleaved_frame_between_messages() {
        let mut bytes = b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n".to_vec();
        bytes.extend(InterleavedFrame::new(0, vec![1, 2, 3]).serialize());
        bytes.extend_from_slice(b"GET_PARAMETER rtsp://cam/live RTSP/1.0\r\nCSeq: 1\r\n\r\n");

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[1],
            Frame::Interleaved(InterleavedFrame::new(0, vec![1, 2, 3]))
        );
        assert!(matches!(
            &frames[2],
            Frame::Message(Message::Request(req)) if req.method == Method::GetParameter
        ));
    }

    #[test]
    fn partial_interleaved_frame_resumes() {
        let bytes = InterleavedFrame::new(3, (0..=255).collect()).serialize();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes[..2]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.feed(&bytes[2..100]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.feed(&bytes[100..]);
        let Some(Frame::Interleaved(frame)) = decoder.decode().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.channel, 3);
        assert_eq!(frame.payload.len(), 256);
    }

    #[test]
    fn bad_start_line_is_skipped_with_its_headers() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"HELLO WORLD\r\nCSeq: 1\r\n\r\nRTSP/1.0 200 OK\r\nCSeq: 9\r\n\r\n");
        assert!(matches!(
            decoder.decode(),
            Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine
            })
        ));
        let Some(Frame::Message(Message::Response(resp))) = decoder.decode().unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.cseq(), Some(9));
    }

    #[test]
    fn bad_header_reports_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"RTSP/1.0 200 OK\r\nno colon here\r\n\r\n");
        assert!(matches!(
            decoder.decode(),
            Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader
            })
        ));
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn unknown_body_length_is_unrecoverable() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"RTSP/1.0 200 OK\r\nCSeq: 4\r\nContent-Length: -1\r\n\r\nv=0\r\n");
        let invalid = |result: crate::error::Result<Option<Frame>>| {
            matches!(
                result,
                Err(RtspError::Parse {
                    kind: ParseErrorKind::InvalidContentLength
                })
            )
        };
        assert!(invalid(decoder.decode()));
        assert_eq!(decoder.buffered(), 0);

        // The body never surfaces as a message of its own.
        decoder.feed(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n");
        assert!(invalid(decoder.decode()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn folded_header_values_join() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nPublic: OPTIONS,\r\n DESCRIBE\r\n\r\n");
        let Some(Frame::Message(Message::Response(resp))) = decoder.decode().unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.header(&Header::Public), Some("OPTIONS, DESCRIBE"));
    }

    #[test]
    fn reader_reports_eof_as_io_error() {
        let data: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n";
        let mut reader = FramedReader::new(data);
        assert!(matches!(reader.read_frame(), Ok(Frame::Message(_))));
        assert!(matches!(reader.read_frame(), Err(RtspError::Io(_))));
    }

    fn arb_frame() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            (any::<u8>(), prop::collection::vec(any::<u8>(), 0..600))
                .prop_map(|(channel, payload)| InterleavedFrame::new(channel, payload).serialize()),
            (1u32..10_000).prop_map(|cseq| {
                format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\nContent-Length: 4\r\n\r\nabcd", cseq)
                    .into_bytes()
            }),
        ]
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_change_frames(
            frames in prop::collection::vec(arb_frame(), 1..12),
            sizes in prop::collection::vec(1usize..64, 1..16),
        ) {
            let bytes: Vec<u8> = frames.concat();

            let mut whole = FrameDecoder::new();
            whole.feed(&bytes);
            let expected = decode_all(&mut whole);

            prop_assert_eq!(expected.len(), frames.len());
            prop_assert_eq!(decode_chunked(&bytes, &sizes), expected);
        }
    }
}
