//! Request/response correlation on the control connection.
//!
//! RTSP allows one outstanding request per connection. [`Dispatcher`] keeps
//! later requests queued by CSeq and releases the next one when the
//! outstanding request is resolved, by its response, a write failure, or the
//! retry monitor giving up on it.

use std::collections::{BTreeMap, VecDeque};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender as ChannelSender, select, unbounded};
use parking_lot::Mutex;
use url::Url;

use super::config::ClientConfig;
use super::sender::{Outgoing, SendReport, Sender};
use crate::error::{ClientError, ParseErrorKind, Result, RtspError};
use crate::media::describe::DEFAULT_RTSP_PORT;
use crate::protocol::{
    Frame, FramedReader, Header, InterleavedFrame, Message, Method, RTSP_VERSION, Request,
    Response, status,
};

/// Recently resolved CSeqs remembered to recognise duplicate responses.
const RESOLVED_HISTORY: usize = 64;

/// Everything the dispatcher reports to its owner.
#[derive(Debug)]
pub enum DispatchEvent {
    /// A validated request initiated by the server.
    Request(Request),
    /// 2xx response to `request`.
    Response { request: Request, response: Response },
    /// 401 response to `request`.
    Unauthorized { request: Request, response: Response },
    /// Any other non-2xx response to `request`.
    UnSuccess { request: Request, response: Response },
    /// A response without CSeq, with a wrong version, or matching nothing.
    MalformedResponse,
    /// The retry monitor expired before a response arrived.
    NoResponse(Request),
    /// Unsolicited 408 from the server.
    RequestTimeOut,
    IoError(ClientError),
    Interleaved(InterleavedFrame),
}

/// What the session needs from a connection. Implemented by [`Dispatcher`]
/// and by recording doubles in tests.
pub trait RequestSink: Send {
    /// Send `request` now, or queue it behind the outstanding one.
    fn execute(&self, request: Request);

    fn respond(&self, response: Response);

    fn is_open(&self) -> bool;

    fn close(&mut self);
}

enum MonitorCommand {
    Watch(u32),
    Cancel(u32),
    Stop,
}

#[derive(Default)]
struct Pending {
    in_flight: BTreeMap<u32, Request>,
    queued: BTreeMap<u32, Request>,
    resolved: VecDeque<u32>,
}

impl Pending {
    fn resolve(&mut self, cseq: u32) -> Option<Request> {
        let request = self.in_flight.remove(&cseq)?;
        if self.resolved.len() == RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
        self.resolved.push_back(cseq);
        Some(request)
    }
}

struct Shared {
    pending: Mutex<Pending>,
    events: ChannelSender<DispatchEvent>,
    sender: Sender,
    monitor: ChannelSender<MonitorCommand>,
    open: AtomicBool,
}

impl Shared {
    fn emit(&self, event: DispatchEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("dispatch event dropped, owner gone");
        }
    }

    /// Hand `request` to the sender. Caller holds the pending lock.
    fn dispatch(&self, pending: &mut Pending, request: Request) {
        let Some(cseq) = request.cseq() else {
            return;
        };
        tracing::debug!(cseq, method = %request.method, url = %request.url, "sending request");
        pending.in_flight.insert(cseq, request.clone());
        let _ = self.monitor.send(MonitorCommand::Watch(cseq));
        self.sender.send(Outgoing::Request(request));
    }

    fn execute(&self, request: Request) {
        let Some(cseq) = request.cseq() else {
            tracing::warn!(method = %request.method, "refusing request without CSeq");
            return;
        };
        let mut pending = self.pending.lock();
        if pending.in_flight.is_empty() && pending.queued.is_empty() {
            self.dispatch(&mut pending, request);
        } else {
            tracing::trace!(cseq, "request queued");
            pending.queued.insert(cseq, request);
        }
    }

    /// Resolve `cseq` and send the next queued request.
    fn resolve(&self, cseq: u32) -> Option<Request> {
        let mut pending = self.pending.lock();
        let request = pending.resolve(cseq)?;
        let _ = self.monitor.send(MonitorCommand::Cancel(cseq));
        if pending.in_flight.is_empty() {
            if let Some((_, next)) = pending.queued.pop_first() {
                self.dispatch(&mut pending, next);
            }
        }
        Some(request)
    }

    fn respond(&self, response: Response) {
        self.sender.send(Outgoing::Response(response));
    }

    fn on_response(&self, response: Response) {
        let cseq = response.cseq();
        tracing::debug!(?cseq, status = response.status, "response");

        if response.version != RTSP_VERSION {
            tracing::warn!(version = %response.version, "unsupported RTSP version");
            let mut reply = Response::new(status::VERSION_NOT_SUPPORTED);
            if let Some(cseq) = cseq {
                reply.headers.insert(Header::CSeq, cseq.to_string());
                self.resolve(cseq);
            }
            self.respond(reply);
            self.emit(DispatchEvent::MalformedResponse);
            return;
        }

        let Some(cseq) = cseq else {
            tracing::warn!(status = response.status, "response without CSeq");
            self.emit(DispatchEvent::MalformedResponse);
            return;
        };

        match self.resolve(cseq) {
            Some(request) => self.emit(match response.status {
                200..=299 => DispatchEvent::Response { request, response },
                status::UNAUTHORIZED => DispatchEvent::Unauthorized { request, response },
                _ => DispatchEvent::UnSuccess { request, response },
            }),
            None if self.pending.lock().resolved.contains(&cseq) => {
                tracing::debug!(cseq, "ignoring duplicate response");
            }
            None if response.status == status::REQUEST_TIMEOUT => {
                self.emit(DispatchEvent::RequestTimeOut);
            }
            None => {
                tracing::warn!(cseq, status = response.status, "response matches no request");
                self.emit(DispatchEvent::MalformedResponse);
            }
        }
    }

    fn on_request(&self, request: Request) {
        tracing::debug!(method = %request.method, cseq = ?request.cseq(), "server request");

        match validate_server_request(&request) {
            Ok(()) => self.emit(DispatchEvent::Request(request)),
            Err(reply) => {
                tracing::warn!(method = %request.method, status = reply.status, "rejecting server request");
                self.respond(reply);
            }
        }
    }

    fn on_send_report(&self, report: SendReport) {
        let SendReport::Failed { cseq, error, .. } = report else {
            return;
        };
        if let Some(cseq) = cseq {
            self.resolve(cseq);
        }
        if self.open.load(Ordering::SeqCst) {
            self.emit(DispatchEvent::IoError(ClientError::from_io(&error)));
        }
    }

    fn on_expired(&self, cseq: u32) {
        if let Some(request) = self.resolve(cseq) {
            tracing::warn!(cseq, method = %request.method, "no response");
            self.emit(DispatchEvent::NoResponse(request));
        }
    }
}

/// Check a server-initiated request (RFC 2326 §10). `Err` carries the
/// error reply.
fn validate_server_request(request: &Request) -> std::result::Result<(), Response> {
    let reply = |code: u16| {
        let response = Response::new(code);
        match request.cseq() {
            Some(cseq) => response.with_header(Header::CSeq, cseq.to_string()),
            None => response,
        }
    };

    if request.version != RTSP_VERSION {
        return Err(reply(status::VERSION_NOT_SUPPORTED));
    }
    let needs_session = match request.method {
        Method::Announce | Method::GetParameter | Method::SetParameter | Method::Redirect => true,
        Method::Options => false,
        _ => return Err(reply(status::NOT_IMPLEMENTED)),
    };
    if request.cseq().is_none() {
        return Err(reply(status::BAD_REQUEST));
    }
    if let Some(required) = request.header(&Header::Require) {
        return Err(reply(status::OPTION_NOT_SUPPORTED).with_header(Header::Unsupported, required));
    }
    if needs_session && request.header(&Header::Session).is_none() {
        return Err(reply(status::SESSION_NOT_FOUND));
    }
    Ok(())
}

/// Owns the control connection and its reader, sender and retry-monitor
/// threads.
pub struct Dispatcher {
    shared: Arc<Shared>,
    stream: TcpStream,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Connect to the host of `url` (port 554 unless given).
    pub fn connect(url: &Url, config: &ClientConfig) -> Result<(Self, Receiver<DispatchEvent>)> {
        let host = url
            .host_str()
            .ok_or_else(|| RtspError::InvalidUrl(format!("{url}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);

        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => {
                    tracing::info!(%addr, "connected");
                    return Self::with_stream(stream, config.request_timeout);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connect failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => ClientError::from_io(&e).into(),
            None => RtspError::InvalidUrl(format!("{host}: no addresses")),
        })
    }

    /// Run the dispatcher over an already connected stream.
    pub fn with_stream(
        stream: TcpStream,
        request_timeout: Duration,
    ) -> Result<(Self, Receiver<DispatchEvent>)> {
        stream.set_nodelay(true)?;

        let (events_tx, events_rx) = unbounded();
        let (reports_tx, reports_rx) = unbounded();
        let (monitor_tx, monitor_rx) = unbounded();

        let sender = Sender::spawn(stream.try_clone()?, reports_tx)?;
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            events: events_tx,
            sender,
            monitor: monitor_tx,
            open: AtomicBool::new(true),
        });

        let reader = {
            let shared = shared.clone();
            let stream = stream.try_clone()?;
            thread::Builder::new()
                .name("rtsp-reader".into())
                .spawn(move || read_loop(FramedReader::new(stream), &shared))?
        };
        let monitor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("rtsp-monitor".into())
                .spawn(move || monitor_loop(&shared, monitor_rx, reports_rx, request_timeout))?
        };

        Ok((
            Dispatcher {
                shared,
                stream,
                workers: vec![reader, monitor],
            },
            events_rx,
        ))
    }

    pub fn send_interleaved(&self, frame: InterleavedFrame) {
        self.shared.sender.send(Outgoing::Interleaved(frame));
    }

    /// Requests sent but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().in_flight.len()
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.local_addr().ok()
    }
}

impl RequestSink for Dispatcher {
    fn execute(&self, request: Request) {
        if self.is_open() {
            self.shared.execute(request);
        }
    }

    fn respond(&self, response: Response) {
        self.shared.respond(response);
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.monitor.send(MonitorCommand::Stop);

        // A queued TEARDOWN still reaches the server; the sender drains its
        // queue before stopping.
        let teardowns: Vec<Request> = std::mem::take(&mut self.shared.pending.lock().queued)
            .into_values()
            .filter(|request| request.method == Method::Teardown)
            .collect();
        for request in teardowns {
            tracing::debug!(cseq = ?request.cseq(), "sending TEARDOWN ahead of unanswered requests");
            self.shared.sender.send(Outgoing::Request(request));
        }
        self.shared.sender.stop();
        let _ = self.stream.shutdown(Shutdown::Both);

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        tracing::info!("connection closed");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(mut reader: FramedReader<TcpStream>, shared: &Shared) {
    loop {
        match reader.read_frame() {
            Ok(Frame::Message(Message::Response(response))) => shared.on_response(response),
            Ok(Frame::Message(Message::Request(request))) => shared.on_request(request),
            Ok(Frame::Interleaved(frame)) => {
                tracing::trace!(channel = frame.channel, len = frame.payload.len(), "interleaved frame");
                shared.emit(DispatchEvent::Interleaved(frame));
            }
            Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidContentLength,
            }) => {
                if shared.open.load(Ordering::SeqCst) {
                    tracing::error!("message body of unknown length, framing lost");
                    shared.emit(DispatchEvent::IoError(ClientError::Malfunction));
                }
                break;
            }
            Err(RtspError::Parse { kind }) => {
                tracing::warn!(%kind, "malformed message");
                shared.respond(Response::bad_request());
            }
            Err(e) => {
                if shared.open.load(Ordering::SeqCst) {
                    tracing::error!(error = %e, "control connection failed");
                    let error = match &e {
                        RtspError::Io(io) => ClientError::from_io(io),
                        other => ClientError::Io(other.to_string()),
                    };
                    shared.emit(DispatchEvent::IoError(error));
                }
                break;
            }
        }
    }
    tracing::debug!("reader exited");
}

fn monitor_loop(
    shared: &Shared,
    commands: Receiver<MonitorCommand>,
    reports: Receiver<SendReport>,
    timeout: Duration,
) {
    let mut deadlines: BTreeMap<u32, Instant> = BTreeMap::new();

    loop {
        let timer = match deadlines.values().min() {
            Some(&deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };

        select! {
            recv(commands) -> command => match command {
                Ok(MonitorCommand::Watch(cseq)) => {
                    deadlines.insert(cseq, Instant::now() + timeout);
                }
                Ok(MonitorCommand::Cancel(cseq)) => {
                    deadlines.remove(&cseq);
                }
                Ok(MonitorCommand::Stop) | Err(_) => break,
            },
            recv(reports) -> report => match report {
                Ok(report) => shared.on_send_report(report),
                Err(_) => break,
            },
            recv(timer) -> _ => {
                let now = Instant::now();
                let expired: Vec<u32> = deadlines
                    .iter()
                    .filter(|&(_, &deadline)| deadline <= now)
                    .map(|(&cseq, _)| cseq)
                    .collect();
                for cseq in expired {
                    deadlines.remove(&cseq);
                    shared.on_expired(cseq);
                }
            }
        }
    }
    tracing::debug!("retry monitor exited");
}
