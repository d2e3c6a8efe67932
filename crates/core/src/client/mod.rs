//! RTSP client: the session state machine and the actor thread running it.
//!
//! The [`Client`] reacts to dispatcher events (responses, failures, server
//! requests, interleaved data) and to [`Command`]s from the media period and
//! source. It runs on one thread and owns the [`MediaSession`]; everything
//! else talks to it through a [`ClientHandle`].
//!
//! ```text
//! OPTIONS ─▶ DESCRIBE ─▶ SETUP (per stream) ─▶ PLAY ◀─▶ PAUSE
//!                                                 └──▶ TEARDOWN
//! ```

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod keepalive;
pub mod sender;
pub mod session;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender as ChannelSender, select, unbounded};
use parking_lot::{Mutex, RwLock};
use url::Url;

pub use builder::{DefaultMethodBuilder, MethodBuilder, RequestContext};
pub use config::{ClientConfig, HolePunch, NatMethod, TransportMode};
pub use dispatcher::{DispatchEvent, Dispatcher, RequestSink};
pub use session::{
    ClientState, DeliveryMode, MediaSession, PlaybackNotice, PlaybackState, SessionSnapshot,
    SessionStatus, SessionStream,
};

use crate::auth::{AuthScheme, Challenge, Credentials};
use crate::error::{ClientError, Result};
use crate::media::describe::{TrackFilter, describe_tracks};
use crate::protocol::transport::Pair;
use crate::protocol::{
    Header, LowerTransport, Method, Range, Request, Response, SessionDescription, Transport,
    status,
};
use keepalive::KeepAlive;
use session::{UserInfo, parse_public, parse_session_header, presentation_url};

/// Requests to the client actor.
pub enum Command {
    /// Take ownership of the period's streams and start setting them up.
    PrepareStreams(Vec<Arc<dyn SessionStream>>),
    /// The stream at this index opened its data source; send its SETUP.
    ContinuePrepareStream(usize),
    Pause,
    Resume,
    /// Reposition playback, seconds.
    SeekTo(f64),
    /// TEARDOWN if needed and drop the connection.
    Close,
    /// Stop every stream, then close.
    Release,
}

/// What the client reports to the media source.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// DESCRIBE produced a track model. `None` means live.
    DescriptionRefreshed { duration_us: Option<i64> },
    /// DESCRIBE returned something other than SDP.
    MediaTypeUnsupported(String),
    TransportNegotiated(LowerTransport),
    /// The session failed and was closed.
    Error(ClientError),
}

/// The session state machine.
pub struct Client {
    config: ClientConfig,
    session: MediaSession,
    sink: Box<dyn RequestSink>,
    builder: Box<dyn MethodBuilder>,
    events: ChannelSender<ClientEvent>,
    ticks: ChannelSender<()>,
    status: Arc<SessionStatus>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    user: Option<UserInfo>,
    credentials: Option<Credentials>,
    /// Schemes already answered, keyed by the CSeq of the retried request.
    /// CSeqs of requests already resent with credentials.
    auth_retried: HashSet<u32>,
    keep_alive: Option<KeepAlive>,
    public_known: bool,
    closed: bool,
}

impl Client {
    /// `ticks` receives one message per keep-alive period.
    pub fn new(
        url: Url,
        user: Option<UserInfo>,
        config: ClientConfig,
        sink: Box<dyn RequestSink>,
        builder: Box<dyn MethodBuilder>,
        events: ChannelSender<ClientEvent>,
        ticks: ChannelSender<()>,
    ) -> Self {
        let mode = if config.is_interleaved() || config.try_tcp_first {
            DeliveryMode::Interleaved
        } else {
            DeliveryMode::Unicast
        };
        let session = MediaSession::new(url, mode);
        let status = Arc::new(SessionStatus::default());
        let snapshot = Arc::new(RwLock::new(session.publish(&status)));

        Self {
            config,
            session,
            sink,
            builder,
            events,
            ticks,
            status,
            snapshot,
            user,
            credentials: None,
            auth_retried: HashSet::new(),
            keep_alive: None,
            public_known: false,
            closed: false,
        }
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> Arc<RwLock<SessionSnapshot>> {
        self.snapshot.clone()
    }

    pub fn session(&self) -> &MediaSession {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start the method sequence with OPTIONS.
    pub fn open(&mut self) {
        let request = self.build(|b, ctx| b.options(ctx));
        self.dispatch(request);
    }

    pub fn handle_event(&mut self, event: DispatchEvent) {
        if self.closed {
            return;
        }
        match event {
            DispatchEvent::Response { request, response } => self.on_response(request, response),
            DispatchEvent::Unauthorized { request, response } => {
                self.on_unauthorized(request, response)
            }
            DispatchEvent::UnSuccess { request, response } => self.on_unsuccess(request, response),
            DispatchEvent::Request(request) => self.on_server_request(request),
            DispatchEvent::Interleaved(frame) => {
                match self.session.channels.get(&frame.channel) {
                    Some(&index) => self.session.streams[index].on_interleaved(frame),
                    None => tracing::trace!(channel = frame.channel, "frame on unknown channel"),
                }
            }
            DispatchEvent::NoResponse(request) => {
                let tolerated = matches!(request.method, Method::Options | Method::GetParameter)
                    && self.session.is_interleaved();
                if tolerated {
                    tracing::debug!(method = %request.method, "no response to keep-alive, ignored");
                } else {
                    self.fail(ClientError::NoResponse {
                        method: request.method,
                        cseq: request.cseq().unwrap_or_default(),
                    });
                }
            }
            DispatchEvent::MalformedResponse => self.fail(ClientError::Malfunction),
            DispatchEvent::RequestTimeOut => self.fail(ClientError::RequestTimeOut),
            DispatchEvent::IoError(error) => self.fail(error),
        }
        self.publish();
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::PrepareStreams(streams) => self.prepare_streams(streams),
            Command::ContinuePrepareStream(index) => self.continue_prepare_stream(index),
            Command::Pause => {
                if self.session.playback == PlaybackState::Playing {
                    let request = self.build(|b, ctx| b.pause(ctx));
                    self.dispatch(request);
                }
            }
            Command::Resume => {
                if self.session.playback == PlaybackState::Paused {
                    let request = self.build(|b, ctx| b.play(ctx, None, None));
                    self.dispatch(request);
                }
            }
            Command::SeekTo(position) => self.seek_to(position),
            Command::Close => self.close(),
            Command::Release => self.release(),
        }
        self.publish();
    }

    /// Refresh the session so the server keeps it alive.
    pub fn keep_alive(&mut self) {
        if self.closed || self.session.state < ClientState::Ready {
            return;
        }
        let request = if self.session.supports(Method::GetParameter) {
            self.build(|b, ctx| b.get_parameter(ctx))
        } else {
            self.build(|b, ctx| b.options(ctx))
        };
        self.dispatch(request);
    }

    /// TEARDOWN when a session exists, then drop the connection.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_keep_alive();

        let teardown = self.session.state >= ClientState::Ready
            && (self.session.server_methods.is_empty()
                || self.session.supports(Method::Teardown));
        if teardown && self.sink.is_open() {
            let request = self.build(|b, ctx| b.teardown(ctx));
            self.dispatch(request);
        }

        self.sink.close();
        self.session.state = ClientState::Idle;
        self.closed = true;
        self.publish();
        tracing::info!(url = %self.session.url, "session closed");
    }

    /// Stop every stream and close.
    pub fn release(&mut self) {
        self.stop_keep_alive();
        for stream in &self.session.streams {
            stream.on_playback(PlaybackNotice::Stop);
        }
        self.session.playback = PlaybackState::Stopped;
        self.close();
        self.session.clear();
        self.publish();
    }

    fn build(&mut self, f: impl FnOnce(&dyn MethodBuilder, &RequestContext<'_>) -> Request) -> Request {
        let cseq = self.session.next_cseq();
        let url = self.session.url.to_string();
        let play_url = self.session.play_url();
        let ctx = RequestContext {
            url: &url,
            play_url: &play_url,
            session_id: self.session.id.as_deref(),
            user_agent: &self.config.user_agent,
            cseq,
        };
        f(self.builder.as_ref(), &ctx)
    }

    /// Gate `request` on the protocol state, sign it and hand it over.
    fn dispatch(&mut self, mut request: Request) {
        if !self.session.state.allows(request.method) {
            tracing::warn!(
                method = %request.method,
                state = ?self.session.state,
                "method not allowed in current state"
            );
            return;
        }
        if request.method == Method::Setup && self.session.state == ClientState::Idle {
            self.session.state = ClientState::Init;
        }
        if let Some(credentials) = self.credentials.as_mut() {
            if request.header(&Header::Authorization).is_none() {
                credentials.apply(&mut request);
            }
        }
        self.sink.execute(request);
    }

    fn emit(&mut self, event: ClientEvent) {
        self.publish();
        if self.events.send(event).is_err() {
            tracing::trace!("client event dropped, source gone");
        }
    }

    fn publish(&self) {
        *self.snapshot.write() = self.session.publish(&self.status);
    }

    fn fail(&mut self, error: ClientError) {
        tracing::error!(%error, url = %self.session.url, "session failed");
        self.close();
        self.emit(ClientEvent::Error(error));
    }

    fn stop_keep_alive(&mut self) {
        if let Some(mut keep_alive) = self.keep_alive.take() {
            keep_alive.stop();
        }
    }

    // Responses

    fn on_response(&mut self, request: Request, response: Response) {
        if let Some(cseq) = request.cseq() {
            self.auth_retried.remove(&cseq);
        }
        match request.method {
            Method::Options => self.on_options(&response),
            Method::Describe => self.on_describe(&response),
            Method::Setup => self.on_setup(&request, &response),
            Method::Play => {
                self.session.state = ClientState::Playing;
                self.on_play_success();
                let lower = if self.session.is_interleaved() {
                    LowerTransport::Tcp
                } else {
                    LowerTransport::Udp
                };
                self.emit(ClientEvent::TransportNegotiated(lower));
            }
            Method::Pause => {
                self.session.state = ClientState::Ready;
                self.on_pause_success();
            }
            Method::Record => self.session.state = ClientState::Recording,
            Method::Teardown => self.session.state = ClientState::Idle,
            _ => {}
        }
    }

    fn on_options(&mut self, response: &Response) {
        if !self.public_known {
            if let Some(public) = response.header(&Header::Public) {
                self.session.server_methods = parse_public(public);
                self.public_known = true;
            }
        }
        if let Some(server) = response.header(&Header::Server) {
            self.session.server = Some(server.to_string());
        }
        if self.session.state == ClientState::Idle && self.session.tracks.is_empty() {
            let request = self.build(|b, ctx| b.describe(ctx));
            self.dispatch(request);
        }
    }

    fn on_describe(&mut self, response: &Response) {
        let body = match &response.body {
            Some(body) if body.is_sdp() => body,
            other => {
                let media_type = other
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |body| body.media_type.to_string());
                tracing::warn!(%media_type, "description is not SDP");

                let mut reply = Response::new(status::UNSUPPORTED_MEDIA_TYPE)
                    .with_header(Header::Unsupported, media_type.clone());
                if let Some(cseq) = response.cseq() {
                    reply.headers.insert(Header::CSeq, cseq.to_string());
                }
                self.sink.respond(reply);
                self.close();
                self.emit(ClientEvent::MediaTypeUnsupported(media_type));
                return;
            }
        };

        let sdp = match SessionDescription::parse(&body.content) {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable session description");
                self.fail(ClientError::Malfunction);
                return;
            }
        };

        let base_url = response
            .header(&Header::ContentBase)
            .or_else(|| response.header(&Header::ContentLocation))
            .map(str::to_string);
        let filter = TrackFilter {
            disable_audio: self.config.disable_audio,
            disable_video: self.config.disable_video,
        };
        let (info, tracks) =
            describe_tracks(&sdp, &self.session.url, base_url.as_deref(), filter);

        tracing::info!(
            tracks = tracks.len(),
            duration_us = ?info.duration_us,
            base = ?base_url,
            "session described"
        );
        let duration_us = info.duration_us;
        self.session.base_url = base_url;
        self.session.info = info;
        self.session.tracks = tracks;
        // Scheduled sessions carry no tracks to set up.
        if sdp.is_permanent() {
            self.emit(ClientEvent::DescriptionRefreshed { duration_us });
        }
    }

    fn on_setup(&mut self, request: &Request, response: &Response) {
        if self.session.id.is_none() {
            if let Some(value) = response.header(&Header::Session) {
                let (id, timeout) = parse_session_header(value);
                tracing::info!(session = %id, ?timeout, "session established");
                self.session.id = Some(id);
                if let Some(timeout) = timeout {
                    self.session.timeout = timeout;
                }
            }
        }
        if self.session.state == ClientState::Init {
            self.session.state = ClientState::Ready;
        }

        let negotiated = response
            .header(&Header::Transport)
            .or_else(|| request.header(&Header::Transport))
            .map(Transport::parse);
        match negotiated {
            Some(Ok(transport)) => self.configure_transport(&request.url, transport),
            _ => {
                self.fail(ClientError::Malfunction);
                return;
            }
        }
        self.continue_preparing();
    }

    /// Apply the transport the server chose to the stream set up at `url`.
    fn configure_transport(&mut self, url: &str, mut transport: Transport) {
        let Some(index) = self
            .session
            .stream_for_url(url)
            .or_else(|| self.session.prepared.last().copied())
        else {
            return;
        };
        let stream = self.session.streams[index].clone();
        let current = stream.transport();

        if transport.is_tcp() {
            if transport.interleaved.is_none() {
                transport.interleaved = current
                    .interleaved
                    .or_else(|| Transport::interleaved(self.session.next_tcp_channel()).interleaved);
            }
            if let Some(pair) = transport.interleaved {
                self.session.channels.insert(pair.first, index);
                if let Some(second) = pair.second {
                    self.session.channels.insert(second, index);
                }
            }
        }

        let switched = current.lower != transport.lower;
        tracing::debug!(stream = index, transport = %transport, switched, "transport configured");
        stream.set_transport(transport.clone());

        if switched {
            self.session.mode = if transport.is_tcp() {
                DeliveryMode::Interleaved
            } else {
                DeliveryMode::Unicast
            };
            self.session.in_fallback = true;
            tracing::info!(stream = index, lower = %transport.lower, "media transport switched");
            self.publish();
            stream.prepare();
        }
    }

    fn on_play_success(&mut self) {
        if self.session.pending_reset.take().is_some() {
            for stream in &self.session.streams {
                stream.on_playback(PlaybackNotice::Seek);
            }
        } else {
            match self.session.playback {
                PlaybackState::Prepared => self.start_keep_alive(),
                PlaybackState::Paused => {
                    for stream in &self.session.streams {
                        stream.on_playback(PlaybackNotice::Resume);
                    }
                }
                _ => {}
            }
        }
        self.session.playback = PlaybackState::Playing;
    }

    fn on_pause_success(&mut self) {
        match self.session.pending_reset {
            Some(position) => {
                if self.session.playback == PlaybackState::Playing {
                    let request =
                        self.build(|b, ctx| b.play(ctx, Some(Range::from_start(position)), None));
                    self.dispatch(request);
                }
            }
            None => {
                self.session.playback = PlaybackState::Paused;
                for stream in &self.session.streams {
                    stream.on_playback(PlaybackNotice::Pause);
                }
            }
        }
    }

    fn start_keep_alive(&mut self) {
        let interval = keepalive::interval(self.session.timeout, self.config.keep_alive_margin);
        let ticks = self.ticks.clone();
        match KeepAlive::start(interval, move || ticks.send(()).is_ok()) {
            Ok(keep_alive) => self.keep_alive = Some(keep_alive),
            Err(e) => tracing::warn!(error = %e, "keep-alive not started"),
        }
    }

    // Failures

    fn on_unauthorized(&mut self, request: Request, response: Response) {
        let method = request.method;
        let retried = request
            .cseq()
            .is_some_and(|cseq| self.auth_retried.remove(&cseq));
        if retried {
            tracing::warn!(%method, "authorization refused");
            self.fail(ClientError::Unauthorized { method });
            return;
        }

        let Some((username, password)) = self.user.clone() else {
            tracing::warn!(%method, "authorization required but no credentials");
            self.fail(ClientError::Unauthorized { method });
            return;
        };
        let challenges: Vec<Challenge> = response
            .headers
            .get_all(&Header::WwwAuthenticate)
            .filter_map(Challenge::parse)
            .collect();
        let challenge = challenges
            .iter()
            .find(|challenge| challenge.scheme == AuthScheme::Digest)
            .or_else(|| challenges.first());
        let Some(challenge) = challenge else {
            tracing::warn!(%method, "no supported authentication scheme offered");
            self.fail(ClientError::Unauthorized { method });
            return;
        };

        let mut credentials = Credentials::from_challenge(challenge, &username, &password);
        let mut retry = request;
        retry.headers.remove(&Header::Authorization);
        let cseq = self.session.next_cseq();
        retry.set_cseq(cseq);
        credentials.apply(&mut retry);

        tracing::debug!(%method, scheme = %credentials.scheme(), cseq, "retrying with credentials");
        self.auth_retried.insert(cseq);
        self.credentials = Some(credentials);
        self.dispatch(retry);
    }

    fn on_unsuccess(&mut self, request: Request, response: Response) {
        if let Some(cseq) = request.cseq() {
            self.auth_retried.remove(&cseq);
        }
        match (request.method, response.status) {
            (Method::Options, status::NOT_IMPLEMENTED) => {
                if self.session.state == ClientState::Idle {
                    let describe = self.build(|b, ctx| b.describe(ctx));
                    self.dispatch(describe);
                }
            }
            (Method::Setup, status::UNSUPPORTED_TRANSPORT) => self.retry_setup(&request),
            (method, status) => {
                tracing::warn!(%method, status, "request failed");
                self.fail(ClientError::UnSuccess { method, status });
            }
        }
    }

    /// Answer a 461 by trying the other lower transport once.
    fn retry_setup(&mut self, request: &Request) {
        let failure = ClientError::UnSuccess {
            method: Method::Setup,
            status: status::UNSUPPORTED_TRANSPORT,
        };
        let Some(index) = self.session.stream_for_url(&request.url) else {
            self.fail(failure);
            return;
        };
        let requested_tcp = request
            .header(&Header::Transport)
            .and_then(|value| Transport::parse(value).ok())
            .is_some_and(|transport| transport.is_tcp());

        let transport = match (requested_tcp, self.config.try_tcp_first) {
            (true, true) => self.udp_transport(index),
            (false, false) if !self.config.is_interleaved() => {
                Transport::interleaved(self.session.next_tcp_channel())
            }
            _ => {
                self.fail(failure);
                return;
            }
        };
        tracing::info!(stream = index, transport = %transport, "transport refused, retrying SETUP");
        let url = request.url.clone();
        let setup = self.build(|b, ctx| b.setup(ctx, &url, &transport));
        self.dispatch(setup);
    }

    fn on_server_request(&mut self, request: Request) {
        let status = match request.method {
            Method::Announce => status::OK,
            _ => status::METHOD_NOT_ALLOWED,
        };
        let mut reply = Response::new(status);
        if let Some(cseq) = request.cseq() {
            reply.headers.insert(Header::CSeq, cseq.to_string());
        }
        if let Some(session) = request.header(&Header::Session) {
            reply.headers.insert(Header::Session, session);
        }
        self.sink.respond(reply);
    }

    // Streams

    fn prepare_streams(&mut self, streams: Vec<Arc<dyn SessionStream>>) {
        if self.session.playback != PlaybackState::Idle || self.closed {
            tracing::warn!(playback = ?self.session.playback, "streams already prepared");
            return;
        }
        self.session.preparing = (0..streams.len()).collect();
        self.session.streams = streams;
        if let Some(first) = self.session.preparing.pop_front() {
            self.prepare_stream(first);
        }
        self.session.playback = PlaybackState::Preparing;
    }

    fn prepare_stream(&mut self, index: usize) {
        let stream = self.session.streams[index].clone();
        let transport = if self.session.is_interleaved() || stream.track().format.transport.is_tcp()
        {
            Transport::interleaved(self.session.next_tcp_channel())
        } else {
            self.udp_transport(index)
        };
        stream.set_transport(transport);
        self.session.prepared.push(index);
        self.publish();
        stream.prepare();
    }

    /// UDP transport for the stream at `index`, with its `client_port`.
    fn udp_transport(&self, index: usize) -> Transport {
        let stream = &self.session.streams[index];
        let track = stream.track();
        let port = stream.local_port();

        let mut transport = track.format.transport.clone();
        transport.lower = LowerTransport::Udp;
        transport.interleaved = None;
        transport.client_port = Some(if !self.config.enable_rtcp {
            Pair::single(port)
        } else if self.config.force_rtcp_muxed || track.muxed || self.session.info.rtcp_muxed {
            Pair::new(port, port)
        } else {
            Pair::new(port, port.saturating_add(1))
        });
        transport
    }

    fn continue_prepare_stream(&mut self, index: usize) {
        let Some(stream) = self.session.streams.get(index).cloned() else {
            tracing::warn!(stream = index, "no such stream");
            return;
        };
        let url = stream.track().url.clone();
        let transport = stream.transport();
        let request = self.build(|b, ctx| b.setup(ctx, &url, &transport));
        self.dispatch(request);
    }

    fn continue_preparing(&mut self) {
        if self.session.playback != PlaybackState::Preparing {
            return;
        }
        if let Some(next) = self.session.preparing.pop_front() {
            self.prepare_stream(next);
            return;
        }

        self.session.playback = PlaybackState::Prepared;
        self.publish();
        for &index in &self.session.prepared {
            self.session.streams[index].playback();
        }
        let request = self.build(|b, ctx| b.play(ctx, Some(Range::from_start(0.0)), Some(1.0)));
        self.dispatch(request);
    }

    fn seek_to(&mut self, position: f64) {
        match self.session.playback {
            PlaybackState::Playing => {
                self.session.pending_reset = Some(position);
                let request = self.build(|b, ctx| b.pause(ctx));
                self.dispatch(request);
            }
            PlaybackState::Paused => {
                self.session.pending_reset = Some(position);
                let request =
                    self.build(|b, ctx| b.play(ctx, Some(Range::from_start(position)), None));
                self.dispatch(request);
            }
            other => tracing::debug!(playback = ?other, "seek ignored"),
        }
    }
}

/// Thread-safe handle to a client running on its own thread.
#[derive(Clone)]
pub struct ClientHandle {
    commands: ChannelSender<Command>,
    status: Arc<SessionStatus>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ClientHandle {
    /// Connect to `url` and start the method sequence.
    pub fn connect(url: &str, config: ClientConfig) -> Result<(Self, Receiver<ClientEvent>)> {
        config.validate()?;
        let (url, user_info) = presentation_url(url)?;
        let user = config.credentials.clone().or(user_info);
        let (dispatcher, dispatch_events) = Dispatcher::connect(&url, &config)?;
        Self::spawn(
            url,
            user,
            config,
            Box::new(dispatcher),
            Box::new(DefaultMethodBuilder),
            dispatch_events,
        )
    }

    /// Run a client over an existing sink and its event stream.
    pub fn spawn(
        url: Url,
        user: Option<UserInfo>,
        config: ClientConfig,
        sink: Box<dyn RequestSink>,
        builder: Box<dyn MethodBuilder>,
        dispatch_events: Receiver<DispatchEvent>,
    ) -> Result<(Self, Receiver<ClientEvent>)> {
        let (events_tx, events_rx) = unbounded();
        let (commands_tx, commands_rx) = unbounded();
        let (ticks_tx, ticks_rx) = unbounded();

        let client = Client::new(url, user, config, sink, builder, events_tx, ticks_tx);
        let status = client.status();
        let snapshot = client.snapshot();

        let worker = thread::Builder::new()
            .name("rtsp-client".into())
            .spawn(move || run(client, dispatch_events, commands_rx, ticks_rx))?;

        Ok((
            ClientHandle {
                commands: commands_tx,
                status,
                snapshot,
                worker: Arc::new(Mutex::new(Some(worker))),
            },
            events_rx,
        ))
    }

    /// Queue `command`. False once the client has stopped.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn prepare_streams(&self, streams: Vec<Arc<dyn SessionStream>>) -> bool {
        self.send(Command::PrepareStreams(streams))
    }

    pub fn continue_prepare_stream(&self, index: usize) -> bool {
        self.send(Command::ContinuePrepareStream(index))
    }

    pub fn pause(&self) -> bool {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(Command::Resume)
    }

    pub fn seek_to(&self, position_secs: f64) -> bool {
        self.send(Command::SeekTo(position_secs))
    }

    pub fn close(&self) -> bool {
        self.send(Command::Close)
    }

    pub fn status(&self) -> Arc<SessionStatus> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Stop all streams, close the session and wait for the actor.
    pub fn release(&self) {
        self.send(Command::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run(
    mut client: Client,
    dispatch: Receiver<DispatchEvent>,
    commands: Receiver<Command>,
    ticks: Receiver<()>,
) {
    client.open();
    while !client.is_closed() {
        select! {
            recv(dispatch) -> event => match event {
                Ok(event) => client.handle_event(event),
                Err(_) => client.close(),
            },
            recv(commands) -> command => match command {
                Ok(command) => client.handle_command(command),
                Err(_) => client.release(),
            },
            recv(ticks) -> _ => client.keep_alive(),
        }
    }
    // Late release after a failure still has streams to stop.
    while let Ok(command) = commands.try_recv() {
        if let Command::Release = command {
            client.release();
        }
    }
    tracing::debug!("client actor exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::media::track::{MediaFormat, MediaTrack, TrackType};
    use crate::protocol::message::{MediaType, MessageBody};
    use crate::protocol::InterleavedFrame;

    const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Camera\r\n\
t=0 0\r\n\
a=range:npt=0-30\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:track1\r\n\
m=audio 0 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=control:track2\r\n";

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Request>>>,
        replies: Arc<Mutex<Vec<Response>>>,
        closed: Arc<AtomicBool>,
    }

    impl RequestSink for Recorder {
        fn execute(&self, request: Request) {
            self.sent.lock().push(request);
        }

        fn respond(&self, response: Response) {
            self.replies.lock().push(response);
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    impl Recorder {
        fn last(&self) -> Request {
            self.sent.lock().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    struct FakeStream {
        track: MediaTrack,
        transport: Mutex<Transport>,
        port: u16,
        calls: Mutex<Vec<String>>,
        frames: Mutex<Vec<InterleavedFrame>>,
    }

    impl FakeStream {
        fn new(track: MediaTrack, port: u16) -> Arc<Self> {
            Arc::new(Self {
                transport: Mutex::new(track.format.transport.clone()),
                track,
                port,
                calls: Mutex::new(Vec::new()),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl SessionStream for FakeStream {
        fn track(&self) -> &MediaTrack {
            &self.track
        }

        fn transport(&self) -> Transport {
            self.transport.lock().clone()
        }

        fn set_transport(&self, transport: Transport) {
            *self.transport.lock() = transport;
        }

        fn local_port(&self) -> u16 {
            self.port
        }

        fn prepare(&self) {
            self.calls.lock().push("prepare".into());
        }

        fn playback(&self) {
            self.calls.lock().push("playback".into());
        }

        fn on_interleaved(&self, frame: InterleavedFrame) {
            self.frames.lock().push(frame);
        }

        fn on_playback(&self, notice: PlaybackNotice) {
            self.calls.lock().push(format!("{notice:?}"));
        }
    }

    struct Harness {
        client: Client,
        sink: Recorder,
        events: Receiver<ClientEvent>,
    }

    impl Harness {
        fn new(config: ClientConfig, user: Option<UserInfo>) -> Self {
            let sink = Recorder::default();
            let (events_tx, events) = unbounded();
            let (ticks, _) = unbounded();
            let url = Url::parse("rtsp://cam:554/live").unwrap();
            let client = Client::new(
                url,
                user,
                config,
                Box::new(sink.clone()),
                Box::new(DefaultMethodBuilder),
                events_tx,
                ticks,
            );
            Self {
                client,
                sink,
                events,
            }
        }

        fn ok(&mut self, response: Response) {
            let request = self.sink.last();
            let response = response.with_header(Header::CSeq, request.cseq().unwrap().to_string());
            self.client
                .handle_event(DispatchEvent::Response { request, response });
        }

        fn fail(&mut self, status: u16) {
            let request = self.sink.last();
            let response = Response::new(status)
                .with_header(Header::CSeq, request.cseq().unwrap().to_string());
            self.client
                .handle_event(DispatchEvent::UnSuccess { request, response });
        }

        fn described(config: ClientConfig) -> Self {
            let mut harness = Self::new(config, None);
            harness.client.open();
            harness.ok(Response::ok().with_header(Header::Public, "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN"));
            harness.ok(
                Response::ok()
                    .with_header(Header::ContentBase, "rtsp://cam:554/live/")
                    .with_body(MessageBody::new(MediaType::Sdp, SDP)),
            );
            harness
        }
    }

    fn track(url: &str, track_type: TrackType) -> MediaTrack {
        MediaTrack {
            url: url.to_string(),
            language: None,
            muxed: false,
            format: MediaFormat {
                track_type,
                transport: Transport::rtp_avp(),
                payload: None,
                bitrate_kbps: None,
            },
        }
    }

    #[test]
    fn options_then_describe_builds_tracks() {
        let mut harness = Harness::described(ClientConfig::default());

        let sent = harness.sink.sent.lock().clone();
        assert_eq!(sent[0].method, Method::Options);
        assert_eq!(sent[1].method, Method::Describe);
        assert_eq!(sent[1].header(&Header::Accept), Some("application/sdp"));
        assert!(sent[0].cseq() < sent[1].cseq());

        assert_eq!(
            harness.events.try_recv().unwrap(),
            ClientEvent::DescriptionRefreshed {
                duration_us: Some(30_000_000)
            }
        );
        let snapshot = harness.client.snapshot().read().clone();
        assert_eq!(snapshot.tracks.len(), 2);
        assert_eq!(snapshot.tracks[0].url, "rtsp://cam:554/live/track1");
        assert_eq!(snapshot.play_url, "rtsp://cam:554/live/");
        assert!(harness.client.session().supports(Method::Pause));
        harness.client.close();
    }

    #[test]
    fn scheduled_session_is_not_announced() {
        let scheduled = SDP.replace("t=0 0", "t=3034423619 3042462419");
        let mut harness = Harness::new(ClientConfig::default(), None);
        harness.client.open();
        harness.ok(Response::ok());
        harness.ok(Response::ok().with_body(MessageBody::new(MediaType::Sdp, scheduled)));

        assert!(harness.events.try_recv().is_err());
        assert!(harness.client.snapshot().read().tracks.is_empty());
        harness.client.close();
    }

    #[test]
    fn non_sdp_description_is_refused() {
        let mut harness = Harness::new(ClientConfig::default(), None);
        harness.client.open();
        harness.ok(Response::ok());
        harness.ok(Response::ok().with_body(MessageBody::new(
            MediaType::Other("text/html".into()),
            "<html/>",
        )));

        let reply = harness.sink.replies.lock()[0].clone();
        assert_eq!(reply.status, 415);
        assert_eq!(reply.header(&Header::Unsupported), Some("text/html"));
        assert!(harness.client.is_closed());
        assert_eq!(
            harness.events.try_recv().unwrap(),
            ClientEvent::MediaTypeUnsupported("text/html".into())
        );
    }

    #[test]
    fn setup_sequence_then_play() {
        let mut harness = Harness::described(ClientConfig::default());
        let video = FakeStream::new(track("rtsp://cam:554/live/track1", TrackType::Video), 50_000);
        let audio = FakeStream::new(track("rtsp://cam:554/live/track2", TrackType::Audio), 50_002);

        harness
            .client
            .handle_command(Command::PrepareStreams(vec![video.clone(), audio.clone()]));
        assert_eq!(video.calls(), ["prepare"]);
        assert!(audio.calls().is_empty());

        harness.client.handle_command(Command::ContinuePrepareStream(0));
        let setup = harness.sink.last();
        assert_eq!(setup.method, Method::Setup);
        assert_eq!(setup.url, "rtsp://cam:554/live/track1");
        assert_eq!(setup.header(&Header::Transport), Some("RTP/AVP;unicast;client_port=50000"));
        assert_eq!(harness.client.session().state, ClientState::Init);

        harness.ok(
            Response::ok()
                .with_header(Header::Session, "F00D;timeout=30")
                .with_header(Header::Transport, "RTP/AVP;unicast;client_port=50000;server_port=6970"),
        );
        assert_eq!(harness.client.session().state, ClientState::Ready);
        assert_eq!(harness.client.session().id.as_deref(), Some("F00D"));
        assert_eq!(audio.calls(), ["prepare"]);

        harness.client.handle_command(Command::ContinuePrepareStream(1));
        assert_eq!(harness.sink.last().header(&Header::Session), Some("F00D"));
        harness.ok(Response::ok().with_header(Header::Transport, "RTP/AVP;unicast;client_port=50002"));

        let play = harness.sink.last();
        assert_eq!(play.method, Method::Play);
        assert_eq!(play.url, "rtsp://cam:554/live/");
        assert_eq!(play.header(&Header::Range), Some("npt=0.000-"));
        assert_eq!(video.calls(), ["prepare", "playback"]);
        assert_eq!(audio.calls(), ["prepare", "playback"]);

        harness.ok(Response::ok());
        assert_eq!(harness.client.session().playback, PlaybackState::Playing);
        let events: Vec<_> = harness.events.try_iter().collect();
        assert!(events.contains(&ClientEvent::TransportNegotiated(LowerTransport::Udp)));
        assert!(!harness.client.status().is_in_fallback());
        harness.client.close();
    }

    #[test]
    fn unsupported_transport_retries_interleaved() {
        let mut harness = Harness::described(ClientConfig::default());
        let video = FakeStream::new(track("rtsp://cam:554/live/track1", TrackType::Video), 50_000);
        harness
            .client
            .handle_command(Command::PrepareStreams(vec![video.clone()]));
        harness.client.handle_command(Command::ContinuePrepareStream(0));

        harness.fail(461);
        let retry = harness.sink.last();
        assert_eq!(retry.method, Method::Setup);
        assert_eq!(
            retry.header(&Header::Transport),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1")
        );

        harness.ok(
            Response::ok()
                .with_header(Header::Session, "1")
                .with_header(Header::Transport, "RTP/AVP/TCP;unicast;interleaved=0-1"),
        );
        assert_eq!(video.calls(), ["prepare", "prepare", "playback"]);
        assert!(video.transport().is_tcp());
        assert!(harness.client.status().is_in_fallback());
        assert!(harness.client.status().is_interleaved());

        harness.client.handle_event(DispatchEvent::Interleaved(InterleavedFrame::new(0, vec![1])));
        harness.client.handle_event(DispatchEvent::Interleaved(InterleavedFrame::new(5, vec![2])));
        assert_eq!(video.frames.lock().len(), 1);

        // Keep-alive silence is tolerated on an interleaved session.
        let options = Request::new(Method::Options, "rtsp://cam:554/live");
        harness.client.handle_event(DispatchEvent::NoResponse(options));
        assert!(!harness.client.is_closed());
        harness.client.close();
    }

    #[test]
    fn second_unsupported_transport_fails() {
        let config = ClientConfig {
            mode: TransportMode::Interleaved,
            ..ClientConfig::default()
        };
        let mut harness = Harness::described(config);
        let video = FakeStream::new(track("rtsp://cam:554/live/track1", TrackType::Video), 50_000);
        harness
            .client
            .handle_command(Command::PrepareStreams(vec![video]));
        harness.client.handle_command(Command::ContinuePrepareStream(0));
        assert!(harness.sink.last().header(&Header::Transport).unwrap().contains("interleaved=0-1"));

        harness.fail(461);
        assert!(harness.client.is_closed());
        let events: Vec<_> = harness.events.try_iter().collect();
        assert!(events.contains(&ClientEvent::Error(ClientError::UnSuccess {
            method: Method::Setup,
            status: 461
        })));
    }

    #[test]
    fn unauthorized_is_retried_once() {
        let user = Some(("admin".to_string(), "secret".to_string()));
        let mut harness = Harness::new(ClientConfig::default(), user);
        harness.client.open();

        let challenge = |harness: &mut Harness| {
            let request = harness.sink.last();
            let mut response = Response::new(401)
                .with_header(Header::CSeq, request.cseq().unwrap().to_string());
            response.headers.append(Header::WwwAuthenticate, "Basic realm=\"cam\"");
            response
                .headers
                .append(Header::WwwAuthenticate, "Digest realm=\"cam\", nonce=\"n1\"");
            harness
                .client
                .handle_event(DispatchEvent::Unauthorized { request, response });
        };

        challenge(&mut harness);
        assert_eq!(harness.sink.count(), 2);
        let retry = harness.sink.last();
        assert_eq!(retry.method, Method::Options);
        assert_eq!(retry.cseq(), Some(2));
        assert!(retry.header(&Header::Authorization).unwrap().starts_with("Digest "));

        // Still refused: no second retry, and no fall back to Basic.
        challenge(&mut harness);
        assert_eq!(harness.sink.count(), 2);
        assert!(harness.client.is_closed());
        assert_eq!(
            harness.events.try_recv().unwrap(),
            ClientEvent::Error(ClientError::Unauthorized {
                method: Method::Options
            })
        );
    }

    #[test]
    fn credentials_sign_later_requests() {
        let user = Some(("admin".to_string(), "secret".to_string()));
        let mut harness = Harness::new(ClientConfig::default(), user);
        harness.client.open();
        let request = harness.sink.last();
        let response = Response::new(401)
            .with_header(Header::CSeq, "1")
            .with_header(Header::WwwAuthenticate, "Digest realm=\"cam\", nonce=\"abc\"");
        harness
            .client
            .handle_event(DispatchEvent::Unauthorized { request, response });
        harness.ok(Response::ok());

        let describe = harness.sink.last();
        assert_eq!(describe.method, Method::Describe);
        assert!(describe
            .header(&Header::Authorization)
            .unwrap()
            .starts_with("Digest username=\"admin\""));
        harness.client.close();
    }

    #[test]
    fn seek_while_playing_pauses_then_plays_from_position() {
        let mut harness = Harness::described(ClientConfig::default());
        let video = FakeStream::new(track("rtsp://cam:554/live/track1", TrackType::Video), 50_000);
        harness
            .client
            .handle_command(Command::PrepareStreams(vec![video.clone()]));
        harness.client.handle_command(Command::ContinuePrepareStream(0));
        harness.ok(Response::ok().with_header(Header::Session, "1"));
        harness.ok(Response::ok());

        harness.client.handle_command(Command::SeekTo(12.0));
        assert_eq!(harness.sink.last().method, Method::Pause);
        harness.ok(Response::ok());
        let play = harness.sink.last();
        assert_eq!(play.method, Method::Play);
        assert_eq!(play.header(&Header::Range), Some("npt=12.000-"));

        harness.ok(Response::ok());
        assert!(video.calls().contains(&"Seek".to_string()));
        assert_eq!(harness.client.session().pending_reset, None);

        harness.client.handle_command(Command::Pause);
        harness.ok(Response::ok());
        assert!(harness.client.status().is_paused());
        harness.client.handle_command(Command::Resume);
        assert_eq!(harness.sink.last().header(&Header::Range), None);
        harness.ok(Response::ok());
        assert!(video.calls().contains(&"Resume".to_string()));
        harness.client.close();
    }

    #[test]
    fn transport_failures_close_the_session() {
        let mut harness = Harness::new(ClientConfig::default(), None);
        harness.client.open();
        let describe = Request::new(Method::Describe, "rtsp://cam:554/live");
        harness.client.handle_event(DispatchEvent::NoResponse(describe));
        assert!(harness.client.is_closed());
        assert!(matches!(
            harness.events.try_recv().unwrap(),
            ClientEvent::Error(ClientError::NoResponse { method: Method::Describe, .. })
        ));
    }

    #[test]
    fn server_requests_are_answered() {
        let mut harness = Harness::new(ClientConfig::default(), None);
        let mut announce = Request::new(Method::Announce, "rtsp://cam:554/live");
        announce.set_cseq(3);
        harness.client.handle_event(DispatchEvent::Request(announce));
        let mut redirect = Request::new(Method::Redirect, "rtsp://cam:554/live");
        redirect.set_cseq(4);
        harness.client.handle_event(DispatchEvent::Request(redirect));

        let replies = harness.sink.replies.lock().clone();
        assert_eq!(replies[0].status, 200);
        assert_eq!(replies[0].cseq(), Some(3));
        assert_eq!(replies[1].status, 405);
    }

    #[test]
    fn release_stops_streams_and_tears_down() {
        let mut harness = Harness::described(ClientConfig::default());
        let video = FakeStream::new(track("rtsp://cam:554/live/track1", TrackType::Video), 50_000);
        harness
            .client
            .handle_command(Command::PrepareStreams(vec![video.clone()]));
        harness.client.handle_command(Command::ContinuePrepareStream(0));
        harness.ok(Response::ok().with_header(Header::Session, "1"));

        harness.client.handle_command(Command::Release);
        assert!(video.calls().contains(&"Stop".to_string()));
        let teardown = harness.sink.last();
        assert_eq!(teardown.method, Method::Teardown);
        assert_eq!(teardown.header(&Header::Session), Some("1"));
        assert!(harness.sink.closed.load(Ordering::SeqCst));
    }
}
