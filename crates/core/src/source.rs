//! The media source a playback engine drives.
//!
//! [`RtspMediaSource`] owns the client for one presentation URL. It turns
//! client events into [`SourceEvent`]s (timeline, negotiated transport,
//! errors), creates [`MediaPeriod`]s over the described session, and holds
//! the [`FallbackPolicy`] that can restart it over TCP.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::client::{ClientConfig, ClientEvent, ClientHandle};
use crate::error::{ClientError, Result, RtspError};
use crate::fallback::FallbackPolicy;
use crate::media::extractor::{ExtractorFactory, SampleQueueAllocator};
use crate::period::{MediaPeriod, PeriodEvent};
use crate::protocol::LowerTransport;

/// Single-period timeline of a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    /// `None` for live sessions.
    pub duration_us: Option<i64>,
    pub seekable: bool,
    pub dynamic: bool,
    pub live: bool,
}

impl Timeline {
    pub fn new(duration_us: Option<i64>, live: bool) -> Self {
        Timeline {
            duration_us,
            seekable: duration_us.is_some(),
            dynamic: duration_us.is_none() || live,
            live,
        }
    }
}

/// Notifications for the engine driving the source.
#[derive(Debug)]
pub enum SourceEvent {
    TimelineRefreshed(Timeline),
    TransportNegotiated(LowerTransport),
    LoadError(RtspError),
    /// The fallback policy switched transports; call
    /// [`RtspMediaSource::restart`] after releasing the current period.
    FallbackRestart,
}

pub struct RtspMediaSource {
    url: String,
    live: bool,
    config: Arc<RwLock<ClientConfig>>,
    fallback: Arc<FallbackPolicy>,
    client: Mutex<Option<ClientHandle>>,
    timeline: Arc<RwLock<Option<Timeline>>>,
    transport: Arc<RwLock<Option<LowerTransport>>>,
    events: Sender<SourceEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl RtspMediaSource {
    pub fn new(
        url: impl Into<String>,
        config: ClientConfig,
        live: bool,
    ) -> (Self, Receiver<SourceEvent>) {
        let (events_tx, events_rx) = unbounded();
        let config = Arc::new(RwLock::new(config));
        let fallback = Arc::new(FallbackPolicy::new(config.clone(), events_tx.clone()));
        let source = RtspMediaSource {
            url: url.into(),
            live,
            config,
            fallback,
            client: Mutex::new(None),
            timeline: Arc::new(RwLock::new(None)),
            transport: Arc::new(RwLock::new(None)),
            events: events_tx,
            forwarder: Mutex::new(None),
        };
        (source, events_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Connect and start describing the presentation. A failure to connect
    /// is reported as [`SourceEvent::LoadError`].
    pub fn prepare(&self) {
        let config = self.config.read().clone();
        let (client, client_events) = match ClientHandle::connect(&self.url, config) {
            Ok(connected) => connected,
            Err(err) => {
                tracing::error!(url = %self.url, error = %err, "cannot open source");
                let _ = self.events.send(SourceEvent::LoadError(err));
                return;
            }
        };
        tracing::info!(url = %self.url, "source opened");

        let forward = Forwarder {
            live: self.live,
            timeline: self.timeline.clone(),
            transport: self.transport.clone(),
            events: self.events.clone(),
        };
        match thread::Builder::new()
            .name("rtsp-source".into())
            .spawn(move || forward.run(client_events))
        {
            Ok(forwarder) => *self.forwarder.lock() = Some(forwarder),
            Err(err) => {
                client.release();
                let _ = self.events.send(SourceEvent::LoadError(err.into()));
                return;
            }
        }
        *self.client.lock() = Some(client);
    }

    /// The timeline once the presentation has been described.
    pub fn timeline(&self) -> Option<Timeline> {
        *self.timeline.read()
    }

    pub fn is_on_tcp(&self) -> bool {
        *self.transport.read() == Some(LowerTransport::Tcp)
    }

    pub fn config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    pub fn fallback(&self) -> &FallbackPolicy {
        &self.fallback
    }

    pub fn client(&self) -> Option<ClientHandle> {
        self.client.lock().clone()
    }

    /// A period over the described session. Call
    /// [`MediaPeriod::prepare`] to start loading.
    pub fn create_period(
        &self,
        allocator: Arc<dyn SampleQueueAllocator>,
        extractors: Arc<dyn ExtractorFactory>,
    ) -> Result<(MediaPeriod, Receiver<PeriodEvent>)> {
        let client = self.client().ok_or(RtspError::Closed)?;
        let config = Arc::new(self.config.read().clone());
        Ok(MediaPeriod::new(
            client,
            config,
            self.fallback.clone(),
            allocator,
            extractors,
        ))
    }

    pub fn release_period(&self, period: MediaPeriod) {
        period.release();
    }

    /// Tear the client down and connect again with the current
    /// configuration.
    pub fn restart(&self) {
        tracing::info!(url = %self.url, mode = ?self.config.read().mode, "restarting source");
        self.release();
        self.prepare();
    }

    pub fn release(&self) {
        if let Some(client) = self.client.lock().take() {
            client.release();
        }
        if let Some(forwarder) = self.forwarder.lock().take() {
            if forwarder.join().is_err() {
                tracing::warn!("source event forwarder panicked");
            }
        }
        *self.timeline.write() = None;
        *self.transport.write() = None;
    }
}

impl Drop for RtspMediaSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps client events onto source events until the client stops.
struct Forwarder {
    live: bool,
    timeline: Arc<RwLock<Option<Timeline>>>,
    transport: Arc<RwLock<Option<LowerTransport>>>,
    events: Sender<SourceEvent>,
}

impl Forwarder {
    fn run(self, client_events: Receiver<ClientEvent>) {
        for event in client_events.iter() {
            let event = match event {
                ClientEvent::DescriptionRefreshed { duration_us } => {
                    let timeline = Timeline::new(duration_us, self.live);
                    *self.timeline.write() = Some(timeline);
                    SourceEvent::TimelineRefreshed(timeline)
                }
                ClientEvent::MediaTypeUnsupported(media_type) => SourceEvent::LoadError(
                    ClientError::UnsupportedMediaType(media_type).into(),
                ),
                ClientEvent::TransportNegotiated(lower) => {
                    *self.transport.write() = Some(lower);
                    SourceEvent::TransportNegotiated(lower)
                }
                ClientEvent::Error(err) => SourceEvent::LoadError(err.into()),
            };
            if self.events.send(event).is_err() {
                break;
            }
        }
        tracing::debug!("source event forwarder exited");
    }
}
