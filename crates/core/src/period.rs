//! One playable period over every negotiated track.
//!
//! A [`MediaPeriod`] builds a [`SampleStreamWrapper`] for the first video
//! and the first audio track of the session, hands them to the client for
//! SETUP, and aggregates their progress:
//!
//! - it is prepared once every loader has resolved prepare success or
//!   failure and at least one succeeded;
//! - buffered and next-load positions are the minimum over the prepared
//!   loaders, ignoring those that reached the end of the source;
//! - a loader that stops (complete, canceled, failed) is released and
//!   dropped; when none remain the session is closed and the period
//!   reports the last outcome.
//!
//! Loader events are handled on one thread so period state only ever
//! changes in one place.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::Mutex;

use crate::client::session::SessionStream;
use crate::client::{ClientConfig, ClientHandle};
use crate::error::{MediaError, Result};
use crate::fallback::FallbackPolicy;
use crate::loader::{LoaderEnv, LoaderEvent, SampleStreamWrapper};
use crate::media::extractor::{
    ExtractorFactory, Format, SampleQueue, SampleQueueAllocator, TIME_END_OF_SOURCE, TIME_UNSET,
};
use crate::media::track::{MediaTrack, TrackType};

/// A track exposed by one of the period's loaders.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackGroup {
    /// Index of the owning loader.
    pub stream: usize,
    /// Index of the track within that loader.
    pub index: usize,
    pub format: Format,
}

/// Opaque handle to a selected track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    stream: usize,
    index: usize,
}

/// Terminal and milestone notifications for the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodEvent {
    Prepared(Vec<TrackGroup>),
    LoadCompleted,
    LoadCanceled,
    LoadError(MediaError),
}

struct PeriodState {
    prepared_streams: Vec<Arc<SampleStreamWrapper>>,
    pending_prepare: usize,
    prepared: bool,
    track_groups: Vec<TrackGroup>,
    last_seek_us: i64,
    last_error: Option<MediaError>,
    released: bool,
}

struct Shared {
    client: ClientHandle,
    fallback: Arc<FallbackPolicy>,
    streams: Mutex<Vec<Arc<SampleStreamWrapper>>>,
    state: Mutex<PeriodState>,
    events: Sender<PeriodEvent>,
}

impl Shared {
    fn emit(&self, event: PeriodEvent) {
        let _ = self.events.send(event);
    }

    fn stream(&self, id: usize) -> Option<Arc<SampleStreamWrapper>> {
        self.streams.lock().get(id).cloned()
    }

    fn handle(&self, event: LoaderEvent) {
        tracing::trace!(?event, "loader event");
        match event {
            LoaderEvent::PrepareStarted(id) => {
                self.client.continue_prepare_stream(id);
            }
            LoaderEvent::PrepareSuccess(id) => {
                let mut state = self.state.lock();
                if let Some(stream) = self.stream(id) {
                    state.prepared_streams.push(stream);
                }
                self.resolve_prepare(state);
            }
            LoaderEvent::PrepareFailure(id, err) => {
                tracing::warn!(stream = id, error = %err, "stream failed to prepare");
                let mut state = self.state.lock();
                state.last_error = Some(err);
                self.resolve_prepare(state);
            }
            LoaderEvent::PlaybackComplete(id) => {
                if self.remove(id) {
                    tracing::info!("all streams complete");
                    self.emit(PeriodEvent::LoadCompleted);
                }
            }
            LoaderEvent::PlaybackCanceled(id) => {
                if self.remove(id) {
                    tracing::info!("all streams canceled");
                    self.emit(PeriodEvent::LoadCanceled);
                }
            }
            LoaderEvent::PlaybackFailure(id, err) => {
                // Read before `remove` closes the client and clears the status.
                let status = self.client.status();
                let interleaved = status.is_interleaved()
                    || status.is_in_fallback()
                    || self.stream(id).is_some_and(|stream| stream.transport().is_tcp());
                if self.remove(id) {
                    tracing::error!(error = %err, "all streams failed");
                    self.emit(PeriodEvent::LoadError(err.clone()));
                    if !interleaved {
                        self.fallback.retry_if_allowed(&err);
                    }
                }
            }
        }
    }

    /// Count down one resolved prepare and report the outcome after the
    /// last one.
    fn resolve_prepare(&self, mut state: parking_lot::MutexGuard<'_, PeriodState>) {
        state.pending_prepare = state.pending_prepare.saturating_sub(1);
        if state.pending_prepare > 0 || state.released {
            return;
        }
        if state.prepared_streams.is_empty() {
            let err = state
                .last_error
                .clone()
                .unwrap_or_else(|| MediaError::LoadFailed("no stream prepared".into()));
            drop(state);
            self.emit(PeriodEvent::LoadError(err));
            return;
        }

        let track_groups: Vec<TrackGroup> = state
            .prepared_streams
            .iter()
            .flat_map(|stream| {
                let id = stream.id();
                stream
                    .track_groups()
                    .into_iter()
                    .enumerate()
                    .map(move |(index, format)| TrackGroup {
                        stream: id,
                        index,
                        format,
                    })
            })
            .collect();
        state.track_groups = track_groups.clone();
        state.prepared = true;
        drop(state);

        tracing::info!(groups = track_groups.len(), "period prepared");
        self.emit(PeriodEvent::Prepared(track_groups));
    }

    /// Release a stopped stream. True when it was the last prepared one and
    /// the session was closed.
    fn remove(&self, id: usize) -> bool {
        let (removed, now_empty) = {
            let mut state = self.state.lock();
            let position = state.prepared_streams.iter().position(|s| s.id() == id);
            let removed = position.map(|index| state.prepared_streams.remove(index));
            let now_empty = removed.is_some() && state.prepared_streams.is_empty();
            if now_empty {
                state.prepared = false;
            }
            (removed, now_empty)
        };
        if let Some(stream) = removed {
            stream.release();
        }
        if now_empty {
            self.client.close();
        }
        now_empty
    }
}

/// Aggregate loader over the tracks of one session.
pub struct MediaPeriod {
    shared: Arc<Shared>,
    env: LoaderEnv,
    loader_events: Mutex<Option<Receiver<LoaderEvent>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl MediaPeriod {
    /// A period over `client`'s described session. Nothing is loaded until
    /// [`prepare`](Self::prepare).
    pub fn new(
        client: ClientHandle,
        config: Arc<ClientConfig>,
        fallback: Arc<FallbackPolicy>,
        allocator: Arc<dyn SampleQueueAllocator>,
        extractors: Arc<dyn ExtractorFactory>,
    ) -> (Self, Receiver<PeriodEvent>) {
        let (events_tx, events_rx) = unbounded();
        let (loader_tx, loader_rx) = unbounded();
        let env = LoaderEnv {
            config,
            status: client.status(),
            allocator,
            extractors,
            events: loader_tx,
        };
        let shared = Arc::new(Shared {
            client,
            fallback,
            streams: Mutex::new(Vec::new()),
            state: Mutex::new(PeriodState {
                prepared_streams: Vec::new(),
                pending_prepare: 0,
                prepared: false,
                track_groups: Vec::new(),
                last_seek_us: TIME_UNSET,
                last_error: None,
                released: false,
            }),
            events: events_tx,
        });
        let period = MediaPeriod {
            shared,
            env,
            loader_events: Mutex::new(Some(loader_rx)),
            shutdown: Mutex::new(None),
            handler: Mutex::new(None),
        };
        (period, events_rx)
    }

    /// Build the loaders and start preparing them from `position_us`.
    pub fn prepare(&self, position_us: i64) -> Result<()> {
        let Some(loader_events) = self.loader_events.lock().take() else {
            tracing::warn!("period already prepared");
            return Ok(());
        };

        let tracks = self.shared.client.snapshot().tracks;
        let streams: Vec<Arc<SampleStreamWrapper>> = select_tracks_to_load(&tracks)
            .into_iter()
            .enumerate()
            .map(|(id, track)| {
                Arc::new(SampleStreamWrapper::new(
                    id,
                    track.clone(),
                    position_us,
                    self.env.clone(),
                ))
            })
            .collect();

        if streams.is_empty() {
            self.shared.emit(PeriodEvent::LoadError(MediaError::UnsupportedFormat(
                "no audio or video track".into(),
            )));
            return Ok(());
        }

        self.shared.state.lock().pending_prepare = streams.len();
        *self.shared.streams.lock() = streams.clone();

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let shared = self.shared.clone();
        let handler = thread::Builder::new()
            .name("rtsp-period".into())
            .spawn(move || run(shared, loader_events, shutdown_rx))?;
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.handler.lock() = Some(handler);

        tracing::debug!(streams = streams.len(), position_us, "preparing period");
        let streams: Vec<Arc<dyn SessionStream>> = streams
            .into_iter()
            .map(|stream| stream as Arc<dyn SessionStream>)
            .collect();
        self.shared.client.prepare_streams(streams);
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.shared.state.lock().prepared
    }

    pub fn track_groups(&self) -> Vec<TrackGroup> {
        self.shared.state.lock().track_groups.clone()
    }

    /// Enable exactly the track groups at `selections` (indices into
    /// [`track_groups`](Self::track_groups)) and return a handle for each.
    /// An out-of-range index yields `None`.
    pub fn select_tracks(&self, selections: &[usize]) -> Vec<Option<StreamHandle>> {
        let state = self.shared.state.lock();
        if !state.prepared {
            tracing::warn!("select_tracks before the period is prepared");
            return vec![None; selections.len()];
        }

        for (position, group) in state.track_groups.iter().enumerate() {
            let enabled = selections.contains(&position);
            if let Some(stream) = state
                .prepared_streams
                .iter()
                .find(|stream| stream.id() == group.stream)
            {
                stream.set_track_enabled(group.index, enabled);
            }
        }

        selections
            .iter()
            .map(|&position| {
                state.track_groups.get(position).map(|group| StreamHandle {
                    stream: group.stream,
                    index: group.index,
                })
            })
            .collect()
    }

    fn owner(&self, handle: StreamHandle) -> Option<Arc<SampleStreamWrapper>> {
        self.shared
            .state
            .lock()
            .prepared_streams
            .iter()
            .find(|stream| stream.id() == handle.stream)
            .cloned()
    }

    pub fn queue(&self, handle: StreamHandle) -> Option<Arc<dyn SampleQueue>> {
        self.owner(handle)?.queue(handle.index)
    }

    pub fn is_ready(&self, handle: StreamHandle) -> bool {
        self.owner(handle)
            .is_some_and(|stream| stream.is_ready(handle.index))
    }

    fn prepared_streams(&self) -> Vec<Arc<SampleStreamWrapper>> {
        self.shared.state.lock().prepared_streams.clone()
    }

    pub fn buffered_position_us(&self) -> i64 {
        min_position(
            self.prepared_streams()
                .iter()
                .map(|stream| stream.buffered_position_us()),
        )
    }

    pub fn next_load_position_us(&self) -> i64 {
        min_position(
            self.prepared_streams()
                .iter()
                .map(|stream| stream.next_load_position_us()),
        )
    }

    pub fn continue_loading(&self, position_us: i64) -> bool {
        self.prepared_streams()
            .iter()
            .fold(false, |any, stream| stream.continue_loading(position_us) | any)
    }

    pub fn is_loading(&self) -> bool {
        self.prepared_streams().iter().any(|stream| stream.is_loading())
    }

    pub fn discard_buffer(&self, position_us: i64, to_keyframe: bool) {
        for stream in self.prepared_streams() {
            stream.discard_buffer(position_us, to_keyframe);
        }
    }

    /// Seek every loader. Loaders that cannot serve the position from their
    /// buffers are reset and the server is asked to play from there.
    pub fn seek_to_us(&self, position_us: i64) -> i64 {
        let mut state = self.shared.state.lock();
        if state.last_seek_us == position_us {
            return position_us;
        }
        state.last_seek_us = position_us;
        let streams = state.prepared_streams.clone();
        drop(state);

        let Some(first) = streams.first() else {
            return position_us;
        };
        let force_reset = first.seek_to_us(position_us, false);
        let needs_reset = streams.iter().fold(false, |any, stream| {
            stream.seek_to_us(position_us, force_reset) | any
        });
        if needs_reset {
            tracing::debug!(position_us, "seeking server");
            self.shared.client.seek_to(position_us as f64 / 1_000_000.0);
        }
        position_us
    }

    pub fn pause(&self) -> bool {
        self.shared.client.pause()
    }

    pub fn resume(&self) -> bool {
        self.shared.client.resume()
    }

    /// Release every loader and close the session.
    pub fn release(&self) {
        self.shared.state.lock().released = true;
        let streams = self.shared.streams.lock().clone();
        for stream in &streams {
            stream.release();
        }
        self.shared.client.close();

        self.shutdown.lock().take();
        if let Some(handler) = self.handler.lock().take() {
            if handler.thread().id() != thread::current().id() && handler.join().is_err() {
                tracing::warn!("period handler panicked");
            }
        }
        tracing::debug!("period released");
    }
}

impl Drop for MediaPeriod {
    fn drop(&mut self) {
        self.release();
    }
}

fn run(shared: Arc<Shared>, loader_events: Receiver<LoaderEvent>, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(loader_events) -> event => match event {
                Ok(event) => shared.handle(event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}

/// The first video and the first audio track.
fn select_tracks_to_load(tracks: &[MediaTrack]) -> Vec<&MediaTrack> {
    [TrackType::Video, TrackType::Audio]
        .into_iter()
        .filter_map(|kind| tracks.iter().find(|track| track.track_type() == kind))
        .collect()
}

/// Smallest position that is not the end of the source, or the end of the
/// source when every loader reached it.
fn min_position(positions: impl Iterator<Item = i64>) -> i64 {
    positions
        .filter(|&position| position != TIME_END_OF_SOURCE)
        .min()
        .unwrap_or(TIME_END_OF_SOURCE)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::RwLock;
    use url::Url;

    use super::*;
    use crate::client::builder::DefaultMethodBuilder;
    use crate::client::config::TransportMode;
    use crate::client::dispatcher::RequestSink;
    use crate::media::extractor::DefaultExtractorFactory;
    use crate::media::queue::BufferedQueueAllocator;
    use crate::media::track::MediaFormat;
    use crate::protocol::{Request, Response, Transport};
    use crate::source::SourceEvent;

    struct NullSink;

    impl RequestSink for NullSink {
        fn execute(&self, _request: Request) {}

        fn respond(&self, _response: Response) {}

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    struct Fixture {
        period: MediaPeriod,
        events: Receiver<PeriodEvent>,
        source_events: Receiver<SourceEvent>,
        config: Arc<RwLock<ClientConfig>>,
        _dispatch: Sender<crate::client::dispatcher::DispatchEvent>,
    }

    fn fixture() -> Fixture {
        let (dispatch_tx, dispatch_rx) = unbounded();
        let (client, _client_events) = ClientHandle::spawn(
            Url::parse("rtsp://127.0.0.1/live").unwrap(),
            None,
            ClientConfig::default(),
            Box::new(NullSink),
            Box::new(DefaultMethodBuilder),
            dispatch_rx,
        )
        .unwrap();
        let config = Arc::new(RwLock::new(ClientConfig::default()));
        let (source_tx, source_events) = unbounded();
        let fallback = Arc::new(FallbackPolicy::new(config.clone(), source_tx));
        let (period, events) = MediaPeriod::new(
            client,
            Arc::new(ClientConfig::default()),
            fallback,
            Arc::new(BufferedQueueAllocator::default()),
            Arc::new(DefaultExtractorFactory),
        );
        Fixture {
            period,
            events,
            source_events,
            config,
            _dispatch: dispatch_tx,
        }
    }

    fn track(url: &str, track_type: TrackType) -> MediaTrack {
        MediaTrack {
            url: url.into(),
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

    /// Install two unstarted loaders as if `prepare` had built them.
    fn install_streams(f: &Fixture) {
        let streams: Vec<_> = [TrackType::Video, TrackType::Audio]
            .into_iter()
            .enumerate()
            .map(|(id, kind)| {
                Arc::new(SampleStreamWrapper::new(
                    id,
                    track(&format!("rtsp://127.0.0.1/live/track{id}"), kind),
                    0,
                    f.period.env.clone(),
                ))
            })
            .collect();
        f.period.shared.state.lock().pending_prepare = streams.len();
        *f.period.shared.streams.lock() = streams;
    }

    fn next(events: &Receiver<PeriodEvent>) -> PeriodEvent {
        events.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn loads_first_video_and_first_audio() {
        let tracks = vec![
            track("a1", TrackType::Audio),
            track("v1", TrackType::Video),
            track("a2", TrackType::Audio),
            track("t1", TrackType::Text),
            track("v2", TrackType::Video),
        ];
        let chosen: Vec<&str> = select_tracks_to_load(&tracks)
            .iter()
            .map(|t| t.url.as_str())
            .collect();
        assert_eq!(chosen, vec!["v1", "a1"]);
    }

    #[test]
    fn min_position_skips_finished_loaders() {
        assert_eq!(min_position([5, TIME_END_OF_SOURCE, 3].into_iter()), 3);
        assert_eq!(
            min_position([TIME_END_OF_SOURCE, TIME_END_OF_SOURCE].into_iter()),
            TIME_END_OF_SOURCE
        );
        assert_eq!(min_position(std::iter::empty()), TIME_END_OF_SOURCE);
    }

    #[test]
    fn one_success_is_enough_to_prepare() {
        let f = fixture();
        install_streams(&f);
        let shared = &f.period.shared;

        shared.handle(LoaderEvent::PrepareFailure(
            1,
            MediaError::UnsupportedFormat("x".into()),
        ));
        assert!(f.events.try_recv().is_err());
        shared.handle(LoaderEvent::PrepareSuccess(0));

        assert_eq!(next(&f.events), PeriodEvent::Prepared(Vec::new()));
        assert!(f.period.is_prepared());
    }

    #[test]
    fn all_failures_report_load_error() {
        let f = fixture();
        install_streams(&f);
        let shared = &f.period.shared;

        shared.handle(LoaderEvent::PrepareFailure(0, MediaError::LoadCanceled));
        shared.handle(LoaderEvent::PrepareFailure(
            1,
            MediaError::UnsupportedProtocol("udp".into()),
        ));
        assert_eq!(
            next(&f.events),
            PeriodEvent::LoadError(MediaError::UnsupportedProtocol("udp".into()))
        );
        assert!(!f.period.is_prepared());
    }

    #[test]
    fn last_timeout_failure_requests_one_fallback() {
        let f = fixture();
        install_streams(&f);
        let shared = &f.period.shared;
        shared.handle(LoaderEvent::PrepareSuccess(0));
        shared.handle(LoaderEvent::PrepareSuccess(1));
        assert!(matches!(next(&f.events), PeriodEvent::Prepared(_)));

        shared.handle(LoaderEvent::PlaybackFailure(0, MediaError::LoadTimeout));
        assert!(f.events.try_recv().is_err());
        shared.handle(LoaderEvent::PlaybackFailure(1, MediaError::LoadTimeout));

        assert_eq!(next(&f.events), PeriodEvent::LoadError(MediaError::LoadTimeout));
        assert!(matches!(
            f.source_events.recv_timeout(Duration::from_secs(1)),
            Ok(SourceEvent::FallbackRestart)
        ));
        assert_eq!(f.config.read().mode, TransportMode::Interleaved);
    }

    #[test]
    fn interleaved_timeout_does_not_fall_back() {
        let f = fixture();
        install_streams(&f);
        let shared = &f.period.shared;
        // A TCP-first session whose SETUP was accepted interleaved.
        for stream in shared.streams.lock().iter() {
            stream.set_transport(Transport::interleaved(0));
        }
        shared.handle(LoaderEvent::PrepareSuccess(0));
        shared.handle(LoaderEvent::PrepareSuccess(1));
        assert!(matches!(next(&f.events), PeriodEvent::Prepared(_)));

        shared.handle(LoaderEvent::PlaybackFailure(0, MediaError::LoadTimeout));
        shared.handle(LoaderEvent::PlaybackFailure(1, MediaError::LoadTimeout));

        assert_eq!(next(&f.events), PeriodEvent::LoadError(MediaError::LoadTimeout));
        assert!(f.source_events.try_recv().is_err());
        assert_eq!(f.config.read().mode, TransportMode::AutoDetect);
    }

    #[test]
    fn completion_of_every_stream_completes_the_period() {
        let f = fixture();
        install_streams(&f);
        let shared = &f.period.shared;
        shared.handle(LoaderEvent::PrepareSuccess(0));
        shared.handle(LoaderEvent::PrepareSuccess(1));
        assert!(matches!(next(&f.events), PeriodEvent::Prepared(_)));

        shared.handle(LoaderEvent::PlaybackCanceled(1));
        shared.handle(LoaderEvent::PlaybackComplete(0));
        assert_eq!(next(&f.events), PeriodEvent::LoadCompleted);
        assert!(f.source_events.try_recv().is_err());
        assert_eq!(f.period.buffered_position_us(), TIME_END_OF_SOURCE);
    }

    #[test]
    fn select_tracks_requires_prepare() {
        let f = fixture();
        assert_eq!(f.period.select_tracks(&[0]), vec![None]);
    }
}
