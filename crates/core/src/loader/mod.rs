//! Per-track stream loaders.
//!
//! A [`SampleStreamWrapper`] owns everything needed to load one negotiated
//! track: the data source for its transport, the extractor over that
//! source, and the sample queues the extractor writes into. Loading runs on
//! a dedicated thread and reports progress to the period as
//! [`LoaderEvent`]s.
//!
//! ```text
//! Idle --prepare--> Opening --source open--> PreparePending
//! PreparePending --playback + formats known--> Prepared --first sample--> Loading
//! Loading <--pause/resume--> Paused
//! any --cancel--> Canceled | --error--> Failed | --end of input--> Complete
//! ```

pub mod condition;
mod loadable;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::client::config::{ClientConfig, UDP_PORT_RANGE};
use crate::client::session::{PlaybackNotice, SessionStatus, SessionStream};
use crate::error::MediaError;
use crate::media::extractor::{
    ExtractorFactory, Format, SampleQueue, SampleQueueAllocator, TIME_END_OF_SOURCE, TIME_UNSET,
};
use crate::media::track::MediaTrack;
use crate::protocol::{InterleavedFrame, Transport};

pub use condition::{LoadCondition, Wake};

/// Progress reports from a loader, tagged with the stream index.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// The source is open; SETUP may be sent for this stream.
    PrepareStarted(usize),
    /// Every track of the stream has a known format.
    PrepareSuccess(usize),
    PrepareFailure(usize, MediaError),
    PlaybackComplete(usize),
    PlaybackCanceled(usize),
    PlaybackFailure(usize, MediaError),
}

/// Lifecycle of one loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoaderState {
    #[default]
    Idle,
    Opening,
    PreparePending,
    Prepared,
    Loading,
    Paused,
    Canceled,
    Failed,
    Complete,
}

impl LoaderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Complete)
    }
}

/// What a loader shares with the rest of the period.
#[derive(Clone)]
pub struct LoaderEnv {
    pub config: Arc<ClientConfig>,
    pub status: Arc<SessionStatus>,
    pub allocator: Arc<dyn SampleQueueAllocator>,
    pub extractors: Arc<dyn ExtractorFactory>,
    pub events: Sender<LoaderEvent>,
}

#[derive(Default)]
struct State {
    phase: LoaderState,
    prepared: bool,
    /// Formats are known and the period was told.
    playback: bool,
    loading_finished: bool,
    released: bool,
    queues: Vec<Arc<dyn SampleQueue>>,
    /// Extractor track id of each queue.
    queue_ids: Vec<u32>,
    enabled: Vec<bool>,
    queues_built: bool,
    track_groups: Vec<Format>,
    last_seek_us: i64,
}

struct Inner {
    id: usize,
    track: MediaTrack,
    local_port: u16,
    env: LoaderEnv,
    transport: Mutex<Transport>,
    condition: LoadCondition,
    state: Mutex<State>,
    pending_reset_us: AtomicI64,
    loading: AtomicBool,
    interrupt: Arc<AtomicBool>,
    /// Reopen the source with the current transport once the load unwinds.
    reopen: AtomicBool,
    /// Apply the pending reset on the loader thread.
    seek_load: AtomicBool,
    feed: Mutex<Option<Sender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn post(&self, event: LoaderEvent) {
        if self.env.events.send(event).is_err() {
            tracing::trace!(stream = self.id, "period gone, loader event dropped");
        }
    }

    fn transport(&self) -> Transport {
        self.transport.lock().clone()
    }

    fn is_released(&self) -> bool {
        self.state.lock().released
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    fn pending_reset_us(&self) -> Option<i64> {
        let position = self.pending_reset_us.load(Ordering::Acquire);
        (position != TIME_UNSET).then_some(position)
    }

    fn set_phase(&self, phase: LoaderState) {
        self.state.lock().phase = phase;
    }

    fn advance(&self, from: LoaderState, to: LoaderState) {
        let mut state = self.state.lock();
        if state.phase == from {
            state.phase = to;
        }
    }

    fn cancel_load(&self) {
        self.interrupt.store(true, Ordering::Release);
        self.condition.request_reset();
    }

    /// Report prepare success once every queue knows its format.
    fn maybe_finish_prepare(&self) {
        let mut state = self.state.lock();
        if state.released || !state.prepared || state.playback || !state.queues_built {
            return;
        }
        let Some(formats) = state
            .queues
            .iter()
            .map(|queue| queue.upstream_format())
            .collect::<Option<Vec<_>>>()
        else {
            return;
        };

        self.condition.close();
        state.track_groups = formats;
        state.playback = true;
        state.phase = LoaderState::Prepared;
        drop(state);

        tracing::debug!(stream = self.id, "stream prepared");
        self.post(LoaderEvent::PrepareSuccess(self.id));
    }
}

/// Loader for one negotiated track.
pub struct SampleStreamWrapper {
    inner: Arc<Inner>,
}

impl SampleStreamWrapper {
    /// A loader advertising a random even port from the UDP range.
    pub fn new(id: usize, track: MediaTrack, start_position_us: i64, env: LoaderEnv) -> Self {
        let span = (UDP_PORT_RANGE.end - UDP_PORT_RANGE.start) / 2;
        let port = UDP_PORT_RANGE.start + (rand::random::<u16>() % span) * 2;
        Self::with_local_port(id, track, port, start_position_us, env)
    }

    pub fn with_local_port(
        id: usize,
        track: MediaTrack,
        local_port: u16,
        start_position_us: i64,
        env: LoaderEnv,
    ) -> Self {
        let transport = track.format.transport.clone();
        SampleStreamWrapper {
            inner: Arc::new(Inner {
                id,
                track,
                local_port,
                env,
                transport: Mutex::new(transport),
                condition: LoadCondition::new(),
                state: Mutex::new(State {
                    last_seek_us: start_position_us,
                    ..State::default()
                }),
                pending_reset_us: AtomicI64::new(TIME_UNSET),
                loading: AtomicBool::new(false),
                interrupt: Arc::new(AtomicBool::new(false)),
                reopen: AtomicBool::new(false),
                seek_load: AtomicBool::new(false),
                feed: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn state(&self) -> LoaderState {
        self.inner.state.lock().phase
    }

    pub fn is_prepared(&self) -> bool {
        self.inner.state.lock().playback
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire)
    }

    pub fn is_loading_finished(&self) -> bool {
        self.inner.state.lock().loading_finished
    }

    /// Formats of the tracks this stream exposes, one per queue.
    pub fn track_groups(&self) -> Vec<Format> {
        self.inner.state.lock().track_groups.clone()
    }

    pub fn queues(&self) -> Vec<Arc<dyn SampleQueue>> {
        self.inner.state.lock().queues.clone()
    }

    pub fn queue(&self, group: usize) -> Option<Arc<dyn SampleQueue>> {
        self.inner.state.lock().queues.get(group).cloned()
    }

    pub fn set_track_enabled(&self, group: usize, enabled: bool) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.enabled.get_mut(group) {
            *slot = enabled;
        }
    }

    pub fn is_ready(&self, group: usize) -> bool {
        if self.inner.pending_reset_us().is_some() {
            return false;
        }
        let state = self.inner.state.lock();
        state
            .queues
            .get(group)
            .is_some_and(|queue| queue.is_ready(state.loading_finished))
    }

    /// Let a loader that is waiting for playback start loading. False when
    /// there is nothing left to load.
    pub fn continue_loading(&self, _position_us: i64) -> bool {
        let state = self.inner.state.lock();
        if state.loading_finished || !state.prepared {
            return false;
        }
        if self.is_loading() && !state.playback {
            self.inner.condition.open();
        }
        true
    }

    /// Seek the queues to `position_us`. Returns true when the buffers could
    /// not serve the position and a reset is now pending.
    pub fn seek_to_us(&self, position_us: i64, force_reset: bool) -> bool {
        let mut state = self.inner.state.lock();
        state.last_seek_us = position_us;
        if self.inner.pending_reset_us().is_some() {
            self.inner
                .pending_reset_us
                .store(position_us, Ordering::Release);
            return true;
        }
        if state.queues_built
            && !force_reset
            && state
                .queues
                .iter()
                .all(|queue| queue.seek_to(position_us, false))
        {
            return false;
        }

        for queue in &state.queues {
            queue.reset();
        }
        self.inner
            .pending_reset_us
            .store(position_us, Ordering::Release);
        true
    }

    pub fn buffered_position_us(&self) -> i64 {
        let state = self.inner.state.lock();
        if state.loading_finished {
            return TIME_END_OF_SOURCE;
        }
        if let Some(position) = self.inner.pending_reset_us() {
            return position;
        }
        let largest = state
            .queues
            .iter()
            .zip(&state.enabled)
            .filter(|(_, enabled)| **enabled)
            .map(|(queue, _)| queue.largest_queued_timestamp_us())
            .min();
        match largest {
            None | Some(i64::MIN) | Some(i64::MAX) => state.last_seek_us,
            Some(position) => position,
        }
    }

    pub fn next_load_position_us(&self) -> i64 {
        if let Some(position) = self.inner.pending_reset_us() {
            return position;
        }
        if self.is_loading_finished() {
            return TIME_END_OF_SOURCE;
        }
        self.buffered_position_us()
    }

    pub fn discard_buffer(&self, position_us: i64, to_keyframe: bool) {
        let state = self.inner.state.lock();
        for (queue, enabled) in state.queues.iter().zip(&state.enabled) {
            if *enabled {
                queue.discard_to(position_us, to_keyframe);
            }
        }
    }

    /// Stop loading for good and drop buffered samples. Blocks until the
    /// loader thread has exited.
    pub fn release(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            if state.prepared {
                for queue in &state.queues {
                    queue.discard_to_end();
                }
            }
        }
        if self.is_loading() {
            self.inner.cancel_load();
        }
        self.inner.condition.release();

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                tracing::warn!(stream = self.inner.id, "loader thread panicked");
            }
        }
        *self.inner.feed.lock() = None;
        tracing::debug!(stream = self.inner.id, "stream released");
    }

    fn start(&self) {
        self.inner.loading.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("rtsp-loader-{}", self.inner.id))
            .spawn(move || loadable::run(inner));
        match spawned {
            Ok(worker) => *self.inner.worker.lock() = Some(worker),
            Err(e) => {
                self.inner.loading.store(false, Ordering::Release);
                self.inner.set_phase(LoaderState::Failed);
                self.inner.post(LoaderEvent::PrepareFailure(
                    self.inner.id,
                    MediaError::LoadFailed(e.to_string()),
                ));
            }
        }
    }
}

impl SessionStream for SampleStreamWrapper {
    fn track(&self) -> &MediaTrack {
        &self.inner.track
    }

    fn transport(&self) -> Transport {
        self.inner.transport()
    }

    fn set_transport(&self, transport: Transport) {
        *self.inner.transport.lock() = transport;
    }

    fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    fn prepare(&self) {
        let mut state = self.inner.state.lock();
        if state.loading_finished || state.released {
            return;
        }
        if !state.prepared {
            state.prepared = true;
            state.phase = LoaderState::Opening;
            drop(state);
            self.start();
        } else if self.is_loading() {
            drop(state);
            tracing::debug!(stream = self.inner.id, "reopening with new transport");
            self.inner.reopen.store(true, Ordering::Release);
            self.inner.cancel_load();
        }
    }

    fn playback(&self) {
        let last_seek_us = {
            let state = self.inner.state.lock();
            if state.loading_finished || !state.prepared || state.playback {
                return;
            }
            state.last_seek_us
        };
        self.continue_loading(last_seek_us);
    }

    fn on_interleaved(&self, frame: InterleavedFrame) {
        {
            let state = self.inner.state.lock();
            if !state.prepared || state.loading_finished {
                return;
            }
        }
        let Some(channels) = self.inner.transport.lock().interleaved else {
            return;
        };
        if frame.channel == channels.first {
            if let Some(feed) = self.inner.feed.lock().as_ref() {
                if feed.try_send(frame.payload).is_err() {
                    tracing::trace!(stream = self.inner.id, "interleaved backlog full");
                }
            }
        } else if Some(frame.channel) == channels.second {
            tracing::trace!(stream = self.inner.id, "rtcp ignored");
        }
    }

    fn on_playback(&self, notice: PlaybackNotice) {
        match notice {
            PlaybackNotice::Resume | PlaybackNotice::Seek => {
                self.inner.advance(LoaderState::Paused, LoaderState::Loading);
                let playback = self.inner.state.lock().playback;
                if self.inner.pending_reset_us().is_some() && self.is_loading() && playback {
                    self.inner.seek_load.store(true, Ordering::Release);
                }
            }
            PlaybackNotice::Pause => {
                self.inner.advance(LoaderState::Loading, LoaderState::Paused);
                tracing::debug!(stream = self.inner.id, "paused");
            }
            PlaybackNotice::Stop => self.release(),
        }
    }
}

impl Drop for SampleStreamWrapper {
    fn drop(&mut self) {
        self.release();
    }
}
