//! The body of a loader thread.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use url::Url;

use super::condition::Wake;
use super::{Inner, LoaderEvent, LoaderState};
use crate::client::config::NatMethod;
use crate::error::{MediaError, is_timeout};
use crate::media::extractor::{
    Extractor, ExtractorOutput, ReadResult, TIME_UNSET, TrackOutput,
};
use crate::media::track::TrackType;
use crate::protocol::Transport;
use crate::transport::{DataSource, InterleavedDataSource, UdpDataSource};

/// How one load ended.
enum Outcome {
    Completed,
    Canceled,
    Failed(io::Error),
    /// The source or extractor could not be built; already reported.
    OpenFailed,
}

pub(super) fn run(inner: Arc<Inner>) {
    let mut reopened = false;
    let (outcome, elapsed) = loop {
        let started = Instant::now();
        let outcome = Loadable {
            inner: &inner,
            reopened,
        }
        .load();

        if matches!(outcome, Outcome::Canceled) && !inner.is_released() {
            // A transport change racing this check re-arms both flags after
            // they are cleared, so the next load cancels straight away.
            inner.interrupt.store(false, Ordering::Release);
            inner.condition.clear_reset();
            if inner.reopen.swap(false, Ordering::AcqRel) {
                inner.set_phase(LoaderState::Opening);
                reopened = true;
                continue;
            }
        }
        break (outcome, started.elapsed());
    };

    finish(&inner, outcome, elapsed);
    inner.loading.store(false, Ordering::Release);
}

fn finish(inner: &Inner, outcome: Outcome, elapsed: Duration) {
    let released = {
        let mut state = inner.state.lock();
        state.loading_finished = true;
        state.phase = match outcome {
            Outcome::Completed => LoaderState::Complete,
            Outcome::Canceled => LoaderState::Canceled,
            Outcome::Failed(_) | Outcome::OpenFailed => LoaderState::Failed,
        };
        state.released
    };

    match outcome {
        Outcome::Completed => {
            tracing::debug!(stream = inner.id, "end of input");
            if !released {
                inner.post(LoaderEvent::PlaybackComplete(inner.id));
            }
        }
        Outcome::Canceled => {
            tracing::debug!(stream = inner.id, "load canceled");
            if !released {
                inner.post(LoaderEvent::PlaybackCanceled(inner.id));
            }
        }
        Outcome::Failed(err) => {
            if released {
                return;
            }
            let elapsed_us = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);
            // A bounded presentation that ran its length ends with silence.
            if inner
                .env
                .status
                .duration_us()
                .is_some_and(|duration| elapsed_us > duration)
            {
                tracing::debug!(stream = inner.id, error = %err, "source went silent past the end");
                inner.post(LoaderEvent::PlaybackComplete(inner.id));
            } else {
                tracing::warn!(stream = inner.id, error = %err, "load failed");
                inner.post(LoaderEvent::PlaybackFailure(
                    inner.id,
                    MediaError::from_read_error(&err),
                ));
            }
        }
        Outcome::OpenFailed => {}
    }
}

/// A single load: open, wait for the go-ahead, then pump packets through
/// the extractor until the input ends, fails or is canceled.
struct Loadable<'a> {
    inner: &'a Inner,
    reopened: bool,
}

impl Loadable<'_> {
    fn load(&mut self) -> Outcome {
        let transport = self.inner.transport();
        let mut source = match self.open(&transport) {
            Ok(source) => source,
            Err(err) => {
                return self.open_failed(MediaError::UnsupportedProtocol(format!(
                    "{}: {err}",
                    transport.lower
                )));
            }
        };

        let outcome = self.drive(source.as_mut(), &transport);
        source.close();
        *self.inner.feed.lock() = None;
        outcome
    }

    fn open(&self, transport: &Transport) -> io::Result<Box<dyn DataSource>> {
        let config = &self.inner.env.config;
        let interrupt = self.inner.interrupt.clone();
        if transport.is_tcp() {
            let (source, feed) = InterleavedDataSource::channel(config.read_timeout, interrupt);
            *self.inner.feed.lock() = Some(feed);
            Ok(Box::new(source))
        } else {
            let source = UdpDataSource::bind(
                self.inner.local_port,
                config.receive_buffer_size,
                config.read_timeout,
                interrupt,
            )?;
            Ok(Box::new(source))
        }
    }

    fn open_failed(&self, err: MediaError) -> Outcome {
        tracing::warn!(stream = self.inner.id, error = %err, "cannot open stream");
        if self.reopened {
            // Prepare was already reported; this is now a playback failure.
            return Outcome::Failed(io::Error::other(err.to_string()));
        }
        self.inner
            .post(LoaderEvent::PrepareFailure(self.inner.id, err));
        Outcome::OpenFailed
    }

    fn drive(&mut self, source: &mut dyn DataSource, transport: &Transport) -> Outcome {
        let inner = self.inner;
        let mut extractor = match inner.env.extractors.create(&inner.track, transport.ssrc) {
            Ok(extractor) => extractor,
            Err(err) => return self.open_failed(err),
        };

        let prepared = inner.state.lock().playback;
        if self.reopened {
            let resumed = if prepared {
                LoaderState::Loading
            } else {
                LoaderState::PreparePending
            };
            inner.advance(LoaderState::Opening, resumed);
        } else {
            inner.set_phase(LoaderState::PreparePending);
            inner.post(LoaderEvent::PrepareStarted(inner.id));
        }

        if !prepared {
            match inner.condition.block() {
                Wake::Permit if !inner.is_interrupted() => {}
                _ => return Outcome::Canceled,
            }
        }

        self.punch(source, transport);

        let mut output = QueueOutput { inner };
        extractor.init(&mut output);
        inner.maybe_finish_prepare();

        loop {
            if inner.is_interrupted() {
                return Outcome::Canceled;
            }
            if inner.seek_load.swap(false, Ordering::AcqRel) {
                restart(inner, source, extractor.as_mut());
            }
            match extractor.read(source) {
                Ok(ReadResult::Continue) => {
                    if inner.state.lock().playback {
                        inner.advance(LoaderState::Prepared, LoaderState::Loading);
                    } else {
                        inner.maybe_finish_prepare();
                    }
                }
                Ok(ReadResult::EndOfInput) => return Outcome::Completed,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    return Outcome::Canceled;
                }
                Err(err) if is_timeout(&err) && inner.env.status.is_paused() => {
                    tracing::trace!(stream = inner.id, "no media while paused");
                }
                Err(err) => return Outcome::Failed(err),
            }
        }
    }

    /// Open NAT bindings towards the server's media ports.
    fn punch(&self, source: &mut dyn DataSource, transport: &Transport) {
        let config = &self.inner.env.config;
        if config.nat_method != NatMethod::Dummy || transport.is_tcp() {
            return;
        }
        let Some(server_port) = transport.server_port else {
            return;
        };

        let mut ports = vec![server_port.first];
        let muxed = config.force_rtcp_muxed || self.inner.track.muxed;
        if transport.is_rtp() && config.enable_rtcp && !muxed {
            ports.extend(server_port.second);
        }

        let Some(host) = self.punch_host(transport) else {
            tracing::debug!(stream = self.inner.id, "no address to punch towards");
            return;
        };
        let targets: Vec<SocketAddr> = ports
            .into_iter()
            .filter_map(|port| (host.as_str(), port).to_socket_addrs().ok()?.next())
            .collect();

        for _ in 0..config.hole_punch.count {
            if let Err(err) = source.punch(&config.hole_punch.payload, &targets) {
                tracing::debug!(stream = self.inner.id, error = %err, "hole punch failed");
                return;
            }
        }
        tracing::debug!(stream = self.inner.id, ?targets, "nat hole punched");
    }

    /// The server's media address. Private addresses in the transport are
    /// replaced by the host the track was requested from.
    fn punch_host(&self, transport: &Transport) -> Option<String> {
        let advertised = transport
            .source
            .as_deref()
            .or(transport.destination.as_deref())
            .filter(|host| !is_private(host));
        match advertised {
            Some(host) => Some(host.to_string()),
            None => Url::parse(&self.inner.track.url)
                .ok()?
                .host_str()
                .map(|host| host.trim_matches(['[', ']']).to_string()),
        }
    }
}

fn is_private(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => (ip.segments()[0] & 0xfe00) == 0xfc00,
        Err(_) => false,
    }
}

/// Apply the pending reset: drop queued samples and stale packets and
/// restart the timeline at the seek position.
fn restart(inner: &Inner, source: &mut dyn DataSource, extractor: &mut dyn Extractor) {
    let position = inner.pending_reset_us.load(Ordering::Acquire);
    if position == TIME_UNSET {
        return;
    }
    for queue in &inner.state.lock().queues {
        queue.reset();
    }
    source.seek();
    extractor.seek(None, position);
    inner.pending_reset_us.store(TIME_UNSET, Ordering::Release);
    tracing::debug!(stream = inner.id, position_us = position, "load restarted");
}

/// Hands extractor tracks to queues from the period's allocator.
struct QueueOutput<'a> {
    inner: &'a Inner,
}

impl ExtractorOutput for QueueOutput<'_> {
    fn track(&mut self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput> {
        let mut state = self.inner.state.lock();
        if let Some(index) = state.queue_ids.iter().position(|&known| known == id) {
            return state.queues[index].clone();
        }
        let track_id = ((self.inner.id as u32) << 16) | id;
        let queue = self.inner.env.allocator.create(track_id, track_type);
        state.queue_ids.push(id);
        state.queues.push(queue.clone());
        state.enabled.push(false);
        queue
    }

    fn end_tracks(&mut self) {
        self.inner.state.lock().queues_built = true;
    }

    fn seek_map(&mut self, seekable: bool) {
        tracing::trace!(stream = self.inner.id, seekable, "seek map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_addresses() {
        assert!(is_private("192.168.1.20"));
        assert!(is_private("10.0.0.1"));
        assert!(is_private("fd00::1"));
        assert!(!is_private("203.0.113.5"));
        assert!(!is_private("127.0.0.1"));
        assert!(!is_private("camera.example.com"));
    }
}
