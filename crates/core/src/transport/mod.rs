//! Media data sources for the stream loaders.
//!
//! RTP reaches a loader one of two ways:
//!
//! - **UDP** ([`udp`]): a datagram socket bound to the loader's
//!   `client_port`. One socket per track.
//!
//! - **Interleaved TCP** ([`tcp`]): `$`-framed payloads read off the RTSP
//!   control connection by the dispatcher and handed to the loader over a
//!   channel (RFC 2326 §10.12).
//!
//! Both implement [`DataSource`] and share the read-timeout bookkeeping in
//! [`SourceCore`].

pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::media::extractor::ExtractorInput;

pub use tcp::InterleavedDataSource;
pub use udp::UdpDataSource;

/// Longest a single blocking wait lasts before the interrupt flag is checked.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Packet counters of one data source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub packets: u64,
    pub bytes: u64,
}

/// A packet source a loader drives an extractor over.
///
/// Reads go through [`ExtractorInput::read_packet`]. `Ok(0)` is end of
/// input; a silent source fails with [`io::ErrorKind::TimedOut`] once the
/// read timeout elapses, and an interrupted one with
/// [`io::ErrorKind::Interrupted`].
pub trait DataSource: ExtractorInput + Send {
    /// Drop whatever is buffered so the next read returns fresh data.
    fn seek(&mut self);

    /// Send `payload` to each of `targets`. Only meaningful for datagram
    /// sources; others ignore it.
    fn punch(&mut self, _payload: &[u8], _targets: &[SocketAddr]) -> io::Result<()> {
        Ok(())
    }

    fn local_port(&self) -> Option<u16> {
        None
    }

    fn stats(&self) -> SourceStats;

    fn close(&mut self);
}

/// Outcome of one bounded wait for a packet.
pub(crate) enum Poll {
    Packet(usize),
    Idle,
}

/// Bookkeeping shared by every data source: the read timeout, the interrupt
/// flag set by the owning loader, and packet counters.
#[derive(Debug)]
pub struct SourceCore {
    read_timeout: Duration,
    interrupt: Arc<AtomicBool>,
    stats: SourceStats,
    closed: bool,
}

impl SourceCore {
    pub fn new(read_timeout: Duration, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            read_timeout,
            interrupt,
            stats: SourceStats::default(),
            closed: false,
        }
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Call `attempt` with waits of at most [`POLL_INTERVAL`] until it
    /// yields a packet, the source is interrupted, or nothing arrives
    /// within the read timeout.
    pub(crate) fn poll<F>(&mut self, mut attempt: F) -> io::Result<usize>
    where
        F: FnMut(Duration) -> io::Result<Poll>,
    {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "source closed"));
        }
        let started = Instant::now();
        loop {
            if self.interrupt.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "load canceled"));
            }
            let elapsed = started.elapsed();
            if elapsed >= self.read_timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no media for {} ms", self.read_timeout.as_millis()),
                ));
            }
            let wait = (self.read_timeout - elapsed).min(POLL_INTERVAL);
            match attempt(wait)? {
                Poll::Packet(len) => {
                    if len > 0 {
                        self.stats.packets += 1;
                        self.stats.bytes += len as u64;
                    }
                    return Ok(len);
                }
                Poll::Idle => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_counts_packets() {
        let mut core = SourceCore::new(Duration::from_secs(1), Arc::new(AtomicBool::new(false)));
        assert_eq!(core.poll(|_| Ok(Poll::Packet(12))).unwrap(), 12);
        assert_eq!(core.poll(|_| Ok(Poll::Packet(0))).unwrap(), 0);
        assert_eq!(core.stats(), SourceStats { packets: 1, bytes: 12 });
    }

    #[test]
    fn poll_times_out_when_idle() {
        let mut core =
            SourceCore::new(Duration::from_millis(50), Arc::new(AtomicBool::new(false)));
        let err = core
            .poll(|wait| {
                std::thread::sleep(wait);
                Ok(Poll::Idle)
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn poll_stops_when_interrupted() {
        let interrupt = Arc::new(AtomicBool::new(true));
        let mut core = SourceCore::new(Duration::from_secs(5), interrupt);
        let err = core.poll(|_| Ok(Poll::Idle)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);

        core.close();
        let err = core.poll(|_| Ok(Poll::Packet(1))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
