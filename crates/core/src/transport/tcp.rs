use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use super::{DataSource, Poll, SourceCore, SourceStats};
use crate::media::extractor::ExtractorInput;

/// Unread payloads held for the loader. Once full, newly arriving payloads
/// are dropped and the backlog is kept.
pub const INTERLEAVED_BACKLOG: usize = 512;

/// RTP interleaved on the RTSP connection (RFC 2326 §10.12).
///
/// The dispatcher's reader demultiplexes `$` frames by channel; the session
/// routes each RTP payload to the owning loader through the [`Sender`]
/// returned by [`channel`](Self::channel). A full backlog drops the
/// incoming payload rather than stalling the control connection.
pub struct InterleavedDataSource {
    packets: Receiver<Vec<u8>>,
    core: SourceCore,
}

impl InterleavedDataSource {
    /// A source and the sender that feeds it.
    pub fn channel(read_timeout: Duration, interrupt: Arc<AtomicBool>) -> (Self, Sender<Vec<u8>>) {
        let (tx, rx) = bounded(INTERLEAVED_BACKLOG);
        let source = Self {
            packets: rx,
            core: SourceCore::new(read_timeout, interrupt),
        };
        (source, tx)
    }
}

impl ExtractorInput for InterleavedDataSource {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packets = &self.packets;
        self.core.poll(|wait| match packets.recv_timeout(wait) {
            Ok(payload) => {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok(Poll::Packet(len))
            }
            Err(RecvTimeoutError::Timeout) => Ok(Poll::Idle),
            // Feed dropped: the control connection is gone.
            Err(RecvTimeoutError::Disconnected) => Ok(Poll::Packet(0)),
        })
    }
}

impl DataSource for InterleavedDataSource {
    fn seek(&mut self) {
        let dropped = self.packets.try_iter().count();
        tracing::trace!(dropped, "stale interleaved payloads dropped");
    }

    fn stats(&self) -> SourceStats {
        self.core.stats()
    }

    fn close(&mut self) {
        if !self.core.is_closed() {
            tracing::debug!(stats = ?self.core.stats(), "interleaved source closed");
        }
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fed_payloads_in_order() {
        let (mut source, feed) =
            InterleavedDataSource::channel(Duration::from_secs(1), Arc::new(AtomicBool::new(false)));
        feed.send(vec![1, 2, 3]).unwrap();
        feed.send(vec![4]).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(source.read_packet(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(source.read_packet(&mut buf).unwrap(), 1);
        assert_eq!(source.stats(), SourceStats { packets: 2, bytes: 4 });
    }

    #[test]
    fn full_backlog_drops_newest_payload() {
        let (mut source, feed) =
            InterleavedDataSource::channel(Duration::from_secs(1), Arc::new(AtomicBool::new(false)));
        for n in 0..INTERLEAVED_BACKLOG {
            feed.try_send(vec![(n % 251) as u8]).unwrap();
        }
        assert!(feed.try_send(vec![0xff]).is_err());

        let mut buf = [0u8; 16];
        assert_eq!(source.read_packet(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn seek_drops_backlog_and_disconnect_ends_input() {
        let (mut source, feed) =
            InterleavedDataSource::channel(Duration::from_secs(1), Arc::new(AtomicBool::new(false)));
        feed.send(vec![9; 4]).unwrap();
        source.seek();
        drop(feed);

        let mut buf = [0u8; 16];
        assert_eq!(source.read_packet(&mut buf).unwrap(), 0);
    }

    #[test]
    fn silent_feed_times_out() {
        let (mut source, _feed) = InterleavedDataSource::channel(
            Duration::from_millis(120),
            Arc::new(AtomicBool::new(false)),
        );
        let mut buf = [0u8; 16];
        let err = source.read_packet(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
