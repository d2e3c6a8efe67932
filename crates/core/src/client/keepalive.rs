use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

/// Periodic session refresh (RFC 2326 §12.37).
///
/// Calls `fire` every `interval` on its own thread until stopped or until
/// `fire` returns false. The session decides what to send.
pub struct KeepAlive {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start<F>(interval: Duration, mut fire: F) -> io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let worker = thread::Builder::new()
            .name("rtsp-keepalive".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            tracing::trace!("keep-alive due");
                            if !fire() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("keep-alive stopped");
            })?;

        tracing::debug!(interval_ms = interval.as_millis() as u64, "keep-alive started");
        Ok(Self {
            stop: Some(stop_tx),
            worker: Some(worker),
        })
    }

    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shortest refresh period, whatever timeout the server announced.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Time between refreshes for a session `timeout`, leaving `margin` spare.
pub fn interval(timeout: Duration, margin: Duration) -> Duration {
    let interval = timeout.saturating_sub(margin);
    let interval = if interval.is_zero() { timeout / 2 } else { interval };
    interval.max(MIN_INTERVAL)
}
