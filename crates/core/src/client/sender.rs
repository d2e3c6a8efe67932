use std::io::{self, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender as ChannelSender, unbounded};
use parking_lot::Mutex;

use crate::protocol::{InterleavedFrame, Method, Request, Response};

/// A message queued for the control connection.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Request(Request),
    Response(Response),
    Interleaved(InterleavedFrame),
}

impl Outgoing {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Outgoing::Request(request) => request.serialize().into_bytes(),
            Outgoing::Response(response) => response.serialize().into_bytes(),
            Outgoing::Interleaved(frame) => frame.serialize(),
        }
    }
}

/// Outcome of one write, reported on the channel given to [`Sender::spawn`].
#[derive(Debug)]
pub enum SendReport {
    Sent {
        cseq: Option<u32>,
    },
    Failed {
        cseq: Option<u32>,
        method: Option<Method>,
        error: io::Error,
    },
}

enum Job {
    Send(Outgoing),
    Stop,
}

/// Writes queued messages to the socket from a dedicated thread.
///
/// Writes happen in queue order. After the first write error every later
/// message is reported as failed without touching the socket.
pub struct Sender {
    jobs: ChannelSender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    pub fn spawn<W>(writer: W, reports: ChannelSender<SendReport>) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (jobs, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("rtsp-sender".into())
            .spawn(move || write_loop(writer, rx, reports))?;

        Ok(Self {
            jobs,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `message`. Returns false once the sender has stopped.
    pub fn send(&self, message: Outgoing) -> bool {
        self.jobs.send(Job::Send(message)).is_ok()
    }

    /// Stop after the messages already queued and wait for the thread.
    pub fn stop(&self) {
        let _ = self.jobs.send(Job::Stop);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_loop<W: Write>(mut writer: W, jobs: Receiver<Job>, reports: ChannelSender<SendReport>) {
    let mut broken: Option<io::ErrorKind> = None;

    for job in jobs {
        let message = match job {
            Job::Send(message) => message,
            Job::Stop => break,
        };
        let (cseq, method) = match &message {
            Outgoing::Request(request) => (request.cseq(), Some(request.method)),
            Outgoing::Response(response) => (response.cseq(), None),
            Outgoing::Interleaved(_) => (None, None),
        };

        let result = match broken {
            Some(kind) => Err(io::Error::new(kind, "connection already failed")),
            None => writer
                .write_all(&message.to_bytes())
                .and_then(|()| writer.flush()),
        };

        let report = match result {
            Ok(()) => {
                match &message {
                    Outgoing::Interleaved(frame) => tracing::trace!(
                        channel = frame.channel,
                        len = frame.payload.len(),
                        "interleaved frame sent"
                    ),
                    _ => tracing::debug!(?cseq, ?method, "message sent"),
                }
                SendReport::Sent { cseq }
            }
            Err(error) => {
                if broken.is_none() {
                    tracing::warn!(?cseq, ?method, %error, "write failed");
                }
                broken = Some(error.kind());
                SendReport::Failed {
                    cseq,
                    method,
                    error,
                }
            }
        };
        if reports.send(report).is_err() {
            break;
        }
    }
    tracing::debug!("sender exited");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::Header;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_in_order_and_reports() {
        let buf = SharedBuf::default();
        let (tx, rx) = unbounded();
        let sender = Sender::spawn(buf.clone(), tx).unwrap();

        let request = Request::new(Method::Options, "rtsp://cam/").with_header(Header::CSeq, "1");
        assert!(sender.send(Outgoing::Request(request)));
        assert!(sender.send(Outgoing::Interleaved(InterleavedFrame::new(0, vec![1, 2]))));
        sender.stop();

        let written = buf.0.lock().clone();
        assert!(written.starts_with(b"OPTIONS rtsp://cam/ RTSP/1.0\r\n"));
        assert!(written.ends_with(&[b'$', 0, 0, 2, 1, 2]));

        let reports: Vec<_> = rx.try_iter().collect();
        assert!(matches!(reports[0], SendReport::Sent { cseq: Some(1) }));
        assert!(matches!(reports[1], SendReport::Sent { cseq: None }));
    }

    #[test]
    fn failure_is_sticky() {
        let (tx, rx) = unbounded();
        let sender = Sender::spawn(Broken, tx).unwrap();

        let request = Request::new(Method::Describe, "rtsp://cam/").with_header(Header::CSeq, "2");
        sender.send(Outgoing::Request(request));
        sender.send(Outgoing::Response(Response::ok()));
        sender.stop();

        let reports: Vec<_> = rx.try_iter().collect();
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            &reports[0],
            SendReport::Failed { cseq: Some(2), method: Some(Method::Describe), .. }
        ));
        assert!(matches!(
            &reports[1],
            SendReport::Failed { error, .. } if error.kind() == io::ErrorKind::BrokenPipe
        ));
    }
}
