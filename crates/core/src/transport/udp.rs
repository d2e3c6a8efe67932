use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use super::{DataSource, Poll, SourceCore, SourceStats};
use crate::error::is_timeout;
use crate::media::extractor::ExtractorInput;

/// RTP over UDP, one socket per track.
///
/// The socket is bound to the exact port advertised in the SETUP
/// `client_port`, so a loader that reopens after a transport change keeps
/// the port the server already knows.
pub struct UdpDataSource {
    socket: UdpSocket,
    local_port: u16,
    core: SourceCore,
}

impl UdpDataSource {
    /// Bind `0.0.0.0:<port>` with the given kernel receive buffer.
    pub fn bind(
        port: u16,
        receive_buffer_size: usize,
        read_timeout: Duration,
        interrupt: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        let _ = socket.set_reuse_address(true);
        socket.set_recv_buffer_size(receive_buffer_size)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        let local_port = socket.local_addr()?.port();
        tracing::debug!(port = local_port, "media socket bound");

        Ok(Self {
            socket,
            local_port,
            core: SourceCore::new(read_timeout, interrupt),
        })
    }
}

impl ExtractorInput for UdpDataSource {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = &self.socket;
        self.core.poll(|wait| {
            socket.set_read_timeout(Some(wait))?;
            match socket.recv_from(buf) {
                Ok((len, _)) => Ok(Poll::Packet(len)),
                Err(e) if is_timeout(&e) => Ok(Poll::Idle),
                Err(e) => Err(e),
            }
        })
    }
}

impl DataSource for UdpDataSource {
    fn seek(&mut self) {
        if self.socket.set_nonblocking(true).is_err() {
            return;
        }
        let mut scratch = [0u8; 2048];
        let mut dropped = 0usize;
        while self.socket.recv_from(&mut scratch).is_ok() {
            dropped += 1;
        }
        let _ = self.socket.set_nonblocking(false);
        tracing::trace!(port = self.local_port, dropped, "stale datagrams dropped");
    }

    fn punch(&mut self, payload: &[u8], targets: &[SocketAddr]) -> io::Result<()> {
        for target in targets {
            self.socket.send_to(payload, target)?;
        }
        Ok(())
    }

    fn local_port(&self) -> Option<u16> {
        Some(self.local_port)
    }

    fn stats(&self) -> SourceStats {
        self.core.stats()
    }

    fn close(&mut self) {
        if !self.core.is_closed() {
            tracing::debug!(port = self.local_port, stats = ?self.core.stats(), "media socket closed");
        }
        self.core.close();
    }
}
