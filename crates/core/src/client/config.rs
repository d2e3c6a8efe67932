use std::ops::{Range, RangeInclusive};
use std::time::Duration;

use crate::error::{Result, RtspError};

/// How media is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// UDP first, switching to TCP when the server or the network refuses it.
    #[default]
    AutoDetect,
    /// RTP interleaved on the RTSP connection only.
    Interleaved,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NatMethod {
    #[default]
    None,
    /// Send [`HolePunch`] datagrams to the server ports before loading.
    Dummy,
}

/// Datagrams sent to open a NAT binding towards the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolePunch {
    pub payload: Vec<u8>,
    pub count: usize,
}

impl Default for HolePunch {
    fn default() -> Self {
        Self {
            payload: vec![0xCE, 0xFA, 0xED, 0xFE],
            count: 2,
        }
    }
}

pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 200 * 1024;
pub const RECEIVE_BUFFER_SIZE_RANGE: RangeInclusive<usize> = 100 * 1024..=500 * 1024;

/// Local ports tried for UDP media. Only even ports are used (RFC 3550 §11).
pub const UDP_PORT_RANGE: Range<u16> = 50_000..60_000;

/// Session timeout assumed when the server does not send one (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Client-level configuration shared by the session and its stream loaders.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    pub mode: TransportMode,
    /// Advertise an RTP/RTCP port pair in SETUP.
    pub enable_rtcp: bool,
    /// Advertise RTP and RTCP on one port (RFC 5761).
    pub force_rtcp_muxed: bool,
    /// First SETUP asks for interleaved delivery; a 461 falls back to UDP.
    pub try_tcp_first: bool,
    pub disable_audio: bool,
    pub disable_video: bool,
    pub nat_method: NatMethod,
    pub hole_punch: HolePunch,
    /// UDP socket receive buffer, bytes.
    pub receive_buffer_size: usize,
    pub connect_timeout: Duration,
    /// How long a request may wait for its response.
    pub request_timeout: Duration,
    /// Per-loader socket read timeout.
    pub read_timeout: Duration,
    /// Keep-alive fires this long before the session would expire.
    pub keep_alive_margin: Duration,
    /// Overrides credentials embedded in the URL.
    pub credentials: Option<(String, String)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("rtsp-client/", env!("CARGO_PKG_VERSION")).to_string(),
            mode: TransportMode::AutoDetect,
            enable_rtcp: false,
            force_rtcp_muxed: false,
            try_tcp_first: false,
            disable_audio: false,
            disable_video: false,
            nat_method: NatMethod::None,
            hole_punch: HolePunch::default(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(8),
            keep_alive_margin: Duration::from_secs(3),
            credentials: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !RECEIVE_BUFFER_SIZE_RANGE.contains(&self.receive_buffer_size) {
            return Err(RtspError::InvalidConfig(
                "receive buffer size must be between 100 KiB and 500 KiB",
            ));
        }
        if self.connect_timeout.is_zero()
            || self.request_timeout.is_zero()
            || self.read_timeout.is_zero()
        {
            return Err(RtspError::InvalidConfig("timeouts must be non-zero"));
        }
        if self.nat_method == NatMethod::Dummy
            && (self.hole_punch.payload.is_empty() || self.hole_punch.count == 0)
        {
            return Err(RtspError::InvalidConfig("hole punch needs a payload and a count"));
        }
        if self.user_agent.contains(['\r', '\n']) {
            return Err(RtspError::InvalidConfig("user agent must be a single line"));
        }
        Ok(())
    }

    pub fn is_interleaved(&self) -> bool {
        self.mode == TransportMode::Interleaved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.hole_punch.payload, [0xCE, 0xFA, 0xED, 0xFE]);
        assert!(!config.is_interleaved());
    }

    #[test]
    fn receive_buffer_bounds() {
        let mut config = ClientConfig {
            receive_buffer_size: 99 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.receive_buffer_size = 500 * 1024;
        assert!(config.validate().is_ok());
        config.receive_buffer_size = 500 * 1024 + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let config = ClientConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            nat_method: NatMethod::Dummy,
            hole_punch: HolePunch {
                payload: Vec::new(),
                count: 2,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            user_agent: "a\r\nX-Injected: 1".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
