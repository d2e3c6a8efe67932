//! UDP to TCP fallback.
//!
//! A UDP session that stops receiving media is usually behind a firewall or
//! NAT that drops the datagrams. The policy reacts to the first load
//! timeout by switching the source's transport preference to interleaved
//! and asking the source to restart. It fires at most once per source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use parking_lot::RwLock;

use crate::client::{ClientConfig, TransportMode};
use crate::error::MediaError;
use crate::source::SourceEvent;

pub struct FallbackPolicy {
    fired: AtomicBool,
    config: Arc<RwLock<ClientConfig>>,
    events: Sender<SourceEvent>,
}

impl FallbackPolicy {
    pub fn new(config: Arc<RwLock<ClientConfig>>, events: Sender<SourceEvent>) -> Self {
        FallbackPolicy {
            fired: AtomicBool::new(false),
            config,
            events,
        }
    }

    /// Failures worth retrying over TCP.
    pub fn allows(error: &MediaError) -> bool {
        matches!(error, MediaError::LoadTimeout)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Switch to interleaved transport and request a restart when `error`
    /// qualifies. Returns whether a restart was requested.
    pub fn retry_if_allowed(&self, error: &MediaError) -> bool {
        if !Self::allows(error) {
            return false;
        }
        {
            let mut config = self.config.write();
            if config.mode == TransportMode::Interleaved {
                return false;
            }
            if self
                .fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            config.mode = TransportMode::Interleaved;
        }

        tracing::info!(%error, "falling back to interleaved transport");
        let _ = self.events.send(SourceEvent::FallbackRestart);
        true
    }
}
