#[cfg(test)]
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Why a blocked loader woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The period granted permission to load.
    Permit,
    /// The current load was canceled and should unwind.
    Reset,
    /// The stream is being released.
    Release,
}

#[derive(Debug, Default)]
struct Gate {
    permit: bool,
    reset: bool,
    released: bool,
}

/// Gate a loader waits on between opening its source and loading.
///
/// `permit` is level-triggered, `reset` is consumed by the wait that
/// observes it, and `release` is sticky.
#[derive(Debug, Default)]
pub struct LoadCondition {
    gate: Mutex<Gate>,
    cond: Condvar,
}

impl LoadCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.gate.lock().permit = true;
        self.cond.notify_all();
    }

    pub fn close(&self) {
        self.gate.lock().permit = false;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.gate.lock().permit
    }

    pub fn request_reset(&self) {
        self.gate.lock().reset = true;
        self.cond.notify_all();
    }

    /// Forget a reset nobody waited for.
    pub fn clear_reset(&self) {
        self.gate.lock().reset = false;
    }

    pub fn release(&self) {
        self.gate.lock().released = true;
        self.cond.notify_all();
    }

    /// Block until one of the wake reasons holds. Release wins over reset,
    /// reset over permit.
    pub fn block(&self) -> Wake {
        let mut gate = self.gate.lock();
        loop {
            if let Some(wake) = Self::take(&mut gate) {
                return wake;
            }
            self.cond.wait(&mut gate);
        }
    }

    /// [`block`](Self::block) with a deadline. `None` on timeout.
    #[cfg(test)]
    pub fn block_for(&self, timeout: Duration) -> Option<Wake> {
        let mut gate = self.gate.lock();
        if let Some(wake) = Self::take(&mut gate) {
            return Some(wake);
        }
        let _ = self.cond.wait_for(&mut gate, timeout);
        Self::take(&mut gate)
    }

    fn take(gate: &mut Gate) -> Option<Wake> {
        if gate.released {
            Some(Wake::Release)
        } else if gate.reset {
            gate.reset = false;
            Some(Wake::Reset)
        } else if gate.permit {
            Some(Wake::Permit)
        } else {
            None
        }
    }
}
