//! Capture coalescing
//!
//! Absorbs double-taps: a `capture` from a remote that arrives within the
//! coalescing window of the last *accepted* capture from the same remote is
//! dropped. The first capture is never dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default coalescing window
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(1);

/// Per-peer duplicate filter for capture signals
#[derive(Debug)]
pub struct CaptureCoalescer {
    window: Duration,
    last_accepted: HashMap<u64, Instant>,
}

impl CaptureCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    /// Returns true if the capture from `peer` received at `at` should run
    pub fn admit(&mut self, peer: u64, at: Instant) -> bool {
        match self.last_accepted.get(&peer) {
            Some(last) if at.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.last_accepted.insert(peer, at);
                true
            }
        }
    }

    /// Forget a peer (on disconnect)
    pub fn forget(&mut self, peer: u64) {
        self.last_accepted.remove(&peer);
    }

    pub fn clear(&mut self) {
        self.last_accepted.clear();
    }
}

impl Default for CaptureCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_COALESCE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_tap_is_coalesced() {
        let mut coalescer = CaptureCoalescer::default();
        let t0 = Instant::now();

        assert!(coalescer.admit(1, t0));
        assert!(!coalescer.admit(1, t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_window_measured_from_last_accepted() {
        let mut coalescer = CaptureCoalescer::new(Duration::from_millis(1000));
        let t0 = Instant::now();

        assert!(coalescer.admit(1, t0));
        assert!(!coalescer.admit(1, t0 + Duration::from_millis(900)));
        // Dropped taps don't extend the window
        assert!(coalescer.admit(1, t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_peers_are_independent() {
        let mut coalescer = CaptureCoalescer::default();
        let t0 = Instant::now();

        assert!(coalescer.admit(1, t0));
        assert!(coalescer.admit(2, t0 + Duration::from_millis(10)));
    }

    #[test]
    fn test_forget_resets_peer() {
        let mut coalescer = CaptureCoalescer::default();
        let t0 = Instant::now();

        assert!(coalescer.admit(7, t0));
        coalescer.forget(7);
        assert!(coalescer.admit(7, t0 + Duration::from_millis(5)));
    }
}
