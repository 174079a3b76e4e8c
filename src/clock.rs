//! Session clock
//!
//! Segment times and capture triggers share one monotonic epoch: the moment
//! the camera started recording. Wall-clock timestamps from the remote are
//! only used for logging, since the two devices' clocks are not synchronized.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn from_epoch(epoch: Instant) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Milliseconds since the epoch
    pub fn now_ms(&self) -> i64 {
        self.ms_at(Instant::now())
    }

    /// Session time of `instant`; instants before the epoch are negative
    pub fn ms_at(&self, instant: Instant) -> i64 {
        match instant.checked_duration_since(self.epoch) {
            Some(elapsed) => elapsed.as_millis() as i64,
            None => -(self.epoch.duration_since(instant).as_millis() as i64),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_at() {
        let epoch = Instant::now();
        let clock = SessionClock::from_epoch(epoch);
        assert_eq!(clock.ms_at(epoch), 0);
        assert_eq!(clock.ms_at(epoch + Duration::from_millis(1_500)), 1_500);
    }

    #[test]
    fn test_before_epoch_is_negative() {
        let earlier = Instant::now();
        let clock = SessionClock::from_epoch(earlier + Duration::from_secs(2));
        assert_eq!(clock.ms_at(earlier), -2_000);
    }

    #[test]
    fn test_now_is_monotonic() {
        let clock = SessionClock::start();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(a >= 0 && b >= a);
    }
}
