//! Monotonic session clock.
//!
//! Request issue times and the session `start_time` fence are both drawn
//! from one [`SessionClock`], so any two ticks are strictly ordered even
//! when they land in the same wall-clock millisecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, as used on the wire.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Strictly increasing millisecond timestamps.
#[derive(Debug, Default)]
pub struct SessionClock {
    last: AtomicU64,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: wall-clock milliseconds, bumped past the previous tick.
    pub fn tick(&self) -> u64 {
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = now_millis().max(last + 1);
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Most recently issued tick (0 before the first).
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_strictly_increase() {
        let clock = SessionClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(clock.last(), prev);
    }

    #[test]
    fn test_tick_tracks_wall_clock() {
        let clock = SessionClock::new();
        let before = now_millis();
        assert!(clock.tick() >= before);
    }
}
