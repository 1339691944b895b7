//! Monotonic wall clock used to timestamp identifiers and journal records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall clock that never goes backwards.
///
/// If the system clock is moved back, the clock keeps returning the highest
/// value it has already handed out until real time catches up.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_millis: AtomicU64,
}

impl MonotonicClock {
    /// Create a new clock
    pub const fn new() -> Self {
        Self {
            last_millis: AtomicU64::new(0),
        }
    }

    /// Current time in milliseconds since the Unix epoch
    pub fn now_millis(&self) -> u64 {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let previous = self.last_millis.fetch_max(physical, Ordering::SeqCst);
        previous.max(physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..1000 {
            let now = clock.now_millis();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_holds_highest_value() {
        let clock = MonotonicClock::new();
        let future = clock.now_millis() + 60_000;
        clock.last_millis.store(future, Ordering::SeqCst);

        assert_eq!(clock.now_millis(), future);
    }
}
