//! Monotonic microsecond clock. State machines never read the clock
//! themselves; the event loop samples the timebase once per tick and passes
//! plain `u64` timestamps down, which keeps every timeout testable.

use std::time::Instant;

#[derive(Debug, Clone)]
pub struct Timebase {
    start: Instant,
}

impl Timebase {
    pub fn new() -> Self {
        Timebase {
            start: Instant::now(),
        }
    }

    /// Microseconds elapsed since this timebase was created.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}
