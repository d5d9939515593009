// src/clock.rs - Time sources for the control loop
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time for `dt`, wall-clock time for stamping samples.
pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wallclock(&self) -> DateTime<Utc>;
}

/// The process clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wallclock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Both readings advance together.
#[derive(Debug)]
pub struct ManualClock {
    mono_base: Instant,
    wall_base: DateTime<Utc>,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            mono_base: Instant::now(),
            wall_base: Utc::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, dt: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += dt;
    }

    fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_monotonic(&self) -> Instant {
        self.mono_base + self.elapsed()
    }

    fn now_wallclock(&self) -> DateTime<Utc> {
        // Duration -> chrono::TimeDelta only fails past ~292 billion years.
        self.wall_base + chrono::TimeDelta::from_std(self.elapsed()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_readings() {
        let clock = ManualClock::new();
        let mono = clock.now_monotonic();
        let wall = clock.now_wallclock();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_monotonic() - mono, Duration::from_secs(5));
        assert_eq!((clock.now_wallclock() - wall).num_seconds(), 5);
    }
}
