//! The engine's only tunables, and a small reusable debounce helper so
//! `wait`/`max_wait` aren't hard-coded inline.

use std::time::{Duration, Instant};

/// Trailing-only debounce, leading-false / max-wait. `wait = 10ms`,
/// `max_wait = 50ms` by default — the only numeric tunables exposed to
/// the surrounding system.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub wait: Duration,
    pub max_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
        }
    }
}

/// Tracks one debounce "burst": the run of pokes between drains.
///
/// Pure and `Instant`-driven so it can be unit tested without a timer.
/// The caller (the scheduler) is responsible for actually sleeping until
/// the returned instant and for calling [`Debouncer::reset`] once the
/// drain it scheduled has run.
#[derive(Debug)]
pub struct Debouncer {
    wait: Duration,
    max_wait: Duration,
    burst_started_at: Option<Instant>,
}

impl Debouncer {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            wait: config.wait,
            max_wait: config.max_wait,
            burst_started_at: None,
        }
    }

    /// Record a poke observed at `now`. Returns the instant the next
    /// drain should fire — trailing `wait` after the most recent poke,
    /// but never later than `max_wait` after the first poke of this
    /// burst.
    pub fn poke(&mut self, now: Instant) -> Instant {
        let burst_start = *self.burst_started_at.get_or_insert(now);
        let trailing = now + self.wait;
        let capped = burst_start + self.max_wait;
        trailing.min(capped)
    }

    /// Call once the drain this burst scheduled has actually run.
    pub fn reset(&mut self) {
        self.burst_started_at = None;
    }

    /// Whether a poke has been recorded since the last `reset`.
    pub fn is_active(&self) -> bool {
        self.burst_started_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_poke_fires_after_wait() {
        let mut d = Debouncer::new(EngineConfig {
            wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
        });
        let t0 = Instant::now();
        assert_eq!(d.poke(t0), t0 + Duration::from_millis(10));
    }

    #[test]
    fn repeated_pokes_push_the_trailing_edge_out() {
        let mut d = Debouncer::new(EngineConfig {
            wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
        });
        let t0 = Instant::now();
        d.poke(t0);
        let t1 = t0 + Duration::from_millis(5);
        assert_eq!(d.poke(t1), t1 + Duration::from_millis(10));
    }

    #[test]
    fn burst_is_capped_by_max_wait_from_first_poke() {
        let mut d = Debouncer::new(EngineConfig {
            wait: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
        });
        let t0 = Instant::now();
        d.poke(t0);
        // Keep poking every 5ms; trailing edge would run forever without
        // the cap.
        let mut t = t0;
        let mut fire_at = t0;
        for _ in 0..20 {
            t += Duration::from_millis(5);
            fire_at = d.poke(t);
        }
        assert_eq!(fire_at, t0 + Duration::from_millis(50));
    }

    #[test]
    fn reset_starts_a_fresh_burst() {
        let mut d = Debouncer::new(EngineConfig::default());
        let t0 = Instant::now();
        d.poke(t0);
        d.reset();
        assert!(!d.is_active());
        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(d.poke(t1), t1 + Duration::from_millis(10));
    }
}
