//! Decorrelated-jitter reconnect backoff
//!
//! Each delay is drawn uniformly from `[base, last * factor]`, capped at
//! `max`; a successful open resets `last` to `base`. Always satisfies
//! `base <= delay <= max`.

use rand::Rng;
use std::time::Duration;

pub struct DecorrelatedJitter {
    base: Duration,
    max: Duration,
    factor: f64,
    last: Duration,
}

impl DecorrelatedJitter {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            factor: factor.max(1.0),
            last: base,
        }
    }

    pub fn next(&mut self) -> Duration {
        let lo = self.base.as_millis() as u64;
        let hi = ((self.last.as_millis() as f64 * self.factor) as u64)
            .clamp(lo, self.max.as_millis() as u64);
        let ms = if hi <= lo {
            lo
        } else {
            rand::thread_rng().gen_range(lo..=hi)
        };
        self.last = Duration::from_millis(ms);
        self.last
    }

    /// Called on every successful open
    pub fn reset(&mut self) {
        self.last = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_stays_in_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(2_000);
        let mut backoff = DecorrelatedJitter::new(base, max, 3.0);
        for _ in 0..200 {
            let delay = backoff.next();
            assert!(delay >= base, "delay {:?} under base", delay);
            assert!(delay <= max, "delay {:?} over max", delay);
        }
    }

    #[test]
    fn test_reset_returns_to_base_range() {
        let base = Duration::from_millis(100);
        let mut backoff = DecorrelatedJitter::new(base, Duration::from_secs(30), 3.0);
        for _ in 0..10 {
            backoff.next();
        }
        backoff.reset();
        // First delay after reset is bounded by base * factor
        let delay = backoff.next();
        assert!(delay <= Duration::from_millis(300));
    }

    #[test]
    fn test_degenerate_configuration_clamps() {
        // base above max collapses to a fixed delay
        let mut backoff = DecorrelatedJitter::new(
            Duration::from_millis(500),
            Duration::from_millis(100),
            2.0,
        );
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }
}
