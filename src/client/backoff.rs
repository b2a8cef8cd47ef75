//! Reconnect backoff with symmetric jitter.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff state for the primary connection.
///
/// Delays run `initial, initial * factor, ...` up to `max`. Each delay is
/// spread by a uniform factor in `[1 - jitter, 1 + jitter]` and capped at
/// `max` again afterwards.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: f64,
    jitter: f64,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at the initial delay.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial,
            factor: config.factor,
            jitter: config.jitter,
            max: config.max,
            current: config.initial.min(config.max),
        }
    }

    /// Next delay using the thread RNG.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Next delay using the given RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(self.factor).min(self.max);

        let spread = if self.jitter > 0.0 {
            rng.gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        base.mul_f64(1.0 + spread).min(self.max)
    }

    /// The un-jittered delay the next call starts from.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Back to the initial delay. Called once a connection reaches Ready.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(3),
            factor: 1.5,
            jitter,
            max: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_progression_without_jitter() {
        let mut backoff = Backoff::new(&config(0.0));
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<f64> = (0..4)
            .map(|_| backoff.next_delay_with(&mut rng).as_secs_f64())
            .collect();
        assert_eq!(delays, vec![3.0, 4.5, 6.75, 10.125]);
    }

    #[test]
    fn test_capped_at_max() {
        let mut backoff = Backoff::new(&config(0.2));
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            assert!(backoff.next_delay_with(&mut rng) <= Duration::from_secs(300));
        }
        assert_eq!(backoff.current(), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let mut backoff = Backoff::new(&config(0.2));
            let delay = backoff.next_delay_with(&mut rng).as_secs_f64();
            assert!((2.4..=3.6).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(&config(0.0));
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..5 {
            backoff.next_delay_with(&mut rng);
        }
        assert!(backoff.current() > Duration::from_secs(3));
        backoff.reset();
        assert_eq!(backoff.next_delay_with(&mut rng), Duration::from_secs(3));
    }
}
