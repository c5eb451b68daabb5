//! Capped exponential backoff for transient accept and receive errors.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first consecutive failure.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth factor between consecutive failures.
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(5),
            max: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

/// Delay state for one loop. Reset after every success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Delay to sleep for the next consecutive failure.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.config.initial,
            Some(delay) => delay.saturating_mul(self.config.multiplier),
        }
        .min(self.config.max);
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// The last delay handed out, if any failure is being backed off.
    pub fn current(&self) -> Option<Duration> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, [5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.current(), None);
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_delays_non_decreasing_and_capped() {
        let configs = [
            BackoffConfig::default(),
            BackoffConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(7),
                multiplier: 3,
            },
            BackoffConfig {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(50),
                multiplier: 1,
            },
            BackoffConfig {
                initial: Duration::from_secs(5),
                max: Duration::from_secs(1),
                multiplier: 2,
            },
        ];

        for config in configs {
            let mut backoff = Backoff::new(config);
            let mut previous = Duration::ZERO;
            for _ in 0..100 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "{config:?} decreased: {previous:?} -> {delay:?}");
                assert!(delay <= config.max, "{config:?} exceeded cap: {delay:?}");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_huge_multiplier_saturates() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::MAX,
            multiplier: u32::MAX,
        });
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current(), Some(Duration::MAX));
    }
}
