//! Reconnect backoff
//!
//! Exponential delay with symmetric jitter, capped at the configured ceiling,
//! and a budget of consecutive failures after which a leg gives up. Both the
//! OPC UA source and the MQTT sink use one `Backoff` per connection.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Consecutive-failure tracker for one connection
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt
    ///
    /// Returns the delay before the next attempt, or `None` once the failure
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.config.max_failures > 0 && self.failures >= self.config.max_failures {
            return None;
        }
        Some(self.delay_for(self.failures - 1))
    }

    /// A successful connection resets the budget
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.config.initial.as_secs_f64();
        let ceiling = self.config.max.as_secs_f64();
        let base = (initial * 2f64.powi(attempt.min(31) as i32)).min(ceiling);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 && base > 0.0 {
            let spread = base * jitter;
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };

        Duration::from_secs_f64(delay.clamp(0.0, ceiling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter,
            max_failures: 5,
        }
    }

    #[test]
    fn doubles_until_budget_is_spent() {
        let mut backoff = Backoff::new(config(0.0));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn delay_is_capped() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_failures: 0,
            ..config(0.0)
        });
        let last = (0..10).filter_map(|_| backoff.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(30)));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..200 {
            let mut backoff = Backoff::new(config(0.2));
            backoff.next_delay();
            let second = backoff.next_delay().unwrap();
            assert!(second >= Duration::from_millis(1600), "{:?}", second);
            assert!(second <= Duration::from_millis(2400), "{:?}", second);
        }
    }

    #[test]
    fn reset_restores_budget() {
        let mut backoff = Backoff::new(config(0.0));
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn zero_budget_retries_forever() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_failures: 0,
            ..config(0.0)
        });
        assert!((0..100).all(|_| backoff.next_delay().is_some()));
    }
}
