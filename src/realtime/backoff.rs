use std::time::Duration;

use rand::Rng;

use crate::config::RealtimeConfig;

/// Exponential reconnection backoff with a fixed attempt ceiling.
///
/// Attempt `n` (1-based) waits `initial * 2^(n-1)`, capped at `max`, plus up
/// to `jitter * delay` of random extra.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(
            config.reconnect_initial_delay,
            config.reconnect_max_delay,
            config.reconnect_attempts,
            config.reconnect_jitter,
        )
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;

        let base = self.base_delay(self.attempt);
        if self.jitter == 0.0 {
            return Some(base);
        }
        let extra = base.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        Some((base + extra).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 5, 0.0);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2, 0.0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 3, 0.5);
        for expected in [1_000u64, 2_000, 4_000] {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(expected));
            assert!(delay <= Duration::from_millis(expected * 3 / 2));
        }
    }

    #[test]
    fn zero_attempts_never_retries() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 0, 0.0);
        assert_eq!(backoff.next_delay(), None);
    }
}
