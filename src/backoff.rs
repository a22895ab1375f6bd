use std::time::Duration;

use rand::RngExt;

/// Computes the wait before the next attempt.
pub trait Backoff: Send + Sync {
    /// Delay after the 1-based `attempt` failed, or `None` to stop retrying.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Option<Duration> + Send + Sync,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self(attempt)
    }
}

#[derive(Clone, Debug)]
pub struct FixedBackoff {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn no_delay() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Stops retrying once `max_attempts` attempts have run.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if within_limit(self.max_attempts, attempt) {
            Some(self.delay)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn standard() -> Self {
        Self {
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            jitter_ratio: 0.2,
            max_attempts: None,
        }
    }

    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff.max(Duration::from_millis(1));
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    fn unjittered(&self, attempt: u32) -> Duration {
        let capped_exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        Duration::from_millis(delay_ms)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::standard()
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !within_limit(self.max_attempts, attempt) {
            return None;
        }
        Some(self.apply_jitter(self.unjittered(attempt)))
    }
}

fn within_limit(max_attempts: Option<u32>, attempt: u32) -> bool {
    match max_attempts {
        Some(limit) => attempt < limit,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let backoff = ExponentialBackoff::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            let delay = backoff.next_delay(3).expect("unbounded");
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = ExponentialBackoff::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(1))
            .jitter_ratio(0.0);

        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(10), Some(Duration::from_secs(1)));
    }

    #[test]
    fn attempt_limit_stops_retrying() {
        let backoff = FixedBackoff::new(Duration::from_millis(50)).max_attempts(2);
        assert_eq!(backoff.next_delay(1), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next_delay(2), None);
    }

    #[test]
    fn closures_are_backoffs() {
        let backoff = |attempt: u32| (attempt < 3).then(|| Duration::from_millis(u64::from(attempt)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_millis(2)));
        assert_eq!(backoff.next_delay(3), None);
    }
}
