use rand::Rng;
use std::time::Duration;

/// Retry delay policy: `base * 2^attempt`, capped at `max`, plus up to
/// `jitter` of uniformly random extra wait.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let extra = if jitter_ms > 0 {
            rng.gen_range(0..=jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(extra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_doubles_until_cap() {
        let backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::ZERO,
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay_with_rng(1, &mut rng), Duration::from_secs(2));
        assert_eq!(backoff.delay_with_rng(2, &mut rng), Duration::from_secs(4));
        assert_eq!(backoff.delay_with_rng(3, &mut rng), Duration::from_secs(8));
        assert_eq!(backoff.delay_with_rng(5, &mut rng), Duration::from_secs(30));
        assert_eq!(backoff.delay_with_rng(40, &mut rng), Duration::from_secs(30));
    }

    #[test]
    fn jitter_adds_bounded_extra_wait() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..=3 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            let floor = Duration::from_secs(1u64 << attempt);
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_secs(1));
        }
    }

    #[test]
    fn immediate_never_waits() {
        let backoff = Backoff::immediate();
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }
}
