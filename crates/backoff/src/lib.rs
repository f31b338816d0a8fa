use std::{
    cmp,
    ops::Div,
    time::Duration,
};

use rand::Rng;

/// Exponential backoff with full jitter, as used by every reconnect/retry
/// loop in the worker (broker reconnects, lock contention, transient store
/// errors). See https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    /// Ensures that fail will return the max_backoff value the next time it is
    /// called.
    pub fn max_backoff(&mut self) {
        self.num_failures = u32::MAX.div(2);
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.random::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::Backoff;

    #[test]
    fn backoff_grows_and_caps() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let d = backoff.fail(&mut rng);
            assert!(d <= Duration::from_secs(1));
            last = d;
        }
        assert!(last <= Duration::from_secs(1));
    }

    #[test]
    fn reset_restarts_from_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        backoff.fail(&mut rng);
        backoff.fail(&mut rng);
        assert_eq!(backoff.failures(), 2);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }
}
