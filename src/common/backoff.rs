use std::time::Duration;

use rand::Rng;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Exponential reconnect/rate-limit delay shared by the gateway, voice and
/// REST layers.
///
/// The gateway constructs it without an attempt cap and loops forever; voice
/// sessions cap their attempts and give up once `is_exhausted` reports true.
pub struct Backoff {
    attempt: u32,
    max_attempts: Option<u32>,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: Some(max_attempts),
        }
    }

    /// Next delay: base * 2^attempt, capped, with up to +25% jitter so a
    /// fleet of sessions does not reconnect in lockstep.
    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        let exp = BACKOFF_BASE_MS.saturating_mul(2u64.pow((self.attempt - 1).min(5)));
        let capped = exp.min(BACKOFF_CAP_MS);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..4 {
            let d = backoff.next();
            assert!(d >= last, "delay shrank: {d:?} < {last:?}");
            last = d;
        }
        for _ in 0..10 {
            // Cap plus max jitter.
            assert!(backoff.next() <= Duration::from_millis(BACKOFF_CAP_MS * 5 / 4));
        }
    }

    #[test]
    fn reset_restarts_the_ladder() {
        let mut backoff = Backoff::new();
        for _ in 0..6 {
            backoff.next();
        }
        backoff.reset();
        assert!(backoff.next() <= Duration::from_millis(BACKOFF_BASE_MS * 5 / 4));
    }

    #[test]
    fn uncapped_backoff_never_exhausts() {
        let mut backoff = Backoff::new();
        for _ in 0..100 {
            backoff.next();
        }
        assert!(!backoff.is_exhausted());

        let mut capped = Backoff::with_max_attempts(3);
        for _ in 0..3 {
            capped.next();
        }
        assert!(capped.is_exhausted());
    }
}
