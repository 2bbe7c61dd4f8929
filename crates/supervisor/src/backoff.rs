//! Reconnect backoff.

use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
const GROWTH: f64 = 1.5;

/// Delay before the next connection attempt. Grows by half after every
/// unsuccessful run and resets once a run reaches `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record one more unsuccessful run.
    pub fn advance(&mut self) {
        self.current = self.current.mul_f64(GROWTH).min(MAX_BACKOFF);
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    #[case(13)]
    #[case(14)]
    #[case(40)]
    fn delay_after_n_failures(#[case] failures: i32) {
        let mut backoff = Backoff::new();
        for _ in 0..failures {
            backoff.advance();
        }
        let expected = GROWTH.powi(failures).min(MAX_BACKOFF.as_secs_f64());
        assert!(
            (backoff.current().as_secs_f64() - expected).abs() < 1e-6,
            "{failures}: {:?} vs {expected}",
            backoff.current()
        );
    }

    #[test]
    fn reset_returns_to_one_second() {
        let mut backoff = Backoff::new();
        backoff.advance();
        backoff.advance();
        backoff.reset();
        assert_eq!(backoff.current(), INITIAL_BACKOFF);
    }
}
