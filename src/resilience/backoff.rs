//! Exponential backoff for transient accept failures.

use std::time::Duration;

const INITIAL: Duration = Duration::from_millis(10);
const MAX: Duration = Duration::from_secs(1);

/// Backoff schedule used by the accept loops: 10 ms on the first transient
/// error, doubling per occurrence, clamped at 1 s, reset on any success or
/// timeout-class error.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to sleep for the transient error that just occurred.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => INITIAL,
            Some(current) => MAX.min(current * 2),
        };
        self.delay = Some(next);
        next
    }

    /// Forget accumulated failures.
    pub fn reset(&mut self) {
        self.delay = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_clamps() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = AcceptBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
