//! Bounded retry with exponential backoff for I/O and storage calls

use std::time::Duration;

use crate::error::is_permanent_io;

/// Errors that can tell whether another attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        !is_permanent_io(self.kind())
    }
}

/// Retry policy: up to `max_retries` extra attempts, waiting
/// `base_delay * multiplier^(n-1)` before the n-th retry.
///
/// The default waits 1s, 5s, 25s, 125s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            multiplier: 5,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Retries without sleeping (tests, in-memory stores).
    pub const fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op`, retrying retryable errors until the policy is exhausted.
    ///
    /// Returns the first success, or the last error on exhaustion or on a
    /// non-retryable error.
    pub fn run<T, E>(&self, label: &str, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
    {
        let mut retry = 0u32;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if retry < self.max_retries && e.is_retryable() => {
                    retry += 1;
                    let wait = self.delay(retry);
                    log::debug!(
                        "{label}: attempt {retry}/{} failed: {e}, retrying in {:.0?}",
                        self.max_retries,
                        wait
                    );
                    std::thread::sleep(wait);
                }
                Err(e) => {
                    if retry > 0 {
                        log::warn!("{label}: giving up after {} attempts: {e}", retry + 1);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn default_delays() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(2), Duration::from_secs(5));
        assert_eq!(p.delay(3), Duration::from_secs(25));
        assert_eq!(p.delay(4), Duration::from_secs(125));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let out = RetryPolicy::immediate(4).run("flaky", || {
            calls += 1;
            if calls < 3 {
                Err(Error::new(ErrorKind::Interrupted, "again"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn exhausts_after_max_retries() {
        let mut calls = 0;
        let out: Result<(), Error> = RetryPolicy::immediate(4).run("down", || {
            calls += 1;
            Err(Error::new(ErrorKind::ConnectionReset, "reset"))
        });
        assert!(out.is_err());
        assert_eq!(calls, 5);
    }

    #[test]
    fn permanent_error_not_retried() {
        let mut calls = 0;
        let out: Result<(), Error> = RetryPolicy::immediate(4).run("missing", || {
            calls += 1;
            Err(Error::new(ErrorKind::NotFound, "no such file"))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn none_is_single_attempt() {
        let mut calls = 0;
        let _: Result<(), Error> = RetryPolicy::none().run("once", || {
            calls += 1;
            Err(Error::other("x"))
        });
        assert_eq!(calls, 1);
    }
}
