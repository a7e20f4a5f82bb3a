//! Delay schedule used by recovery jobs between rebind attempts.

use std::time::Duration;

/// Returned by [`BackoffPolicy::fixed_with_initial_delay_and_timeout`] when the
/// configured timeout is shorter than the initial delay it's supposed to bound.
#[derive(Debug, thiserror::Error)]
#[error("backoff timeout {timeout:?} is shorter than initial delay {initial:?}")]
pub struct BackoffConfigError {
    initial: Duration,
    timeout: Duration,
}

/// A distinguished delay meaning "stop retrying", numerically the maximum
/// representable `Duration`. Callers compare against this with
/// [`BackoffPolicy::is_timeout`] rather than matching on `Duration::MAX` directly,
/// so the sentinel can change representation without touching call sites.
pub const TIMEOUT: Duration = Duration::MAX;

/// Supplies the delay to wait before recovery attempt `k` (`k` starting at 1).
///
/// Unlike the source system, where the "first attempt" flag was a one-shot
/// atomic on the policy instance itself (making a shared policy's initial delay
/// fire exactly once across its whole lifetime, not once per recovery job), this
/// policy is stateless: the attempt counter is threaded through by the caller,
/// so one `BackoffPolicy` value can safely back any number of concurrent
/// recovery jobs.
#[derive(Debug, Clone, Copy)]
pub enum BackoffPolicy {
    /// Every attempt waits the same delay, forever.
    Fixed(Duration),
    /// The first attempt waits `initial`; every attempt after that waits `fixed`,
    /// forever.
    FixedWithInitialDelay {
        /// Delay before the first attempt.
        initial: Duration,
        /// Delay before every attempt after the first.
        fixed: Duration,
    },
    /// Like `FixedWithInitialDelay`, but gives up (returns [`TIMEOUT`]) once
    /// `max_attempts` attempts have been made.
    FixedWithInitialDelayAndTimeout {
        /// Delay before the first attempt.
        initial: Duration,
        /// Delay before every attempt after the first, until `max_attempts`.
        fixed: Duration,
        /// Number of attempts after which [`TIMEOUT`] is returned.
        max_attempts: u32,
    },
}

impl BackoffPolicy {
    /// Returns `delay` for every attempt.
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed(delay)
    }

    /// Returns `initial` for the first attempt and `fixed` for every attempt
    /// after that.
    pub fn fixed_with_initial_delay(initial: Duration, fixed: Duration) -> Self {
        BackoffPolicy::FixedWithInitialDelay { initial, fixed }
    }

    /// Returns `initial` then `fixed`, up to
    /// `N = floor((timeout - initial) / fixed) + 1` attempts, after which
    /// [`TIMEOUT`] is returned. Rejects a `timeout` shorter than `initial`.
    pub fn fixed_with_initial_delay_and_timeout(
        initial: Duration,
        fixed: Duration,
        timeout: Duration,
    ) -> Result<Self, BackoffConfigError> {
        if timeout < initial {
            return Err(BackoffConfigError { initial, timeout });
        }
        let remaining = timeout - initial;
        let extra_attempts = if fixed.is_zero() {
            u32::MAX
        } else {
            (remaining.as_nanos() / fixed.as_nanos().max(1)) as u32
        };
        let max_attempts = extra_attempts.saturating_add(1);
        Ok(BackoffPolicy::FixedWithInitialDelayAndTimeout {
            initial,
            fixed,
            max_attempts,
        })
    }

    /// The delay to wait before attempt `attempt` (1-based). May return
    /// [`TIMEOUT`]; check with [`BackoffPolicy::is_timeout`].
    pub fn delay(&self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 1, "recovery attempts are 1-based");
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::FixedWithInitialDelay { initial, fixed } => {
                if attempt <= 1 {
                    initial
                } else {
                    fixed
                }
            }
            BackoffPolicy::FixedWithInitialDelayAndTimeout {
                initial,
                fixed,
                max_attempts,
            } => {
                if attempt > max_attempts {
                    TIMEOUT
                } else if attempt <= 1 {
                    initial
                } else {
                    fixed
                }
            }
        }
    }

    /// Whether `delay` is the [`TIMEOUT`] sentinel.
    pub fn is_timeout(delay: Duration) -> bool {
        delay == TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_never_times_out() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(50));
        for attempt in 1..=1000 {
            assert_eq!(policy.delay(attempt), Duration::from_millis(50));
        }
    }

    #[test]
    fn initial_delay_fires_once_per_call_not_per_instance() {
        let policy =
            BackoffPolicy::fixed_with_initial_delay(Duration::from_millis(10), Duration::from_millis(20));
        // Two independent "jobs" reusing the same policy value both see the
        // initial delay on their own first attempt.
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
    }

    #[test]
    fn timeout_rejects_short_timeout() {
        let err = BackoffPolicy::fixed_with_initial_delay_and_timeout(
            Duration::from_millis(100),
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert_eq!(err.initial, Duration::from_millis(100));
    }

    #[test]
    fn timeout_sentinel_after_exhausting_attempts() {
        let policy = BackoffPolicy::fixed_with_initial_delay_and_timeout(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(35),
        )
        .unwrap();
        // N = floor((35-10)/10) + 1 = 2 + 1 = 3 attempts before giving up.
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(10));
        assert_eq!(policy.delay(3), Duration::from_millis(10));
        assert!(BackoffPolicy::is_timeout(policy.delay(4)));
    }
}
