//! Caller-side bounded waiting.
//!
//! Delivery on the bus is asynchronous and the bus has no timeouts. Anything
//! that needs to observe an effect (a derived fact appearing, a message
//! arriving) polls with [`retry_until`] and treats exhaustion as a failure.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConvergenceError {
    #[error("condition not met after {attempts} attempts ({waited:?})")]
    #[diagnostic(
        code(cage::convergence::timeout),
        help(
            "The expected state did not appear in time. Check that the producer \
             is publishing and that the consumer is subscribed, or allow more attempts."
        )
    )]
    Timeout { attempts: u32, waited: Duration },
}

/// How many times to check and how long to sleep between checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Attempts needed to cover `total` at the given interval, at least one.
    pub fn within(total: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            let steps = (total.as_millis() / interval.as_millis().max(1)).max(1);
            u32::try_from(steps).unwrap_or(u32::MAX)
        };
        Self { attempts, interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval: Duration::from_millis(100),
        }
    }
}

/// Evaluate `check` until it returns `true`, sleeping between attempts.
pub async fn retry_until<F>(policy: RetryPolicy, mut check: F) -> Result<(), ConvergenceError>
where
    F: FnMut() -> bool,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        if check() {
            tracing::trace!(attempt, "converged");
            return Ok(());
        }
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(ConvergenceError::Timeout {
        attempts,
        waited: policy.interval.saturating_mul(attempts - 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_once_condition_holds() {
        let mut calls = 0;
        retry_until(RetryPolicy::new(5, Duration::from_millis(1)), || {
            calls += 1;
            calls == 3
        })
        .await
        .unwrap();
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn exhaustion_is_a_timeout() {
        let err = retry_until(RetryPolicy::new(3, Duration::from_millis(1)), || false)
            .await
            .unwrap_err();
        let ConvergenceError::Timeout { attempts, waited } = err;
        assert_eq!(attempts, 3);
        assert_eq!(waited, Duration::from_millis(2));
    }

    #[test]
    fn within_rounds_down_but_never_to_zero() {
        let p = RetryPolicy::within(Duration::from_millis(250), Duration::from_millis(100));
        assert_eq!(p.attempts, 2);
        let p = RetryPolicy::within(Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(p.attempts, 1);
    }

    #[test]
    fn within_saturates_huge_ratios() {
        let p = RetryPolicy::within(Duration::from_secs(u64::MAX / 2), Duration::from_millis(1));
        assert_eq!(p.attempts, u32::MAX);
        let p = RetryPolicy::within(Duration::from_millis(1 << 33), Duration::from_millis(1));
        assert_eq!(p.attempts, u32::MAX);
    }
}
