use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::StoreError;

/// Retry behaviour shared by every store adapter.
///
/// The default is one reconnect-and-retry: a failed operation is attempted a second time on a
/// fresh connection, and a second failure is returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first attempt.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy's attempts
/// are used up. `seed` spreads jitter so concurrent callers don't retry in lockstep.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    seed: i64,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = compute_backoff_delay(policy, attempt, seed);
                warn!(
                    event = "store_retry",
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "store operation failed; retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, seed: i64) -> Duration {
    if policy.initial_backoff.is_zero() && policy.jitter.is_zero() {
        return Duration::ZERO;
    }

    let shift = attempt.saturating_sub(1).min(20);
    let exponential_ms = policy
        .initial_backoff
        .as_millis()
        .saturating_mul(1u128 << shift);
    let capped_ms = exponential_ms.min(policy.max_backoff.as_millis());
    let jitter_ms = deterministic_jitter(seed, attempt, policy.jitter.as_millis());

    let total_ms = capped_ms.saturating_add(jitter_ms);
    Duration::from_millis(total_ms.min(u64::MAX as u128) as u64)
}

fn deterministic_jitter(seed: i64, attempt: u32, jitter_cap: u128) -> u128 {
    if jitter_cap == 0 {
        return 0;
    }

    // splitmix64 finalizer
    let mut x = (seed as u64) ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;

    (x as u128) % (jitter_cap + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..RetryPolicy::no_retry()
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once_by_default_shape() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&instant_policy(2), "query", 1, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    Err(StoreError::Connection("broken pipe".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_propagates() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&instant_policy(2), "query", 1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Connection("refused".into())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = run_with_retry(&instant_policy(5), "insert", 1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::Rejected {
                    code: 101,
                    desc: "no support command".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Rejected { code: 101, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };
        assert_eq!(compute_backoff_delay(&policy, 1, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff_delay(&policy, 2, 0), Duration::from_millis(200));
        assert_eq!(compute_backoff_delay(&policy, 3, 0), Duration::from_millis(350));
    }

    #[test]
    fn jitter_is_bounded_and_deterministic() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        };
        for seed in 0..50 {
            let delay = compute_backoff_delay(&policy, 1, seed);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(15));
            assert_eq!(delay, compute_backoff_delay(&policy, 1, seed));
        }
    }
}
