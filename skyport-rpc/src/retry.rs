use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{ClientError, RpcError, WireErrorCode};

/// Classifies a failed attempt of a remote call.
pub trait Retryable {
    /// `false` when repeating the same request cannot succeed, e.g. the remote
    /// reported the target as unknown or the input as invalid.
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{target}: cancelled after {attempts} attempt(s)")]
    Cancelled {
        target: Box<str>,
        attempts: u32,
        last: Option<E>,
    },
    #[error("{target}: failed after {attempts} attempt(s): {source}")]
    Exhausted {
        target: Box<str>,
        attempts: u32,
        #[source]
        source: E,
    },
    #[error("{target}: {source}")]
    Rejected {
        target: Box<str>,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The last concrete error returned by the target, if any attempt completed.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Cancelled { last, .. } => last,
            RetryError::Exhausted { source, .. } | RetryError::Rejected { source, .. } => {
                Some(source)
            }
        }
    }

    pub fn last(&self) -> Option<&E> {
        match self {
            RetryError::Cancelled { last, .. } => last.as_ref(),
            RetryError::Exhausted { source, .. } | RetryError::Rejected { source, .. } => {
                Some(source)
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Bounded retry with linear backoff, shared by every outbound call.
///
/// Attempt `n` (starting at 1 for the first retry) waits `n * base_delay`
/// before running. `retries` bounds the retries, so a target is invoked at
/// most `retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub const fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of retries or
    /// `cancel` fires. Cancellation interrupts both the backoff wait and the
    /// in-flight attempt.
    pub async fn call<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        target: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut last: Option<E> = None;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    target: target.into(),
                    attempts: attempt,
                    last,
                });
            }

            if attempt > 0 {
                let delay = self.delay_for(attempt);
                match &last {
                    Some(err) => warn!(
                        attempt,
                        target,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying remote call"
                    ),
                    None => warn!(attempt, target, "retrying remote call"),
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled {
                            target: target.into(),
                            attempts: attempt,
                            last,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        target: target.into(),
                        attempts: attempt,
                        last,
                    });
                }
                result = op() => result,
            };

            attempt += 1;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    return Err(RetryError::Rejected {
                        target: target.into(),
                        source: err,
                    });
                }
                Err(err) if attempt > self.retries => {
                    return Err(RetryError::Exhausted {
                        target: target.into(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => last = Some(err),
            }
        }
    }
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Retryable for ClientError {
    fn is_retryable(&self) -> bool {
        match self {
            ClientError::ErrorResponse(err) => matches!(
                err.code,
                WireErrorCode::Unavailable | WireErrorCode::Internal
            ),
            ClientError::Connect(_) | ClientError::Rpc(_) | ClientError::UnexpectedResponse => {
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky(retryable={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn delays_grow_linearly() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = policy
            .call(&CancellationToken::new(), "test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Flaky(false))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = policy
            .call(&CancellationToken::new(), "test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Flaky(true))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
