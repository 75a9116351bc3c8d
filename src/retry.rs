use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::enrich::{Enricher, EnrichmentResult};
use crate::error::EnrichError;

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Constant(Duration),
    /// `base * 2^(attempt-1)`, capped.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant(d) => *d,
            Backoff::Exponential { base, cap } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(*cap)
            }
        }
    }
}

/// Bounded retry around one enrichment call. Exhaustion yields the
/// enricher's fallback value instead of an error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    /// Run attempts until one succeeds, a non-retryable error occurs, or
    /// `max_attempts` is reached. Returns `None` only when cancelled before
    /// an outcome was reached.
    pub async fn execute<E: Enricher>(
        &self,
        enricher: &E,
        index: usize,
        input: &str,
        cancel: &CancellationToken,
    ) -> Option<EnrichmentResult<E::Output>> {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return None;
            }

            let outcome = match tokio::time::timeout(self.call_timeout, enricher.enrich(input)).await
            {
                Ok(r) => r,
                Err(_) => Err(EnrichError::Timeout(self.call_timeout)),
            };

            let err = match outcome {
                Ok(value) => return Some(EnrichmentResult::Success(value)),
                Err(e) => e,
            };

            if !err.is_retryable() {
                debug!(stage = enricher.name(), index, error = %err, "not retryable, using fallback");
                return Some(EnrichmentResult::Failure(enricher.fallback()));
            }
            if attempt == max_attempts {
                warn!(
                    stage = enricher.name(),
                    index,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted, using fallback"
                );
                break;
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                stage = enricher.name(),
                index,
                attempt,
                max_attempts,
                error = %err,
                "attempt failed, retrying in {:.1}s",
                delay.as_secs_f64()
            );
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Some(EnrichmentResult::Failure(enricher.fallback()))
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::translate::Translation;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with the given error, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> EnrichError,
        hang: bool,
    }

    impl Flaky {
        fn new(failures: u32, error: fn() -> EnrichError) -> Self {
            Flaky {
                calls: AtomicU32::new(0),
                failures,
                error,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl Enricher for Flaky {
        type Output = Translation;

        fn name(&self) -> &'static str {
            "flaky"
        }

        fn input_column(&self) -> &'static str {
            "Name"
        }

        fn fallback(&self) -> Translation {
            Translation("fallback".into())
        }

        async fn enrich(&self, input: &str) -> Result<Translation, EnrichError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(Translation(input.to_uppercase()))
            }
        }
    }

    fn remote() -> EnrichError {
        EnrichError::Status {
            status: 503,
            body: "busy".into(),
        }
    }

    fn local() -> EnrichError {
        EnrichError::Input("bad".into())
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Constant(Duration::ZERO),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn always_failing_uses_exactly_max_attempts() {
        let f = Flaky::new(u32::MAX, remote);
        let r = policy(10).execute(&f, 0, "x", &CancellationToken::new()).await;
        assert_eq!(r, Some(EnrichmentResult::Failure(Translation("fallback".into()))));
        assert_eq!(f.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let f = Flaky::new(2, remote);
        let r = policy(10).execute(&f, 0, "cup", &CancellationToken::new()).await;
        assert_eq!(r, Some(EnrichmentResult::Success(Translation("CUP".into()))));
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn input_errors_fail_fast() {
        let f = Flaky::new(u32::MAX, local);
        let r = policy(100).execute(&f, 0, "x", &CancellationToken::new()).await;
        assert!(matches!(r, Some(EnrichmentResult::Failure(_))));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_attempts() {
        let mut f = Flaky::new(0, remote);
        f.hang = true;
        let p = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Constant(Duration::ZERO),
            call_timeout: Duration::from_millis(10),
        };
        let r = p.execute(&f, 0, "x", &CancellationToken::new()).await;
        assert!(matches!(r, Some(EnrichmentResult::Failure(_))));
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let f = Flaky::new(u32::MAX, remote);
        let p = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Constant(Duration::from_secs(3600)),
            call_timeout: Duration::from_secs(5),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert_eq!(p.execute(&f, 0, "x", &cancel).await, None);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let b = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(5),
        };
        assert_eq!(b.delay(1), Duration::from_secs(1));
        assert_eq!(b.delay(3), Duration::from_secs(4));
        assert_eq!(b.delay(4), Duration::from_secs(5));
        assert_eq!(b.delay(40), Duration::from_secs(5));
    }
}
