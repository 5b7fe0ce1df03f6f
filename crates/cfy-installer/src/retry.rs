use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::deadline::Deadline;

/// Classifies errors a retry loop may try again after.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// How a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-transient error; returned on first sight.
    Permanent(E),
    /// `max_attempts` transient failures in a row.
    Exhausted { last: E, attempts: u32 },
    /// The deadline ran out, possibly mid-attempt.
    DeadlineExceeded { last: Option<E>, attempts: u32 },
}

/// Delay schedule for retrying transient connection failures.
///
/// Attempts are bounded by `max_attempts` (if set) and always by the
/// caller's [`Deadline`]: a sleep that would cross the deadline is not
/// taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// Fixed 5 second pause between attempts, bounded only by the deadline.
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(5),
            multiplier: 1,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
        }
    }

    /// Delay after the `attempt`th (1-based) failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay.max(self.initial_delay))
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `op` receives the time remaining before the deadline and is also
    /// cut off when the deadline passes. `on_retry` is called before each
    /// sleep with the failed attempt number, the error and the delay.
    pub async fn retry<T, E, F, Fut>(
        &self,
        deadline: Deadline,
        mut op: F,
        mut on_retry: impl FnMut(u32, &E, Duration),
    ) -> Result<T, RetryError<E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;
        let mut last = None;
        loop {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Err(RetryError::DeadlineExceeded { last, attempts });
            }

            attempts += 1;
            let err = match tokio::time::timeout(remaining, op(remaining)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(RetryError::Permanent(e)),
                Ok(Err(e)) => e,
                Err(_) => return Err(RetryError::DeadlineExceeded { last, attempts }),
            };

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(RetryError::Exhausted { last: err, attempts });
            }

            let delay = self.delay_for(attempts);
            if delay >= deadline.remaining() {
                return Err(RetryError::DeadlineExceeded {
                    last: Some(err),
                    attempts,
                });
            }

            debug!(attempt = attempts, error = %err, ?delay, "transient failure, retrying");
            on_retry(attempts, &err, delay);
            last = Some(err);
            tokio::time::sleep(delay).await;
        }
    }
}
