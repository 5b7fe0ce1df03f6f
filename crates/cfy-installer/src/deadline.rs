use std::time::Duration;

use tokio::time::Instant;

/// An absolute point in time an installation attempt must finish by.
///
/// Computed once from the caller's timeout. Every blocking step is handed
/// [`Deadline::remaining`], so time spent in one step shrinks the budget of
/// the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            end: Instant::now() + timeout,
        }
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_shrinks_with_elapsed_time() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert_eq!(deadline.remaining(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
