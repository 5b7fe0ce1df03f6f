//! Waiting for a freshly installed agent to join the grid.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::deadline::Deadline;

pub type MembershipError = Box<dyn std::error::Error + Send + Sync>;

/// Answers whether the agent on `host` has registered with the grid.
#[async_trait]
pub trait GridMembership: Send + Sync {
    async fn is_agent_registered(&self, host: &str) -> Result<bool, MembershipError>;
}

/// Poll `membership` every `interval` until the agent on `host` is
/// registered (true) or the deadline passes (false). Query errors count as
/// not registered yet.
pub async fn wait_for_registration(
    membership: &dyn GridMembership,
    host: &str,
    interval: Duration,
    deadline: Deadline,
) -> bool {
    loop {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, membership.is_agent_registered(host)).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) => debug!(host, "agent not registered yet"),
            Ok(Err(e)) => debug!(host, error = %e, "registration query failed"),
            Err(_) => return false,
        }
        let pause = interval.min(deadline.remaining());
        if pause.is_zero() {
            return false;
        }
        tokio::time::sleep(pause).await;
    }
}
