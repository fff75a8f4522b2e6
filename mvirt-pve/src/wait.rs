//! Bounded status polling.
//!
//! Both loops are sequential: one status read per attempt, one sleep between
//! attempts, and no way out other than success or running out of attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clients::PveApi;
use crate::descriptor::{ResourceRef, ResourceStatus};

/// Source of delays. Swapped out in tests to observe waits without sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl<T: Clock + ?Sized> Clock for Arc<T> {
    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

/// Polls a guest's `status/current` until a condition holds.
pub struct StatusPoller<'a, A: ?Sized, C: ?Sized> {
    api: &'a A,
    clock: &'a C,
    interval: Duration,
}

impl<'a, A, C> StatusPoller<'a, A, C>
where
    A: PveApi + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(api: &'a A, clock: &'a C, interval: Duration) -> Self {
        Self {
            api,
            clock,
            interval,
        }
    }

    /// Wait until a status read goes through.
    ///
    /// A read failing with a timeout or conflict means the guest is still
    /// locked. Any other failure fails open: it is logged and `true` is
    /// returned right away, leaving the next remote call to surface it.
    /// Returns `false` once `max_attempts` reads all reported a lock.
    pub async fn wait_for_unlock(&self, target: &ResourceRef, max_attempts: u32) -> bool {
        for attempt in 1..=max_attempts {
            match self.api.current_status(target).await {
                Ok(_) => {
                    debug!(guest = %target, attempt, "Guest is unlocked");
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    info!(
                        guest = %target,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Guest still locked, waiting"
                    );
                }
                Err(e) => {
                    warn!(
                        guest = %target,
                        error = %e,
                        "Unexpected error while waiting for unlock, assuming unlocked"
                    );
                    return true;
                }
            }

            if attempt < max_attempts {
                self.clock.sleep(self.interval).await;
            }
        }

        warn!(guest = %target, max_attempts, "Guest still locked after all attempts");
        false
    }

    /// Wait until the guest reports `stopped`.
    ///
    /// Read failures are logged and count as a spent attempt.
    pub async fn wait_for_stop(&self, target: &ResourceRef, max_attempts: u32) -> bool {
        for attempt in 1..=max_attempts {
            match self.api.current_status(target).await {
                Ok(report) => {
                    let status = report.run_status();
                    debug!(guest = %target, attempt, %status, "Polled guest status");
                    if status == ResourceStatus::Stopped {
                        info!(guest = %target, "Guest stopped");
                        return true;
                    }
                }
                Err(e) => {
                    warn!(guest = %target, attempt, error = %e, "Failed to read guest status");
                }
            }

            if attempt < max_attempts {
                self.clock.sleep(self.interval).await;
            }
        }

        warn!(guest = %target, max_attempts, "Guest did not stop in time");
        false
    }
}
