// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded in-task retries for collaborator calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero behaves as one.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are spent. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(Error::TransientInfrastructure(msg)) if attempt < attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        error = %msg,
                        "Transient failure, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let value = policy
            .run("find dock", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::TransientInfrastructure("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, Duration::from_millis(100));

        let err = policy
            .run("create container", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::TransientInfrastructure("down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transient_infrastructure");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let err = policy
            .run("create container", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Rejected("no such image".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rejected");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
