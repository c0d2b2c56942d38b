// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bounded retry and polling primitives.
//!
//! - [`retry_on_conflict`] re-runs a read-modify-write closure while the
//!   cluster store reports a resource version conflict.
//! - [`poll_until`] probes on a fixed interval until a value is produced, the
//!   bound elapses, or the shutdown token fires.

use crate::domain::cluster::ClusterError;
use crate::domain::mount::MountError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors that can report an optimistic-concurrency conflict.
pub trait ConflictAware {
    fn is_conflict(&self) -> bool;
}

impl ConflictAware for ClusterError {
    fn is_conflict(&self) -> bool {
        ClusterError::is_conflict(self)
    }
}

impl ConflictAware for MountError {
    fn is_conflict(&self) -> bool {
        matches!(self, MountError::Cluster(e) if e.is_conflict())
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub steps: u32,
    pub initial: Duration,
    pub factor: f64,
}

impl Backoff {
    /// 4 attempts starting at 10ms, growing 5x.
    pub const STANDARD: Backoff = Backoff {
        steps: 4,
        initial: Duration::from_millis(10),
        factor: 5.0,
    };
}

impl Default for Backoff {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// backoff is exhausted. The closure must re-read the object each time.
pub async fn retry_on_conflict<T, E, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T, E>
where
    E: ConflictAware,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = backoff.initial;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < backoff.steps => {
                debug!(attempt, "conflict on update, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(backoff.factor);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Why [`poll_until`] stopped without a value.
#[derive(Debug)]
pub enum WaitError<E> {
    /// The bound elapsed or shutdown was requested.
    TimedOut(Duration),
    /// The probe returned a hard error.
    Failed(E),
}

/// Probe every `interval` until it yields `Some`, for at most `bound`.
pub async fn poll_until<T, E, F, Fut>(
    bound: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + bound;
    loop {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => return Err(WaitError::Failed(e)),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut(now - started));
        }
        let nap = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::TimedOut(started.elapsed())),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, ClusterError> = retry_on_conflict(&Backoff::STANDARD, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ClusterError::Conflict("pod".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let backoff = Backoff {
            steps: 3,
            initial: Duration::from_millis(1),
            factor: 1.0,
        };
        let result: Result<(), ClusterError> = retry_on_conflict(&backoff, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::Conflict("pod".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ClusterError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), ClusterError> = retry_on_conflict(&Backoff::STANDARD, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::NotFound("pod".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(ClusterError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<(), WaitError<()>> =
            poll_until(Duration::from_millis(30), Duration::from_millis(5), &cancel, || async { Ok(None) }).await;
        assert!(matches!(result, Err(WaitError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_poll_until_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        let result: Result<(), WaitError<()>> =
            poll_until(Duration::from_secs(60), Duration::from_secs(1), &cancel, || async { Ok(None) }).await;
        assert!(matches!(result, Err(WaitError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_poll_until_returns_value() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, WaitError<()>> =
            poll_until(Duration::from_secs(1), Duration::from_millis(1), &cancel, || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Ok((n == 2).then_some(n))
                }
            })
            .await;
        assert_eq!(result.ok(), Some(2));
    }
}
