//! Retry with exponential backoff for remote-store calls.
//!
//! ```text
//! attempt 1 ── fail(transient) ── sleep base×2^0 ──
//! attempt 2 ── fail(transient) ── sleep base×2^1 ──
//! attempt 3 ── fail(transient) ── TransientExhausted
//! ```
//!
//! `NotFound`, `PermissionDenied` and unclassified failures are never
//! retried. Waits poll a [`Cancellation`] so a run can be interrupted or
//! bounded by a deadline mid-backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lapse_core::RetrySettings;

use crate::error::SyncError;
use crate::store::{ErrorClass, StoreError};

/// Longest single sleep between cancellation checks.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancel flag plus an optional deadline.
///
/// Clones share the flag; [`Cancellation::with_timeout`] derives a token with
/// its own deadline that still observes the parent's flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Sleep up to `duration`; returns `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            std::thread::sleep((end - now).min(SLEEP_SLICE));
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Outcome of a delete-like operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The target was already gone; counts as success.
    AlreadyAbsent,
}

/// Bounded exponential backoff: `delay = base × 2^attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }

    /// No waiting between attempts (tests, dry runs against local stores).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
        }
    }

    /// Wait after the `attempt`-th failure (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts its
    /// attempts, or `cancel` fires.
    ///
    /// `op` and `target` label the call in logs and in the returned error.
    pub fn execute<T, F>(
        &self,
        op: &'static str,
        target: &str,
        cancel: &Cancellation,
        mut operation: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled {
                    op,
                    target: target.to_string(),
                });
            }
            let err = match operation() {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            op,
                            subject = target,
                            retries = attempt,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            let target = target.to_string();
            match err.class {
                ErrorClass::Transient => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::warn!(
                            op,
                            subject = %target,
                            attempts = attempt,
                            error = %err,
                            "retries exhausted"
                        );
                        return Err(SyncError::TransientExhausted {
                            op,
                            target,
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        op,
                        subject = %target,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !cancel.sleep(delay) {
                        return Err(SyncError::Cancelled { op, target });
                    }
                }
                ErrorClass::NotFound => {
                    return Err(SyncError::NotFound {
                        op,
                        target,
                        source: err,
                    })
                }
                ErrorClass::PermissionDenied => {
                    return Err(SyncError::PermissionDenied {
                        op,
                        target,
                        source: err,
                    })
                }
                ErrorClass::Other => {
                    return Err(SyncError::Store {
                        op,
                        target,
                        source: err,
                    })
                }
            }
        }
    }

    /// [`execute`](Self::execute) for deletes: a missing target is success.
    pub fn execute_delete<F>(
        &self,
        op: &'static str,
        target: &str,
        cancel: &Cancellation,
        operation: F,
    ) -> Result<Removal, SyncError>
    where
        F: FnMut() -> Result<(), StoreError>,
    {
        match self.execute(op, target, cancel, operation) {
            Ok(()) => Ok(Removal::Removed),
            Err(SyncError::NotFound { .. }) => {
                tracing::debug!(op, subject = target, "already absent");
                Ok(Removal::AlreadyAbsent)
            }
            Err(err) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(failures: Vec<StoreError>) -> impl FnMut() -> Result<&'static str, StoreError> {
        let mut failures = failures.into_iter();
        move || match failures.next() {
            Some(err) => Err(err),
            None => Ok("ok"),
        }
    }

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    #[test]
    fn transient_then_success_is_retried() {
        let op = scripted(vec![
            StoreError::transient("reset"),
            StoreError::transient("reset"),
        ]);
        let out = RetryPolicy::immediate(3)
            .execute("list", "root", &Cancellation::new(), op)
            .expect("third attempt succeeds");
        assert_eq!(out, "ok");
    }

    #[test]
    fn transient_exhaustion_reports_attempts() {
        let mut calls = 0;
        let err = RetryPolicy::immediate(3)
            .execute("download", "a.jpg", &Cancellation::new(), || -> Result<(), _> {
                calls += 1;
                Err(StoreError::transient("tls reset"))
            })
            .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            SyncError::TransientExhausted { attempts, target, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(target, "a.jpg");
            }
            other => panic!("expected TransientExhausted, got {other:?}"),
        }
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        for (err, class) in [
            (StoreError::permission_denied("403"), ErrorClass::PermissionDenied),
            (StoreError::not_found("404"), ErrorClass::NotFound),
            (StoreError::other("400"), ErrorClass::Other),
        ] {
            let mut calls = 0;
            let mut once = Some(err);
            let result = RetryPolicy::immediate(5).execute(
                "get",
                "id-1",
                &Cancellation::new(),
                || -> Result<(), _> {
                    calls += 1;
                    Err(once.take().unwrap_or_else(|| StoreError::other("again")))
                },
            );
            assert_eq!(calls, 1);
            assert_eq!(result.unwrap_err().class(), Some(class));
        }
    }

    #[test]
    fn delete_of_missing_target_is_success() {
        let removal = RetryPolicy::immediate(3)
            .execute_delete("delete", "old.mp4", &Cancellation::new(), || {
                Err(StoreError::not_found("gone"))
            })
            .expect("idempotent delete");
        assert_eq!(removal, Removal::AlreadyAbsent);
    }

    #[test]
    fn cancelled_token_stops_before_first_attempt() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let mut calls = 0;
        let err = RetryPolicy::immediate(3)
            .execute("list", "root", &cancel, || -> Result<(), StoreError> {
                calls += 1;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(calls, 0);
        assert!(err.is_cancelled());
    }

    #[test]
    fn deadline_interrupts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
        };
        let cancel = Cancellation::new().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = policy
            .execute("upload", "v.mp4", &cancel, || -> Result<(), _> {
                Err(StoreError::transient("rate limited"))
            })
            .unwrap_err();
        assert!(err.is_cancelled(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn child_token_observes_parent_flag() {
        let parent = Cancellation::new();
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
