//! Fail-open utilities for recovered failures
//!
//! Deploy-path steps that must never take the supervisor down (status
//! writes, rollbacks, best-effort cleanup) run through these helpers: the
//! error is logged via `tracing::warn!` and the caller gets `None`.
//!
//! DO NOT use fail-open for:
//! - Launching the worker (start failures must propagate)
//! - Acquiring the deploy lock (contention is a distinct outcome)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an operation that should fail open, logging the error on failure
///
/// # Usage
///
/// ```
/// use turbot_core::fail_open::fail_open;
/// use turbot_core::{Result, TurbotError};
///
/// fn write_marker() -> Result<()> {
///     Err(TurbotError::Other("disk full".to_string()))
/// }
///
/// assert_eq!(fail_open("write_marker", write_marker), None);
/// ```
pub fn fail_open<F, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Result<T>,
{
    match f() {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Async variant of [`fail_open`]
pub async fn fail_open_async<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TurbotError;

    #[test]
    fn test_fail_open_success() {
        let result = fail_open("test_op", || Ok::<_, TurbotError>(42));
        assert_eq!(result, Some(42));
    }

    #[test]
    fn test_fail_open_failure() {
        let result = fail_open("test_op", || {
            Err::<i32, _>(TurbotError::Other("test error".to_string()))
        });
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fail_open_async_success() {
        let result = fail_open_async("test_op", || async { Ok::<_, TurbotError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_async_failure() {
        let result = fail_open_async("test_op", || async {
            Err::<i32, _>(TurbotError::GitCommand("reset failed".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
