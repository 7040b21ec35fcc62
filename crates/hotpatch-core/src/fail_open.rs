//! Fail-open utilities for best-effort side effects
//!
//! The audit log, conversation memory and automatic snapshots are recorded
//! around the propose/confirm pipeline but are not part of its outcome. A
//! failure there is logged and dropped.
//!
//! DO NOT use fail-open for:
//! - Blob store reads and writes
//! - Transform calls
//! - Proposal store mutations

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run a best-effort operation, logging and discarding any error
///
/// Returns `None` when the operation failed.
///
/// ```no_run
/// use hotpatch_core::fail_open::fail_open;
/// use hotpatch_core::Result;
///
/// async fn append_audit() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("audit::append", || append_audit()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
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

/// Like [`fail_open`] but retries up to `max_attempts` times
///
/// Waits `50ms * attempt` between attempts. Used for appends that can race
/// with another writer on the same file.
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_attempts: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) if attempt == max_attempts => {
                warn!(
                    "{} failed after {} attempts (fail-open): {}",
                    operation_name, max_attempts, e
                );
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                let delay_ms = 50 * attempt as u64;
                tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
    None
}
