//! The retry primitive shared by the ACME adapter and both client modes
//! (spec §4.5), ported from `utils.Retry`.
//!
//! Fixed 15 s sleep between attempts, no jitter (spec §9 Open Questions:
//! preserved intentionally). Any attempt that fails in under the minimum
//! dwell time trips the "too fast" guard and aborts the whole retry budget
//! immediately, rather than burning it in a tight loop.

use std::time::{Duration, Instant};

use crate::error::Error;

pub const RETRY_SLEEP: Duration = Duration::from_secs(15);
pub const MIN_DWELL: Duration = Duration::from_secs(1);

/// Runs `work` up to `retry_count + 1` times (one initial attempt plus
/// `retry_count` retries). `retry_count = 0` returns the first error unchanged.
pub async fn retry<F, Fut, T>(retry_count: u32, mut work: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempts = 0u32;
    let mut last_err: Option<Error> = None;

    loop {
        let started = Instant::now();
        match work().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempts += 1;
                let elapsed = started.elapsed();
                tracing::warn!(attempt = attempts, error = %e, "retry attempt failed");

                if elapsed < MIN_DWELL {
                    return Err(Error::RetryExhausted { attempts, last: e.to_string() });
                }
                last_err = Some(e);

                if attempts > retry_count {
                    break;
                }
                tokio::time::sleep(RETRY_SLEEP).await;
            }
        }
    }

    Err(Error::RetryExhausted {
        attempts,
        last: last_err.map(|e| e.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn zero_retries_returns_first_error_unchanged() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = retry(0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::AcmeTransient("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn too_fast_failure_aborts_before_exhausting_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = retry(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::AcmeTransient("fast failure".into())) }
        })
        .await;
        assert!(result.is_err());
        // the guard must trip on the very first fast failure, not burn the budget
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
