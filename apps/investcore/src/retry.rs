use std::time::Duration;

use crate::error::CoreError;

/// Exponential backoff with deterministic jitter for the Job Store's
/// `Fail(job_id, error, retryable)` path (§4.A): base 30s, cap 30m. Jitter is
/// derived from the attempt counter rather than wall-clock randomness so
/// retry scheduling stays reproducible in tests.
pub fn backoff(attempt: u32, base_seconds: u64, cap_seconds: u64) -> Duration {
    let exp = base_seconds.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(cap_seconds);
    let jitter = u64::from(attempt) * 7 % 11;
    Duration::from_secs(capped.saturating_add(jitter))
}

/// The inbound-side bounded retry executor used by Webhook Intake (§4.F) and
/// by adapter callers: 3 attempts, base 500ms, cap 5s, exponential. Retry
/// decisions dispatch on `CoreError::is_retryable`, never on message text.
pub async fn retry_with_backoff<F, Fut, T>(max_attempts: u32, mut call: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    const BASE_MS: u64 = 500;
    const CAP_MS: u64 = 5_000;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay_ms = (BASE_MS.saturating_mul(1u64 << (attempt - 1))).min(CAP_MS);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_monotonic_until_cap() {
        let b1 = backoff(1, 30, 1_800);
        let b2 = backoff(2, 30, 1_800);
        let b5 = backoff(10, 30, 1_800);
        assert!(b1.as_secs() < b2.as_secs());
        assert!(b5.as_secs() <= 1_800 + 10);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_with_backoff(3, || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(CoreError::UpstreamTransient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), CoreError> = retry_with_backoff(3, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Err(CoreError::UpstreamPermanent("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
