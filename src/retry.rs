use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Base delay for the first negative acknowledgment
pub const NAK_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for any redelivery delay
pub const NAK_MAX_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff with jitter for a delivery attempt (1-based)
///
/// The delay doubles per attempt starting at `base`, is capped at `cap`,
/// and is then jittered into the upper half (`[d/2, d]`) so that
/// redeliveries of a burst of failures spread out.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let raw = base.saturating_mul(1u32 << exponent).min(cap);

    let millis = raw.as_millis() as u64;
    if millis < 2 {
        return raw;
    }
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
    Duration::from_millis(jittered)
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures
///
/// Returns the last error when every attempt fails.
///
/// # Example
///
/// ```ignore
/// retry_fixed(10, Duration::from_secs(3), "ensure bucket", || store.ensure_bucket("logs")).await?;
/// ```
pub async fn retry_fixed<F, Fut, T, E>(
    attempts: u32,
    delay: Duration,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                tracing::error!(
                    operation = operation,
                    attempts = attempts,
                    error = %e,
                    "Giving up after repeated failures"
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
