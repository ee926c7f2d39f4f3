//! Bounded retry with exponential backoff for LLM provider calls.
//!
//! HTTP calls to generation providers fail transiently (rate limits,
//! gateway timeouts). A failed call is retried a small, fixed number of
//! times with a growing delay; exhaustion surfaces the last error so the
//! caller sees the provider failure, not a retry artifact.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Exponential backoff state. The delay is multiplied after each
/// `next_delay()` call, capped at `max_delay`.
pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Number of consecutive delays handed out.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }
}

/// Runs `operation` up to `1 + retries` times, sleeping between failures.
///
/// `label` names the operation in warning logs (e.g. `"generate"`).
pub async fn with_retries<T, F, Fut>(
    label: &str,
    retries: u32,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(8), 2);

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if backoff.attempt < retries => {
                let delay = backoff.next_delay();
                warn!(
                    "{label} failed (attempt {}): {e} — retrying in {}ms",
                    backoff.attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_growth_with_cap() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(2), 2);
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(1000));
        assert_eq!(b.next_delay(), Duration::from_millis(2000));
        // 2000 * 2 = 4000, capped at 2000
        assert_eq!(b.next_delay(), Duration::from_millis(2000));
        assert_eq!(b.attempt, 4);
    }

    #[tokio::test]
    async fn test_with_retries_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<u32> = with_retries("op", 2, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("transient")
                }
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<u32> = with_retries("op", 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("permanent") }
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "permanent");
        // initial call + 1 retry
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retries_zero_retries_fails_immediately() {
        let result: anyhow::Result<()> =
            with_retries("op", 0, || async { anyhow::bail!("nope") }).await;
        assert!(result.is_err());
    }
}
