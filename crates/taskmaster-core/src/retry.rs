//! Bounded retry for write-behind persistence paths (§7): a failed write
//! is retried a few times with backoff; if it still fails the in-memory
//! state remains authoritative and the caller logs an alert instead of
//! aborting.

use std::future::Future;
use std::time::Duration;

pub async fn with_bounded_retry<F, Fut>(attempts: u32, mut op: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut delay = Duration::from_millis(100);
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let calls = AtomicU32::new(0);
        let result = with_bounded_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_up_to_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result = with_bounded_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("boom") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
