//! Retry for transient database failures on read paths
//!
//! Flushes do not use this; the write queue has its own backoff and retries
//! the whole batch on its timer.

use crate::persistence::backoff::Backoff;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `f` up to `max_attempts` times, sleeping with exponential backoff
/// between attempts that failed transiently.
pub async fn with_retry<F, Fut, T>(operation: &str, max_attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(2));
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if backoff.attempt() + 1 < max_attempts && is_transient(&e) => {
                let delay = backoff.next_delay();
                warn!(
                    "{} failed (attempt {}/{}): {:#}. Retrying in {:?}",
                    operation,
                    backoff.attempt(),
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connection loss, pool exhaustion, serialization failures and deadlocks
pub fn is_transient(e: &anyhow::Error) -> bool {
    if let Some(db_err) = e.downcast_ref::<sqlx::Error>() {
        return match db_err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => true,
            sqlx::Error::Database(db) => matches!(
                db.code().as_deref(),
                Some("40001") | Some("40P01") | Some("53300") | Some("57P01")
            ),
            _ => false,
        };
    }

    let message = e.to_string().to_lowercase();
    message.contains("connection reset")
        || message.contains("connection refused")
        || message.contains("broken pipe")
        || message.contains("timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_is_transient() {
        assert!(is_transient(&anyhow::Error::from(sqlx::Error::PoolTimedOut)));
        assert!(is_transient(&anyhow::Error::from(sqlx::Error::Io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")
        ))));
        assert!(!is_transient(&anyhow::Error::from(sqlx::Error::RowNotFound)));

        assert!(is_transient(&anyhow::anyhow!("connection refused")));
        assert!(!is_transient(&anyhow::anyhow!("column \"data\" does not exist")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = with_retry("load games", 3, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("connection reset by peer"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts_and_on_permanent_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<()> = with_retry("load games", 3, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("connection refused"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        attempts.store(0, Ordering::SeqCst);
        let counter = attempts.clone();
        let result: Result<()> = with_retry("load games", 3, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("invalid input syntax"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
