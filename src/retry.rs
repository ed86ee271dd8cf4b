//! Retry policy for store calls.
//!
//! A transient transport failure must never surface as a claim outcome:
//! lease transitions report a definite boolean or keep trying. The store's
//! session checks make a late retry harmless, since a stale session no
//! longer matches and the call degrades to a no-op.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::client::PoolError;

/// Retry `call` until it succeeds, sleeping `backoff` between attempts.
pub async fn retry_forever<T, F, Fut>(op: &str, backoff: Duration, mut call: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PoolError>>,
{
    let mut attempt: u64 = 0;
    loop {
        match call().await {
            Ok(value) => return value,
            Err(err) => {
                attempt += 1;
                warn!(op, attempt, error = %err, "store call failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let out = retry_forever("test", Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PoolError::EmptyObject)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
