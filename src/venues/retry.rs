//! Retry helper shared by every adapter.
//! Mission: transport errors get exponential backoff; everything else surfaces immediately
//! Grounded on `scrapers::polymarket_api::RateLimiter`'s manual backoff loop and the
//! Python `BaseFundingAdapter._make_request`'s `@retry(stop_after_attempt(3),
//! wait_exponential(multiplier=1, min=2, max=10))` decorator.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::CoreError;
use crate::models::VenueId;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

/// Runs `op` up to `MAX_ATTEMPTS` times with exponential backoff, but only
/// for errors the retry policy covers (transport-class). Authorization and
/// exchange-rejection errors are returned on the first attempt.
pub async fn with_backoff<T, F, Fut>(venue: &VenueId, op_name: &str, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    let mut backoff = BASE_BACKOFF;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(err @ CoreError::Authorization { .. })
            | Err(err @ CoreError::ExchangeRejection { .. }) => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(
                    venue = %venue,
                    op = op_name,
                    attempt,
                    error = %err,
                    "transport error, retrying with backoff"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transport_errors_up_to_three_attempts() {
        let calls = AtomicU32::new(0);
        let venue = "aster".to_string();
        let result: Result<i32, CoreError> = with_backoff(&venue, "test_op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(CoreError::VenueUnavailable {
                    venue: venue.clone(),
                    reason: "timeout".into(),
                })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_authorization_errors() {
        let calls = AtomicU32::new(0);
        let venue = "lighter".to_string();
        let result: Result<i32, CoreError> = with_backoff(&venue, "test_op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Authorization {
                venue: venue.clone(),
                reason: "bad signature".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
