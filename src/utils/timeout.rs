//! Timeout defaults and helpers shared by the pools and pipelines.

use crate::error::{Result, TransportError};
use std::future::Future;
use std::time::Duration;

/// Default timeout for a single I/O operation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for graceful shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval used while waiting for pooled resources to drain
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Await `future`, mapping an elapsed deadline to [`TransportError::Timeout`]
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TransportError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let value = with_timeout(Duration::from_millis(200), async { 7 }).await;
        assert!(matches!(value, Ok(7)));
    }

    #[tokio::test]
    async fn test_elapsed_deadline_is_timeout() {
        let result = with_timeout(
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
