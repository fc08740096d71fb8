//! Timeout defaults and async wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for every blocking peer operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long teardown waits for the write half to shut down cleanly.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run `fut`, mapping expiry to `ProtocolError::Timeout`.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Run a fallible `fut`, flattening its error with the timeout error.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(fut, duration).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_in_time() {
        let value = with_timeout(async { 5 }, Duration::from_millis(50)).await;
        assert!(matches!(value, Ok(5)));
    }

    #[tokio::test]
    async fn test_expires() {
        let result = with_timeout(
            tokio::time::sleep(Duration::from_millis(200)),
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> = with_timeout_error(
            async { Err(ProtocolError::ConnectionClosed) },
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }
}
