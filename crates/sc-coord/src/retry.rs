//! Retry wrapper for transient connection failures

use std::future::Future;
use std::time::Duration;

use crate::client::Coordinator;
use crate::error::CoordError;

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 4;

/// Default connection wait per attempt
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(10);

impl Coordinator {
    /// Run `op` with the default retry budget
    ///
    /// Equivalent to [`retry_with`](Self::retry_with) with
    /// [`DEFAULT_RETRIES`] and [`DEFAULT_CONN_TIMEOUT`].
    pub async fn retry<T, F, Fut>(&self, desc: &str, op: F) -> Result<T, CoordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        self.retry_with(desc, Some(DEFAULT_RETRIES), Some(DEFAULT_CONN_TIMEOUT), op)
            .await
    }

    /// Run `op`, waiting for a connection and retrying on connection errors
    ///
    /// Each attempt first waits up to `conn_timeout` for a connection; a
    /// wait expiry consumes an attempt. `retries: None` retries
    /// indefinitely, `Some(n)` allows `n + 1` attempts before
    /// [`CoordError::RetryLimit`]. Errors other than a lost connection
    /// propagate immediately.
    pub async fn retry_with<T, F, Fut>(
        &self,
        desc: &str,
        retries: Option<u32>,
        conn_timeout: Option<Duration>,
        mut op: F,
    ) -> Result<T, CoordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        let mut attempts: u32 = 0;
        loop {
            if let Some(max) = retries {
                if attempts > max {
                    break;
                }
            }
            attempts += 1;
            if self.wait_connected(conn_timeout).await.is_err() {
                tracing::warn!("{}: no connection to the store", desc);
                continue;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(CoordError::NoConnection) => {
                    tracing::warn!("{}: connection to the store dropped", desc);
                }
                Err(err) => return Err(err),
            }
        }
        Err(CoordError::RetryLimit {
            desc: desc.to_string(),
            attempts,
        })
    }
}
