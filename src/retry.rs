//! Exponential backoff around retryable classified errors.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{classify, ClassifiedError};

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `n` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(ClassifiedError),
}

impl RetryError {
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }
}

/// Run `op`, retrying retryable failures with exponential backoff.
///
/// Every failure is classified; non-retryable kinds abort immediately with
/// the classification. A cancellation observed during a backoff sleep
/// returns [`RetryError::Cancelled`] without further attempts. When the
/// retry budget is exhausted the last classification is returned.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let classified = classify(&err);

                if !classified.retryable {
                    return Err(RetryError::Failed(classified));
                }
                if attempt >= policy.max_retries {
                    warn!(
                        kind = %classified.kind,
                        attempts = attempt + 1,
                        "retry budget exhausted"
                    );
                    return Err(RetryError::Failed(classified));
                }

                let delay = policy.delay_for(attempt);
                debug!(
                    kind = %classified.kind,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {}",
                    classified.message
                );

                tokio::select! {
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }
}
