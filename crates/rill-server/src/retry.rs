//! Bounded retry with exponential backoff for calls to external services

use std::future::Future;
use tracing::warn;

use crate::config::RegistryRetryConfig;

/// Run `op` until it succeeds or `config.max_attempts` calls have failed,
/// sleeping with exponential backoff in between. Returns the last error.
pub async fn retry<T, E, F, Fut>(
    config: &RegistryRetryConfig,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_after(attempt);
                warn!(
                    operation = %what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
