//! Startup connections with retry

use crate::backoff::BackoffPolicy;
use redis::aio::ConnectionManager;
use redis::Client;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run `operation` up to `max_attempts` times, sleeping `policy.delay(n)` between attempts
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    max_attempts: u32,
    policy: BackoffPolicy,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(retries = attempt, "Operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    warn!(attempts = attempt, error = %e, "Operation failed, giving up");
                    return Err(e);
                }

                let delay = policy.delay(attempt - 1);
                debug!(
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Open a connection manager and verify it with `PING`
pub async fn connect_redis(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// [`connect_redis`] retried with 200ms..5s backoff
pub async fn connect_redis_with_retry(
    url: &str,
    max_attempts: u32,
) -> redis::RedisResult<ConnectionManager> {
    let policy = BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(5));
    retry_with_backoff(|| connect_redis(url), max_attempts, policy).await
}
