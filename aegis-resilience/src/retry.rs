//! Bounded exponential backoff with jitter for transient dependency errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Retry policy: exponential delays with full jitter, bounded attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 4,
        }
    }
}

impl Backoff {
    /// Jittered delay before the given retry attempt (attempt 0 is the
    /// first retry). Uniform in `(0, capped_exponential]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered.max(0.001))
    }
}

/// Run `op` until it succeeds or attempts are exhausted, sleeping a
/// jittered exponential delay between attempts. The operation receives the
/// attempt index for logging.
pub async fn retry<T, E, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 >= backoff.max_attempts {
                    return Err(err);
                }
                let delay = backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
