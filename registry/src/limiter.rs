use crate::config::RateLimit;
use crate::metrics_defs::LIMITER_WAIT;
use shared::histogram;
use std::future::Future;
use tokio::sync::{AcquireError, Mutex, Semaphore};
use tokio::time::{Duration, Instant, sleep_until};

/// Shared gate in front of the register API.
///
/// At most `max_concurrent` tasks run at once and consecutive task starts are
/// at least `min_spacing` apart. Waiters are served in arrival order.
pub struct RateLimiter {
    permits: Semaphore,
    min_spacing: Duration,
    next_start: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimit) -> Self {
        RateLimiter {
            permits: Semaphore::new(config.max_concurrent.max(1)),
            min_spacing: Duration::from_millis(config.min_spacing_ms),
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Runs `task` once a slot is free and the spacing since the previous
    /// start has elapsed. The slot is held until the task completes.
    pub async fn schedule<F, T>(&self, task: F) -> Result<T, AcquireError>
    where
        F: Future<Output = T>,
    {
        let queued_at = Instant::now();
        let _permit = self.permits.acquire().await?;

        {
            let mut next_start = self.next_start.lock().await;
            if *next_start > Instant::now() {
                sleep_until(*next_start).await;
            }
            *next_start = Instant::now() + self.min_spacing;
        }

        histogram!(LIMITER_WAIT).record(queued_at.elapsed().as_secs_f64());
        Ok(task.await)
    }
}
