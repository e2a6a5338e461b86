use crate::config::Retry;
use http::HeaderMap;
use http::StatusCode;
use http::header::RETRY_AFTER;
use rand::Rng;
use std::time::Duration;

/// Statuses retried with exponential backoff, up to `max_attempts`.
const TRANSIENT_STATUS_CODES: &[u16] = &[
    408, // Request Timeout
    409, // Conflict
    420, // Enhance Your Calm
    500, // Internal Server Error
    502, // Bad Gateway
    503, // Service Unavailable
    504, // Gateway Timeout
];

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Decides whether and how long to wait before re-sending a failed request.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: Retry,
}

impl RetryPolicy {
    pub fn new(config: Retry) -> Self {
        RetryPolicy { config }
    }

    /// Delay before the next attempt, or `None` if the failure is final.
    ///
    /// `attempt` counts the retries already made for this lookup. 429 is
    /// retried without limit and waits for the server's `retry-after`.
    pub fn delay_for(
        &self,
        status: StatusCode,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
            return Some(wait + jitter(self.config.rate_limited_jitter_ms));
        }

        if TRANSIENT_STATUS_CODES.contains(&status.as_u16()) && attempt < self.config.max_attempts {
            return Some(self.backoff(attempt) + jitter(self.config.jitter_ms));
        }

        None
    }

    /// `base * factor^attempt`, capped at `max_delay_ms`. Jitter not included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = (self.config.base_delay_ms as f64 * self.config.factor.powi(exponent))
            .min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis.round() as u64)
    }
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Parses a `retry-after` header given in (possibly fractional) seconds.
/// Negative, infinite or out of range values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
