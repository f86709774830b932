use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub(crate) const RATE_LIMIT_MAX_RETRIES: usize = 4;
pub(crate) const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(1);
pub(crate) const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(30);

/// 429, transient 5xx, or a body that says so.
pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if matches!(status.as_u16(), 500 | 502 | 503 | 504 | 529) {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) async fn wait_with_backoff(
    service: &str,
    attempt: usize,
    delay: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    let mut wait = delay;
    if let Some(retry_after) = retry_after
        && retry_after > wait
    {
        wait = retry_after.min(RATE_LIMIT_MAX_DELAY);
    }
    warn!(
        "{} busy; retrying in {:.1}s (attempt {}/{})",
        service,
        wait.as_secs_f32(),
        attempt,
        RATE_LIMIT_MAX_RETRIES
    );
    sleep(wait).await;
    next_delay(delay)
}

pub(crate) fn next_delay(current: Duration) -> Duration {
    current
        .saturating_mul(2)
        .max(RATE_LIMIT_BASE_DELAY)
        .min(RATE_LIMIT_MAX_DELAY)
}
