use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::HeaderMap;
use tokio::time::Instant;

use crate::error::Error;

const MAX_RETRY_AFTER_LEN: usize = 64;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Time budget for the next attempt, or `None` once the overall deadline has passed.
///
/// `Some(None)` means no deadline applies to the attempt at all.
pub(crate) fn phase_timeout(
    per_attempt_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    call_started_at: Instant,
) -> Option<Option<Duration>> {
    let Some(total_timeout) = total_timeout else {
        return Some(per_attempt_timeout);
    };

    let elapsed = call_started_at.elapsed();
    if elapsed >= total_timeout {
        return None;
    }

    let remaining = total_timeout - elapsed;
    Some(Some(match per_attempt_timeout {
        Some(per_attempt_timeout) => per_attempt_timeout.min(remaining),
        None => remaining,
    }))
}

pub(crate) fn bounded_retry_delay(
    retry_delay: Duration,
    total_timeout: Option<Duration>,
    call_started_at: Instant,
) -> Option<Duration> {
    let Some(total_timeout) = total_timeout else {
        return Some(retry_delay);
    };

    let elapsed = call_started_at.elapsed();
    if elapsed >= total_timeout {
        return None;
    }

    let remaining = total_timeout - elapsed;
    if retry_delay >= remaining {
        return None;
    }
    Some(retry_delay)
}

/// Reads a `Retry-After` hint: integral seconds first, then an HTTP date.
///
/// Absent headers yield `Ok(None)`. A date in the past yields a zero delay.
pub(crate) fn parse_retry_after(
    headers: &HeaderMap,
    now: SystemTime,
) -> Result<Option<Duration>, Error> {
    let Some(value) = headers.get(RETRY_AFTER) else {
        return Ok(None);
    };
    let malformed = || Error::MalformedRetryAfter {
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    };
    let raw_value = value.to_str().map_err(|_| malformed())?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Ok(Some(Duration::from_secs(seconds)));
    }
    if raw_value.len() > MAX_RETRY_AFTER_LEN {
        return Err(malformed());
    }

    let date = httpdate::parse_http_date(raw_value).map_err(|_| malformed())?;
    match date.duration_since(now) {
        Ok(duration) => Ok(Some(duration)),
        Err(_) => Ok(Some(Duration::ZERO)),
    }
}

pub(crate) fn set_retry_count(headers: &mut HeaderMap, name: &'static str, prior_attempts: u32) {
    headers.insert(
        HeaderName::from_static(name),
        HeaderValue::from(prior_attempts),
    );
}

pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
