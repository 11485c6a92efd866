use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 1_000;
const RETRY_AFTER_CAP_SECS: u64 = 30;
const FAST_SECOND_RETRY_MS: u64 = 10;

/// Rate-limited or overloaded; safe to retry before any body byte was read.
#[inline]
pub(crate) fn is_retriable_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503 | 529)
}

#[inline]
pub(crate) fn is_retriable_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 9] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection aborted",
        b"broken pipe",
        b"http2 error",
        b"connection refused",
        b"unexpected eof",
        b"stream closed",
    ];
    contains_any_ignore_ascii_case(message.as_bytes(), &NEEDLES)
}

/// Delay before retrying a transport failure. Dropped pooled connections
/// are retried immediately once, then after a short pause.
#[inline]
pub(crate) fn transport_retry_delay(message: &str, attempt: u32) -> Duration {
    const STALE_CONNECTION_NEEDLES: [&[u8]; 6] = [
        b"connection reset",
        b"connection aborted",
        b"broken pipe",
        b"http2 error",
        b"unexpected eof",
        b"stream closed",
    ];
    if contains_any_ignore_ascii_case(message.as_bytes(), &STALE_CONNECTION_NEEDLES) {
        return if attempt == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(FAST_SECOND_RETRY_MS)
        };
    }
    backoff_delay(attempt)
}

/// Delay before retrying a retriable status: `Retry-After` when present,
/// exponential backoff otherwise.
#[inline]
pub(crate) fn status_retry_delay(headers: &http::HeaderMap, attempt: u32) -> Duration {
    parse_retry_after(headers).unwrap_or_else(|| backoff_delay(attempt))
}

#[inline]
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.min(10);
    Duration::from_millis(
        BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(BACKOFF_MAX_MS),
    )
}

/// Parse `Retry-After` as delta-seconds or an HTTP date, capped.
pub(crate) fn parse_retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    let cap = Duration::from_secs(RETRY_AFTER_CAP_SECS);

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(cap));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(delay.min(cap))
}

fn contains_any_ignore_ascii_case(haystack: &[u8], needles: &[&[u8]]) -> bool {
    needles.iter().any(|needle| {
        !needle.is_empty()
            && haystack.len() >= needle.len()
            && haystack
                .windows(needle.len())
                .any(|window| window.eq_ignore_ascii_case(needle))
    })
}
