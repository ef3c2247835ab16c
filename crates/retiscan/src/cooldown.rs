//! Cooldown gate for rate-limit and unavailability signals.
//!
//! A single window `until_ms`. It only ever moves forward: `extend` keeps the
//! later of the current and requested deadline. `remaining_seconds` rounds up.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::classify;
use crate::error::{AnalyzeError, rate_limit_message};
use crate::transport::RequestFailure;

/// Fixed message for a 413 from the server.
pub const PAYLOAD_TOO_LARGE_MESSAGE: &str =
    "File too large. The server accepts images up to 5 MB.";

#[derive(Debug, Default)]
pub struct CooldownGate {
    until_ms: AtomicI64,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_blocked(&self, now_ms: i64) -> bool {
        self.until_ms() > now_ms
    }

    pub fn remaining_seconds(&self, now_ms: i64) -> u64 {
        let remaining_ms = self.until_ms().saturating_sub(now_ms).max(0) as u64;
        remaining_ms.div_ceil(1000)
    }

    /// Extend the window to `until_ms`. Never shortens it.
    pub fn extend(&self, until_ms: i64) {
        let previous = self.until_ms.fetch_max(until_ms, Ordering::SeqCst);
        if until_ms > previous {
            tracing::info!(until_ms, "Cooldown extended");
        }
    }

    pub fn until_ms(&self) -> i64 {
        self.until_ms.load(Ordering::SeqCst)
    }
}

/// Defaults when the server sends no usable retry-after.
#[derive(Debug, Clone, Copy)]
pub struct CooldownDefaults {
    pub rate_limited: Duration,
    pub unavailable: Duration,
}

/// Map a final request failure to a user-facing error, opening a cooldown
/// window for 429 and 503.
pub fn handle_failure(
    gate: &CooldownGate,
    failure: &RequestFailure,
    now_ms: i64,
    defaults: CooldownDefaults,
) -> AnalyzeError {
    let classified = classify::classify(failure);
    let RequestFailure::Status {
        status,
        body,
        retry_after,
    } = failure
    else {
        return classified.into();
    };

    match *status {
        413 => AnalyzeError::PayloadTooLarge {
            message: PAYLOAD_TOO_LARGE_MESSAGE.to_string(),
        },
        429 => {
            let remaining_seconds = open_window(
                gate,
                now_ms,
                retry_after_delay(retry_after.as_deref(), body.as_ref())
                    .unwrap_or(defaults.rate_limited),
            );
            AnalyzeError::RateLimited {
                remaining_seconds,
                message: rate_limit_message(remaining_seconds),
            }
        }
        503 => {
            let remaining_seconds = open_window(
                gate,
                now_ms,
                retry_after_delay(retry_after.as_deref(), body.as_ref())
                    .unwrap_or(defaults.unavailable),
            );
            let cooldown = format!("Please retry in {remaining_seconds} seconds.");
            let message = match body.as_ref().and_then(classify::server_message) {
                Some(server) => format!("{server} {cooldown}"),
                None => format!("The analysis service is temporarily unavailable. {cooldown}"),
            };
            AnalyzeError::ServiceUnavailable {
                remaining_seconds,
                message,
            }
        }
        _ => classified.into(),
    }
}

fn open_window(gate: &CooldownGate, now_ms: i64, delay: Duration) -> u64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    gate.extend(now_ms.saturating_add(delay_ms));
    let remaining = gate.remaining_seconds(now_ms);
    tracing::warn!(
        delay_ms,
        remaining_seconds = remaining,
        "Backend asked us to back off"
    );
    remaining
}

/// Retry-after from the header, else a `retry_after` body field.
///
/// Only finite, non-negative second counts are honoured.
pub fn retry_after_delay(header: Option<&str>, body: Option<&Value>) -> Option<Duration> {
    let from_header = header.and_then(|h| h.trim().parse::<f64>().ok());
    let from_body = || {
        body.and_then(|b| b.get("retry_after"))
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
    };

    from_header
        .or_else(from_body)
        .filter(|secs| *secs >= 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
