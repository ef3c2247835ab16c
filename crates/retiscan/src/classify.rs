//! Failure classification.
//!
//! Turns a `RequestFailure` into the `(status, message)` pair shown to the
//! user. Pure: cooldown side effects live in `cooldown`.

use serde::Serialize;
use serde_json::Value;

use crate::transport::RequestFailure;

/// Shown when no response arrived at all.
pub const CONNECTIVITY_MESSAGE: &str = "Unable to reach the analysis server. \
     Verify that the backend is running and that the API address and proxy/CORS configuration are correct.";

/// Structured error fields, in priority order.
const MESSAGE_FIELDS: &[&str] = &["error", "message", "detail"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedError {
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClassifiedError {}

pub fn classify(failure: &RequestFailure) -> ClassifiedError {
    match failure {
        RequestFailure::Status { status, body, .. } => {
            let message = body
                .as_ref()
                .and_then(server_message)
                .unwrap_or_else(|| format!("Request failed with status {status}."));
            ClassifiedError {
                status: Some(*status),
                message,
            }
        }
        RequestFailure::NoResponse { .. } => ClassifiedError {
            status: None,
            message: CONNECTIVITY_MESSAGE.to_string(),
        },
    }
}

/// The server's own error text, if the body carries one.
pub fn server_message(body: &Value) -> Option<String> {
    MESSAGE_FIELDS.iter().find_map(|field| {
        body.get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
