//! HTTP transport to the analysis backend.
//!
//! Thin wrapper over a shared `reqwest::Client`:
//! - Per-request timeouts (health/documents 20s, predict 300s)
//! - `retiscan/<version>` User-Agent on every request
//! - No cookies or credentials
//! - Non-2xx responses become `RequestFailure::Status` carrying the parsed
//!   JSON body and any `Retry-After` header for the classifier

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::upload::UploadCandidate;
use crate::version::VersionInfo;

/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

/// A backend call that did not produce a usable 2xx response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestFailure {
    /// Nothing came back: timeout, DNS, refused connection, CORS-style drop.
    #[error("no response from server: {detail}")]
    NoResponse { timed_out: bool, detail: String },

    /// The server answered with a non-2xx status.
    #[error("server returned status {status}")]
    Status {
        status: u16,
        body: Option<Value>,
        retry_after: Option<String>,
    },
}

impl RequestFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NoResponse { .. } => None,
            Self::Status { status, .. } => Some(*status),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::NoResponse { timed_out: true, .. })
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        Self::NoResponse {
            timed_out: err.is_timeout(),
            detail: err.to_string(),
        }
    }
}

pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, version: &VersionInfo) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&version.user_agent()) {
            headers.insert(USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    /// GET a JSON document. `Ok(None)` means a 2xx with a non-JSON body.
    pub async fn get_json(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, RequestFailure> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(RequestFailure::from_reqwest)?;

        read_response(response).await
    }

    /// POST the upload as multipart under the `file` field.
    pub async fn post_file(
        &self,
        path_and_query: &str,
        upload: &UploadCandidate,
        timeout: Duration,
    ) -> Result<Option<Value>, RequestFailure> {
        let url = self.url(path_and_query);
        tracing::debug!(%url, size_bytes = upload.size_bytes(), "POST multipart");

        let part = Part::bytes(upload.bytes().to_vec())
            .file_name(upload.file_name().to_string())
            .mime_str(upload.mime_type())
            .map_err(RequestFailure::from_reqwest)?;
        let form = Form::new().part(FILE_FIELD, part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(RequestFailure::from_reqwest)?;

        read_response(response).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<Option<Value>, RequestFailure> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());

    let bytes = response
        .bytes()
        .await
        .map_err(RequestFailure::from_reqwest)?;
    let body = serde_json::from_slice::<Value>(&bytes).ok();

    if status.is_success() {
        return Ok(body);
    }

    tracing::debug!(status = status.as_u16(), retry_after = ?retry_after, "Request failed");
    Err(RequestFailure::Status {
        status: status.as_u16(),
        body,
        retry_after,
    })
}
