//! Session-scoped caches for the model-info and privacy-notice documents.
//!
//! Each cache is `Unfetched -> Loading -> Settled`. `fetch_if_absent` is
//! idempotent: the first caller fetches, concurrent callers wait for that
//! fetch, later callers get the settled value. Failures settle too; `reset`
//! returns the cache to `Unfetched` so the user can retry.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::classify::{self, ClassifiedError};
use crate::config::ClientConfig;
use crate::normalize::INVALID_RESPONSE_MESSAGE;
use crate::transport::BackendClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    ModelInfo,
    PrivacyNotice,
}

impl DocumentKind {
    pub fn path<'a>(&self, config: &'a ClientConfig) -> &'a str {
        match self {
            Self::ModelInfo => &config.model_info_path,
            Self::PrivacyNotice => &config.privacy_notice_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "result", rename_all = "snake_case")]
pub enum DocumentState {
    Unfetched,
    Loading,
    Settled(Result<Value, ClassifiedError>),
}

pub struct DocumentCache {
    kind: DocumentKind,
    path: String,
    timeout: Duration,
    state: Mutex<DocumentState>,
    /// Serializes fetches so concurrent callers share one request.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl DocumentCache {
    pub fn new(kind: DocumentKind, config: &ClientConfig) -> Self {
        Self {
            kind,
            path: kind.path(config).to_string(),
            timeout: config.document_timeout,
            state: Mutex::new(DocumentState::Unfetched),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn state(&self) -> DocumentState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: DocumentState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Settled value if present, without fetching.
    pub fn cached(&self) -> Option<Result<Value, ClassifiedError>> {
        match self.state() {
            DocumentState::Settled(result) => Some(result),
            _ => None,
        }
    }

    pub async fn fetch_if_absent(&self, client: &BackendClient) -> Result<Value, ClassifiedError> {
        let _guard = self.fetch_lock.lock().await;
        if let Some(result) = self.cached() {
            return result;
        }

        self.set_state(DocumentState::Loading);
        tracing::debug!(kind = ?self.kind, "Fetching document");

        let result = match client.get_json(&self.path, self.timeout).await {
            Ok(Some(body)) => Ok(body),
            Ok(None) => Err(ClassifiedError {
                status: None,
                message: INVALID_RESPONSE_MESSAGE.to_string(),
            }),
            Err(failure) => Err(classify::classify(&failure)),
        };

        if let Err(ref error) = result {
            tracing::warn!(kind = ?self.kind, error = %error, "Document fetch failed");
        }
        self.set_state(DocumentState::Settled(result.clone()));
        result
    }

    pub fn reset(&self) {
        self.set_state(DocumentState::Unfetched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionInfo;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> BackendClient {
        BackendClient::new(server.uri(), &VersionInfo::new()).unwrap()
    }

    #[test]
    fn state_serializes_tagged() {
        insta::assert_json_snapshot!(
            [DocumentState::Unfetched, DocumentState::Loading],
            @r#"
        [
          {
            "state": "unfetched"
          },
          {
            "state": "loading"
          }
        ]
        "#
        );
    }

    #[tokio::test]
    async fn fetches_once_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/model-info"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"name": "RetinaNet", "classes": ["Normal", "DR"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = DocumentCache::new(DocumentKind::ModelInfo, &ClientConfig::default());
        assert_eq!(cache.state(), DocumentState::Unfetched);

        let client = client(&server);
        let first = cache.fetch_if_absent(&client).await.unwrap();
        let second = cache.fetch_if_absent(&client).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first["name"], "RetinaNet");
        assert!(matches!(cache.state(), DocumentState::Settled(Ok(_))));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/privacy-notice"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"controller": "Clinic"}))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = DocumentCache::new(DocumentKind::PrivacyNotice, &ClientConfig::default());
        let client = client(&server);
        let (a, b) = tokio::join!(cache.fetch_if_absent(&client), cache.fetch_if_absent(&client));
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn failure_is_classified_and_cached_until_reset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/model-info"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"error": "model registry down"})),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/model-info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "RetinaNet"})))
            .expect(1)
            .mount(&server)
            .await;

        let cache = DocumentCache::new(DocumentKind::ModelInfo, &ClientConfig::default());
        let client = client(&server);

        let err = cache.fetch_if_absent(&client).await.unwrap_err();
        assert_eq!(err.status, Some(500));
        assert_eq!(err.message, "model registry down");
        assert!(cache.fetch_if_absent(&client).await.is_err());

        cache.reset();
        assert_eq!(cache.state(), DocumentState::Unfetched);
        let ok = cache.fetch_if_absent(&client).await.unwrap();
        assert_eq!(ok["name"], "RetinaNet");
    }

    #[tokio::test]
    async fn non_json_body_settles_as_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/privacy-notice"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>notice</html>"))
            .mount(&server)
            .await;

        let cache = DocumentCache::new(DocumentKind::PrivacyNotice, &ClientConfig::default());
        let err = cache.fetch_if_absent(&client(&server)).await.unwrap_err();
        assert_eq!(err.status, None);
        assert_eq!(err.message, INVALID_RESPONSE_MESSAGE);
    }
}
