//! Session: one user's view of the analysis service.
//!
//! This owns:
//! - The health monitor and the snapshot it publishes
//! - The cooldown gate shared with the orchestrator
//! - The current upload and its preview handle
//! - Model-info and privacy-notice caches
//! - The single-flight busy flag around `analyze`

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::classify::ClassifiedError;
use crate::clock::{Clock, SystemClock};
use crate::config::{CONFIGURATION_MISSING_MESSAGE, ClientConfig};
use crate::cooldown::CooldownGate;
use crate::documents::{DocumentCache, DocumentKind, DocumentState};
use crate::error::AnalyzeError;
use crate::health::{HealthMonitor, HealthStatus};
use crate::normalize::PredictionResult;
use crate::orchestrator::RequestOrchestrator;
use crate::transport::BackendClient;
use crate::upload::{UploadCandidate, UploadError, UploadSlot};
use crate::version::VersionInfo;

/// Clears the busy flag on drop, including when the analyze future is dropped.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    config: ClientConfig,
    client: Option<Arc<BackendClient>>,
    monitor: HealthMonitor,
    orchestrator: RequestOrchestrator,
    cooldown: Arc<CooldownGate>,
    clock: Arc<dyn Clock>,
    upload: Mutex<UploadSlot>,
    model_info: DocumentCache,
    privacy_notice: DocumentCache,
    loading: AtomicBool,
    version: VersionInfo,
}

impl Session {
    pub fn new(config: ClientConfig) -> Result<Self, reqwest::Error> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self, reqwest::Error> {
        let version = VersionInfo::new();
        let client = match config.resolved_base_url() {
            Some(url) => Some(Arc::new(BackendClient::new(url, &version)?)),
            None => None,
        };

        let monitor = HealthMonitor::new(client.clone(), &config);
        let cooldown = Arc::new(CooldownGate::new());
        let orchestrator = RequestOrchestrator::new(
            client.clone(),
            monitor.subscribe(),
            Arc::clone(&cooldown),
            Arc::clone(&clock),
            &config,
        );

        Ok(Self {
            model_info: DocumentCache::new(DocumentKind::ModelInfo, &config),
            privacy_notice: DocumentCache::new(DocumentKind::PrivacyNotice, &config),
            config,
            client,
            monitor,
            orchestrator,
            cooldown,
            clock,
            upload: Mutex::new(UploadSlot::new()),
            loading: AtomicBool::new(false),
            version,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Begin health polling. Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.monitor.start();
    }

    pub fn health(&self) -> HealthStatus {
        self.monitor.snapshot()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthStatus> {
        self.monitor.subscribe()
    }

    fn lock_upload(&self) -> MutexGuard<'_, UploadSlot> {
        self.upload.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current selection. On error the previous selection stays.
    pub fn select_file(&self, candidate: UploadCandidate) -> Result<(), UploadError> {
        self.lock_upload()
            .select(candidate, &self.config.upload)
            .map(|_| ())
    }

    pub fn select_path(&self, path: &Path) -> Result<(), UploadError> {
        let candidate = UploadCandidate::load(path, &self.config.upload)?;
        self.select_file(candidate)
    }

    pub fn clear_file(&self) {
        self.lock_upload().clear();
    }

    pub fn selected_file(&self) -> Option<UploadCandidate> {
        self.lock_upload().candidate().cloned()
    }

    pub fn live_previews(&self) -> usize {
        self.lock_upload().live_previews()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn cooldown_remaining_seconds(&self) -> u64 {
        self.cooldown.remaining_seconds(self.clock.now_ms())
    }

    /// Analyze the selected file. Rejects overlapping calls with `Busy`.
    pub async fn analyze(&self, want_gradcam: bool) -> Result<PredictionResult, AnalyzeError> {
        let Some(_busy) = BusyGuard::acquire(&self.loading) else {
            return Err(AnalyzeError::Busy);
        };
        let upload = self.selected_file();
        self.orchestrator.analyze(upload.as_ref(), want_gradcam).await
    }

    pub async fn model_info(&self) -> Result<Value, ClassifiedError> {
        self.document(&self.model_info).await
    }

    pub async fn privacy_notice(&self) -> Result<Value, ClassifiedError> {
        self.document(&self.privacy_notice).await
    }

    pub fn document_state(&self, kind: DocumentKind) -> DocumentState {
        match kind {
            DocumentKind::ModelInfo => self.model_info.state(),
            DocumentKind::PrivacyNotice => self.privacy_notice.state(),
        }
    }

    async fn document(&self, cache: &DocumentCache) -> Result<Value, ClassifiedError> {
        let Some(client) = self.client.as_deref() else {
            return Err(ClassifiedError {
                status: None,
                message: CONFIGURATION_MISSING_MESSAGE.to_string(),
            });
        };
        cache.fetch_if_absent(client).await
    }

    /// Client version, plus the model version once model-info has loaded.
    pub fn version(&self) -> VersionInfo {
        let model = self.model_info.cached().and_then(|result| {
            let info = result.ok()?;
            ["version", "model_version", "name"]
                .iter()
                .find_map(|key| info.get(*key).and_then(Value::as_str).map(str::to_string))
        });
        match model {
            Some(model) => self.version.clone().with_model(model),
            None => self.version.clone(),
        }
    }

    /// Stop polling and release the preview.
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.clear_file();
        tracing::debug!("Session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
