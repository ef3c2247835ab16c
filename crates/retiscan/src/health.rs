//! Backend readiness tracking.
//!
//! `HealthMonitor` polls the backend's health endpoint and publishes a
//! `HealthStatus` on a watch channel. Scheduling is self-chaining: each poll
//! schedules at most one successor, and only while the backend reports the
//! model as loading. `stop()` therefore only has to cancel one pending task.
//!
//! A generation counter is bumped on every `start()`/`stop()`. Results are
//! compared against it at delivery time, so a response that lands after
//! `stop()` never reaches the channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::classify::{self, CONNECTIVITY_MESSAGE, ClassifiedError};
use crate::config::{CONFIGURATION_MISSING_MESSAGE, ClientConfig};
use crate::transport::BackendClient;

/// Health payload as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealthState {
    pub model_loaded: bool,
    pub model_loading: bool,
    pub raw: Value,
}

impl BackendHealthState {
    pub fn from_payload(raw: Value) -> Self {
        let flag = |key: &str| raw.get(key).and_then(Value::as_bool).unwrap_or(false);
        Self {
            model_loaded: flag("model_loaded"),
            model_loading: flag("model_loading"),
            raw,
        }
    }

    pub fn is_warming_up(&self) -> bool {
        self.model_loading && !self.model_loaded
    }
}

/// Last known backend health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// No poll has delivered a result yet.
    #[default]
    Unknown,
    /// Backend answered a health probe.
    Reported(BackendHealthState),
    /// Every health candidate failed.
    Offline(ClassifiedError),
    /// Production deployment without a backend address. Terminal.
    ConfigurationMissing { message: String },
}

impl HealthStatus {
    pub fn report(&self) -> Option<&BackendHealthState> {
        match self {
            Self::Reported(state) => Some(state),
            _ => None,
        }
    }

    pub fn is_configuration_missing(&self) -> bool {
        matches!(self, Self::ConfigurationMissing { .. })
    }
}

pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    client: Option<Arc<BackendClient>>,
    paths: Vec<String>,
    timeout: Duration,
    warmup_interval: Duration,
    generation: AtomicU64,
    /// Token of the single scheduled or in-flight poll.
    pending: Mutex<Option<CancellationToken>>,
    state_tx: watch::Sender<HealthStatus>,
}

impl HealthMonitor {
    /// `client` is `None` when the configuration is missing.
    pub fn new(client: Option<Arc<BackendClient>>, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(HealthStatus::Unknown);
        Self {
            inner: Arc::new(MonitorInner {
                client,
                paths: config.health_paths.clone(),
                timeout: config.health_timeout,
                warmup_interval: config.warmup_poll_interval,
                generation: AtomicU64::new(0),
                pending: Mutex::new(None),
                state_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.inner.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> HealthStatus {
        self.inner.state_tx.borrow().clone()
    }

    /// Poll now. Restarting supersedes any pending poll.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let generation = {
            let mut pending = self.inner.lock_pending();
            if let Some(previous) = pending.take() {
                previous.cancel();
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        if self.inner.client.is_none() {
            tracing::error!("Backend address missing in production deployment");
            self.inner
                .state_tx
                .send_replace(HealthStatus::ConfigurationMissing {
                    message: CONFIGURATION_MISSING_MESSAGE.to_string(),
                });
            return;
        }

        tracing::debug!(generation, "Health monitor started");
        self.inner.schedule(generation, Duration::ZERO);
    }

    /// Cancel the pending poll, if any. Idempotent.
    pub fn stop(&self) {
        let mut pending = self.inner.lock_pending();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = pending.take() {
            token.cancel();
            tracing::debug!("Health monitor stopped");
        }
    }

    /// Whether a poll is scheduled or in flight.
    pub fn is_scheduled(&self) -> bool {
        self.inner.lock_pending().is_some()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MonitorInner {
    fn lock_pending(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(self: &Arc<Self>, generation: u64, delay: Duration) {
        let token = CancellationToken::new();
        {
            let mut pending = self.lock_pending();
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Some(previous) = pending.replace(token.clone()) {
                previous.cancel();
            }
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                status = async {
                    tokio::time::sleep(delay).await;
                    inner.poll().await
                } => status,
            };
            inner.deliver(generation, &token, status);
        });
    }

    fn deliver(self: &Arc<Self>, generation: u64, token: &CancellationToken, status: HealthStatus) {
        let warming = status.report().is_some_and(BackendHealthState::is_warming_up);
        {
            let mut pending = self.lock_pending();
            if token.is_cancelled() || self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, "Discarding stale health response");
                return;
            }
            *pending = None;
            self.state_tx.send_replace(status);
        }

        if warming {
            tracing::info!(
                retry_ms = self.warmup_interval.as_millis() as u64,
                "Model is loading, scheduling another health check"
            );
            self.schedule(generation, self.warmup_interval);
        }
    }

    async fn poll(&self) -> HealthStatus {
        let Some(client) = self.client.as_ref() else {
            return HealthStatus::ConfigurationMissing {
                message: CONFIGURATION_MISSING_MESSAGE.to_string(),
            };
        };

        let mut last_error = None;
        for path in &self.paths {
            match client.get_json(path, self.timeout).await {
                Ok(Some(body)) => {
                    let state = BackendHealthState::from_payload(body);
                    tracing::debug!(
                        %path,
                        model_loaded = state.model_loaded,
                        model_loading = state.model_loading,
                        "Health check succeeded"
                    );
                    return HealthStatus::Reported(state);
                }
                Ok(None) => {
                    tracing::debug!(%path, "Health check returned a non-JSON body");
                    last_error = Some(ClassifiedError {
                        status: None,
                        message: "Invalid health response from server.".to_string(),
                    });
                }
                Err(failure) => {
                    tracing::debug!(%path, error = %failure, "Health check failed");
                    last_error = Some(classify::classify(&failure));
                }
            }
        }

        let error = last_error.unwrap_or_else(|| ClassifiedError {
            status: None,
            message: CONNECTIVITY_MESSAGE.to_string(),
        });
        tracing::warn!(error = %error, "Backend health check failed");
        HealthStatus::Offline(error)
    }
}
