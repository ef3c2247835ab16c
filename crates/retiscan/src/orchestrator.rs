//! Prediction submission.
//!
//! `analyze` runs the pre-flight checks in order, each short-circuiting
//! without touching the network:
//! 1. configuration missing
//! 2. cooldown window open
//! 3. model warming up
//! 4. model reported as not loaded
//! 5. no file / invalid file
//!
//! It then posts the file to each endpoint variant in turn. Only a transport
//! or HTTP-level failure moves on to the next variant; any 2xx response is
//! final and is normalized, including `success: false`. When every variant
//! fails, the last failure goes through the classifier and cooldown policy.
//!
//! Callers must not run `analyze` concurrently; `Session` enforces that with
//! its busy flag.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::{ClientConfig, UploadLimits};
use crate::cooldown::{self, CooldownDefaults, CooldownGate};
use crate::error::AnalyzeError;
use crate::health::HealthStatus;
use crate::normalize::{self, PredictionResult};
use crate::transport::{BackendClient, RequestFailure};
use crate::upload::UploadCandidate;

pub struct RequestOrchestrator {
    client: Option<Arc<BackendClient>>,
    health: watch::Receiver<HealthStatus>,
    cooldown: Arc<CooldownGate>,
    clock: Arc<dyn Clock>,
    predict_path: String,
    predict_timeout: Duration,
    cooldown_defaults: CooldownDefaults,
    limits: UploadLimits,
}

impl RequestOrchestrator {
    pub fn new(
        client: Option<Arc<BackendClient>>,
        health: watch::Receiver<HealthStatus>,
        cooldown: Arc<CooldownGate>,
        clock: Arc<dyn Clock>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            client,
            health,
            cooldown,
            clock,
            predict_path: config.predict_path.clone(),
            predict_timeout: config.predict_timeout,
            cooldown_defaults: CooldownDefaults {
                rate_limited: config.rate_limit_default,
                unavailable: config.unavailable_default,
            },
            limits: config.upload.clone(),
        }
    }

    /// Endpoint variants in the order they are tried.
    pub fn endpoint_variants(&self, want_gradcam: bool) -> Vec<String> {
        let mut variants = Vec::with_capacity(2);
        if want_gradcam {
            variants.push(format!("{}?gradcam=1", self.predict_path));
        }
        variants.push(self.predict_path.clone());
        variants
    }

    /// Local checks only. Returns the client and validated upload to submit.
    pub fn preflight<'a>(
        &'a self,
        upload: Option<&'a UploadCandidate>,
    ) -> Result<(&'a BackendClient, &'a UploadCandidate), AnalyzeError> {
        let health = self.health.borrow().clone();
        let Some(client) = self.client.as_deref() else {
            return Err(AnalyzeError::ConfigurationMissing);
        };
        if health.is_configuration_missing() {
            return Err(AnalyzeError::ConfigurationMissing);
        }

        let now_ms = self.clock.now_ms();
        if self.cooldown.is_blocked(now_ms) {
            return Err(AnalyzeError::rate_limited(
                self.cooldown.remaining_seconds(now_ms),
            ));
        }

        if let Some(state) = health.report() {
            if state.model_loading {
                return Err(AnalyzeError::ModelWarmingUp);
            }
            if !state.model_loaded {
                return Err(AnalyzeError::ModelUnavailable);
            }
        }

        let upload = upload.ok_or(AnalyzeError::NoFileSelected)?;
        upload.validate(&self.limits)?;
        Ok((client, upload))
    }

    pub async fn analyze(
        &self,
        upload: Option<&UploadCandidate>,
        want_gradcam: bool,
    ) -> Result<PredictionResult, AnalyzeError> {
        let (client, upload) = match self.preflight(upload) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::info!(reason = %e, "Analysis rejected before submission");
                return Err(e);
            }
        };

        let started = Instant::now();
        let mut last_failure = None;
        for (attempt, endpoint) in self.endpoint_variants(want_gradcam).iter().enumerate() {
            match client
                .post_file(endpoint, upload, self.predict_timeout)
                .await
            {
                Ok(body) => {
                    let result = normalize::normalize(body.as_ref());
                    tracing::info!(
                        %endpoint,
                        success = result.success,
                        class_label = %result.class_label,
                        round_trip_ms = started.elapsed().as_millis() as u64,
                        "Prediction completed"
                    );
                    return Ok(result);
                }
                Err(failure) => {
                    tracing::warn!(
                        %endpoint,
                        attempt = attempt + 1,
                        error = %failure,
                        "Prediction variant failed"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| RequestFailure::NoResponse {
            timed_out: false,
            detail: "no endpoint variants".to_string(),
        });
        Err(cooldown::handle_failure(
            &self.cooldown,
            &failure,
            self.clock.now_ms(),
            self.cooldown_defaults,
        ))
    }
}
