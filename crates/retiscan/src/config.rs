//! Client configuration.
//!
//! Values come from `ClientConfig::default()` and can be overridden from the
//! environment with `ClientConfig::from_env()`:
//! - `RETISCAN_API_BASE_URL`: backend base address
//! - `RETISCAN_ENV`: `production` / `prod` selects a production deployment

use std::time::Duration;

/// Fixed remediation message for a production build without a backend address.
pub const CONFIGURATION_MISSING_MESSAGE: &str = "The analysis service address is not configured. \
     Set RETISCAN_API_BASE_URL for this deployment and redeploy.";

const DEV_BASE_URL: &str = "http://127.0.0.1:8000";

/// Deployment flavour. Decides what a missing base address means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Deployment {
    #[default]
    Development,
    Production,
}

impl Deployment {
    fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Local upload constraints, enforced before any network call.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub max_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            allowed_extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub deployment: Deployment,
    pub health_timeout: Duration,
    pub predict_timeout: Duration,
    pub document_timeout: Duration,
    /// Delay before re-polling a backend that reports the model as loading.
    pub warmup_poll_interval: Duration,
    /// Health paths, tried in order; first success wins.
    pub health_paths: Vec<String>,
    pub predict_path: String,
    pub model_info_path: String,
    pub privacy_notice_path: String,
    pub rate_limit_default: Duration,
    pub unavailable_default: Duration,
    pub upload: UploadLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            deployment: Deployment::Development,
            health_timeout: Duration::from_secs(20),
            predict_timeout: Duration::from_secs(300),
            document_timeout: Duration::from_secs(20),
            warmup_poll_interval: Duration::from_millis(5000),
            health_paths: vec!["/api/health".into(), "/health".into()],
            predict_path: "/api/predict".into(),
            model_info_path: "/api/model-info".into(),
            privacy_notice_path: "/api/privacy-notice".into(),
            rate_limit_default: Duration::from_secs(60),
            unavailable_default: Duration::from_secs(5),
            upload: UploadLimits::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("RETISCAN_API_BASE_URL")
            && !url.trim().is_empty()
        {
            config.base_url = Some(url);
        }
        if let Ok(env) = std::env::var("RETISCAN_ENV") {
            config.deployment = Deployment::from_env_value(&env);
        }
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployment = deployment;
        self
    }

    /// Effective backend base address without a trailing slash.
    ///
    /// `None` means the configuration is missing: a production deployment
    /// with no address. Development falls back to a local backend.
    pub fn resolved_base_url(&self) -> Option<String> {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(url.trim_end_matches('/').to_string()),
            _ => match self.deployment {
                Deployment::Production => None,
                Deployment::Development => Some(DEV_BASE_URL.to_string()),
            },
        }
    }

    pub fn is_configuration_missing(&self) -> bool {
        self.resolved_base_url().is_none()
    }
}
