//! Version information for retiscan.

/// Retiscan version from Cargo.toml
pub const RETISCAN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Client library version.
    pub retiscan: &'static str,
    /// Backend model version (if reported by model-info).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            retiscan: RETISCAN_VERSION,
            model: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with the client version only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set backend model version.
    pub fn with_model(mut self, version: String) -> Self {
        self.model = Some(version);
        self
    }

    /// User-Agent header value sent on every backend request.
    pub fn user_agent(&self) -> String {
        format!("retiscan/{}", self.retiscan)
    }
}
