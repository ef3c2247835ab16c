use thiserror::Error;

use crate::classify::ClassifiedError;
use crate::config::CONFIGURATION_MISSING_MESSAGE;
use crate::upload::UploadError;

/// Why an analysis did not produce a `PredictionResult`.
///
/// `Display` is the user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzeError {
    #[error("{}", CONFIGURATION_MISSING_MESSAGE)]
    ConfigurationMissing,

    #[error("Another analysis is already in progress.")]
    Busy,

    #[error("{message}")]
    RateLimited {
        remaining_seconds: u64,
        message: String,
    },

    #[error("The model is still loading. Please try again in a few moments.")]
    ModelWarmingUp,

    #[error("The model is not available on the server. Please try again later.")]
    ModelUnavailable,

    #[error("Please select an image to analyze.")]
    NoFileSelected,

    #[error(transparent)]
    InvalidUpload(#[from] UploadError),

    #[error("{message}")]
    PayloadTooLarge { message: String },

    #[error("{message}")]
    ServiceUnavailable {
        remaining_seconds: u64,
        message: String,
    },

    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("{message}")]
    Connectivity { message: String },
}

impl AnalyzeError {
    /// Pre-flight rejection while a cooldown window is open.
    pub fn rate_limited(remaining_seconds: u64) -> Self {
        Self::RateLimited {
            remaining_seconds,
            message: rate_limit_message(remaining_seconds),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::PayloadTooLarge { .. } => Some(413),
            Self::ServiceUnavailable { .. } => Some(503),
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Seconds until a retry is allowed, for cooldown-driven failures.
    pub fn retry_in_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                remaining_seconds, ..
            }
            | Self::ServiceUnavailable {
                remaining_seconds, ..
            } => Some(*remaining_seconds),
            _ => None,
        }
    }

    /// Only a missing configuration is terminal; everything else may be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConfigurationMissing)
    }
}

impl From<ClassifiedError> for AnalyzeError {
    fn from(classified: ClassifiedError) -> Self {
        match classified.status {
            Some(status) => Self::Http {
                status,
                message: classified.message,
            },
            None => Self::Connectivity {
                message: classified.message,
            },
        }
    }
}

pub(crate) fn rate_limit_message(remaining_seconds: u64) -> String {
    format!("Too many requests. Please wait {remaining_seconds} seconds before trying again.")
}
