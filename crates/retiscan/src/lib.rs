//! retiscan: client core for a retinal-image classification service.

mod version;

pub mod classify;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod documents;
pub mod error;
pub mod health;
pub mod normalize;
pub mod orchestrator;
pub mod session;
pub mod transport;
pub mod upload;

pub use classify::{ClassifiedError, classify};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, Deployment, UploadLimits};
pub use cooldown::CooldownGate;
pub use documents::{DocumentCache, DocumentKind, DocumentState};
pub use error::AnalyzeError;
pub use health::{BackendHealthState, HealthMonitor, HealthStatus};
pub use normalize::{PredictionResult, normalize};
pub use orchestrator::RequestOrchestrator;
pub use session::Session;
pub use transport::{BackendClient, RequestFailure};
pub use upload::{PreviewHandle, UploadCandidate, UploadError, UploadSlot};
pub use version::{RETISCAN_VERSION, VersionInfo};
