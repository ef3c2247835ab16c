//! Upload candidates and the preview handle slot.
//!
//! A candidate is validated locally (extension, size) before any network
//! activity. The selected candidate lives in an `UploadSlot` together with
//! its `PreviewHandle`; at most one handle is live per slot, and replacing
//! or clearing the selection releases the previous one.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::UploadLimits;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid file type \"{extension}\". Please upload a PNG or JPEG image.")]
    UnsupportedExtension { extension: String },

    #[error("File too large. Maximum size is {max_mb} MB.")]
    FileTooLarge { size_bytes: u64, max_mb: u64 },

    #[error("The selected file is empty.")]
    Empty,

    #[error("Failed to read file: {0}")]
    Io(String),
}

/// An image selected for analysis.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    file_name: String,
    extension: String,
    bytes: Arc<[u8]>,
}

impl UploadCandidate {
    /// Wrap in-memory bytes. Call `validate` before submitting.
    pub fn from_bytes(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let extension = extension_of(&file_name);
        Self {
            file_name,
            extension,
            bytes: bytes.into(),
        }
    }

    /// Read and validate a file from disk.
    ///
    /// Extension and size are checked from metadata first so a rejected file
    /// is never read into memory.
    pub fn load(path: &Path, limits: &UploadLimits) -> Result<Self, UploadError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        check_extension(&extension_of(&file_name), limits)?;
        let metadata = std::fs::metadata(path).map_err(|e| UploadError::Io(e.to_string()))?;
        check_size(metadata.len(), limits)?;

        let bytes = std::fs::read(path).map_err(|e| UploadError::Io(e.to_string()))?;
        let candidate = Self::from_bytes(file_name, bytes);
        candidate.validate(limits)?;
        Ok(candidate)
    }

    pub fn validate(&self, limits: &UploadLimits) -> Result<(), UploadError> {
        check_extension(&self.extension, limits)?;
        check_size(self.size_bytes(), limits)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Lowercased extension without the dot (empty if none).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &'static str {
        mime_guess::from_ext(&self.extension)
            .first_raw()
            .unwrap_or("application/octet-stream")
    }
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn check_extension(extension: &str, limits: &UploadLimits) -> Result<(), UploadError> {
    if limits
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    {
        Ok(())
    } else {
        Err(UploadError::UnsupportedExtension {
            extension: extension.to_string(),
        })
    }
}

fn check_size(size_bytes: u64, limits: &UploadLimits) -> Result<(), UploadError> {
    if size_bytes == 0 {
        return Err(UploadError::Empty);
    }
    if size_bytes > limits.max_bytes {
        return Err(UploadError::FileTooLarge {
            size_bytes,
            max_mb: limits.max_bytes / (1024 * 1024),
        });
    }
    Ok(())
}

/// In-memory view of the selected file for display.
///
/// Shares the candidate's buffer rather than copying it. Dropping the handle
/// releases it.
pub struct PreviewHandle {
    bytes: Arc<[u8]>,
    mime_type: &'static str,
    live: Arc<AtomicUsize>,
}

impl PreviewHandle {
    fn acquire(candidate: &UploadCandidate, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            bytes: Arc::clone(&candidate.bytes),
            mime_type: candidate.mime_type(),
            live,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }
}

impl std::fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewHandle")
            .field("size_bytes", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!("Preview handle released");
    }
}

/// The session's current selection: a validated candidate and its preview.
#[derive(Default)]
pub struct UploadSlot {
    current: Option<(UploadCandidate, PreviewHandle)>,
    live: Arc<AtomicUsize>,
}

impl UploadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install a new selection, releasing the previous one.
    ///
    /// On validation failure the previous selection is left untouched.
    pub fn select(
        &mut self,
        candidate: UploadCandidate,
        limits: &UploadLimits,
    ) -> Result<&PreviewHandle, UploadError> {
        candidate.validate(limits)?;
        // Release before acquiring so at most one handle is ever live.
        self.current = None;
        let preview = PreviewHandle::acquire(&candidate, Arc::clone(&self.live));
        tracing::debug!(
            file = %candidate.file_name(),
            size_bytes = candidate.size_bytes(),
            "Upload selected"
        );
        let (_, preview) = self.current.insert((candidate, preview));
        Ok(preview)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    pub fn candidate(&self) -> Option<&UploadCandidate> {
        self.current.as_ref().map(|(candidate, _)| candidate)
    }

    pub fn preview(&self) -> Option<&PreviewHandle> {
        self.current.as_ref().map(|(_, preview)| preview)
    }

    /// Number of preview handles acquired through this slot and not yet released.
    pub fn live_previews(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}
