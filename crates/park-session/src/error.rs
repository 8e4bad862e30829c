use park_layout::LayoutError;
use park_vision::VisionError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Bad layout; the session never starts with invalid regions.
    #[error(transparent)]
    Configuration(#[from] LayoutError),

    /// The source could not be opened, or failed for good mid-stream.
    #[error("frame source {id}: {reason}")]
    Source { id: String, reason: String },

    #[error("ML detector unavailable: {0}")]
    DetectorInit(String),

    /// One frame failed to decode; the loop skips it.
    #[error("frame skipped: {0}")]
    TransientFrame(String),

    #[error("operation not allowed while the session is running")]
    Running,
}

impl SessionError {
    pub fn source_failed(id: impl Into<String>, reason: impl ToString) -> Self {
        SessionError::Source { id: id.into(), reason: reason.to_string() }
    }
}

impl From<VisionError> for SessionError {
    fn from(e: VisionError) -> Self {
        SessionError::DetectorInit(e.to_string())
    }
}
