/// Errors from strata-overlay operations.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("parse failed for {file_path}: {reason}")]
    ParseFailed { file_path: String, reason: String },

    #[error("base graph unavailable: {0}")]
    GraphSource(String),
}
