/// Errors from strata-core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("document transform failed for chunk {chunk_id}: {reason}")]
    TransformFailed { chunk_id: String, reason: String },

    #[error("invalid ordinal {ordinal} for {type_name}")]
    InvalidOrdinal {
        type_name: &'static str,
        ordinal: u8,
    },

    #[error("type conversion failed: {reason}")]
    ConversionFailed { reason: String },
}

impl CoreError {
    pub fn is_retryable(&self) -> bool {
        false
    }
}
