use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("unknown formality: {0}")]
    UnknownFormality(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("self relationship on card {0}")]
    SelfRelationship(String),
}
