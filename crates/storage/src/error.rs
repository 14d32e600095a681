use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("core error: {0}")]
    Core(#[from] cardgraph_core::CoreError),
}
