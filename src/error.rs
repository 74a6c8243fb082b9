/// Core error types shared across the extraction and store layers.
///
/// CLI-level glue uses `anyhow` on top of these; module seams return
/// `MeshError` so callers can distinguish file-scoped failures from
/// batch-fatal ones.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("invalid pattern {name}: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("merge failed for {file}: {source}")]
    MergeFailed {
        file: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("git error: {0}")]
    Git(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
