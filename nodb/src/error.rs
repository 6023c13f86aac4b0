use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodbError {
    #[error("Path not found: {}", path.display())]
    PathNotFound { path: PathBuf },

    #[error("Pipeline entry {position} is not a step")]
    InvalidStep { position: usize },

    #[error("Invalid collection name: {0}")]
    InvalidName(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Reserved field '{field}': {reason}")]
    ReservedField { field: String, reason: String },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NodbError>;
