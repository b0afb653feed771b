use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("dataset root does not exist: {0:?}")]
    MissingRoot(PathBuf),
    #[error("file not found in dataset index: {0:?}")]
    FileNotIndexed(PathBuf),
    #[error("invalid sidecar {path:?}: {source}")]
    InvalidSidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing metadata field {field} for {path:?}")]
    MissingMetadata { path: PathBuf, field: &'static str },
}

pub type Result<T> = std::result::Result<T, LayoutError>;
