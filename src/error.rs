//! Errors for the fallible outer APIs (documents, manifests, discovery, config).
//!
//! The interpreter itself never returns these: render-time faults degrade
//! into diagnostics instead.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry manifest: {0}")]
    Manifest(String),

    #[error("invalid configuration value for {key}: {value}")]
    Config { key: String, value: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
