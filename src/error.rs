//! Error types for the pipeline.
//!
//! Two classes of failure are kept apart:
//!
//! | Type | Raised by | Effect |
//! |------|-----------|--------|
//! | [`PipelineError`] | corpus reads, embedding, model calls | fails the one request, names the stage |
//! | [`PersistError`] | cache writes after a successful build | logged at `warn`, never returned |
//!
//! Only `PipelineError` crosses the public API of the coordinator and the
//! query executor. Persistence helpers return `PersistError` to their caller
//! inside this crate, which logs it and carries on with the in-memory result.

use std::path::PathBuf;
use thiserror::Error;

/// A failure that aborts one pipeline request.
///
/// A rebuild that fails with any of these leaves the previous pipeline state
/// untouched.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("corpus read failed: {0:#}")]
    Corpus(anyhow::Error),

    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    #[error("index build failed: {0:#}")]
    Index(anyhow::Error),

    #[error("retrieval failed: {0:#}")]
    Retrieval(anyhow::Error),

    #[error("model call failed: {0:#}")]
    Model(anyhow::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Short machine-readable name of the failing stage.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Corpus(_) => "corpus",
            PipelineError::Embedding(_) => "embedding",
            PipelineError::Index(_) => "index",
            PipelineError::Retrieval(_) => "retrieval",
            PipelineError::Model(_) => "model",
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::Task(_) => "task",
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Task(e.to_string())
    }
}

/// A best-effort write that did not make it to disk.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.into(),
            source,
        }
    }
}
