//! Error taxonomy for the OCR pipeline and the job orchestrator.
//!
//! Internally everything is [`anyhow::Error`] with context attached. These
//! enums only exist at component boundaries, where callers need to tell the
//! failure kinds apart (for HTTP status codes, or for logging).

use thiserror::Error;

use crate::prelude::*;

/// Why a [`crate::pipeline::DocumentPipeline`] run failed.
///
/// A single failing page fails the whole document. No partial results are
/// ever returned.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not open {}: {cause:#}", path.display())]
    DocumentOpen { path: PathBuf, cause: anyhow::Error },

    #[error("could not rasterize page {page}: {cause:#}")]
    Rasterization { page: usize, cause: anyhow::Error },

    #[error("could not initialize OCR engine: {cause:#}")]
    EngineConstruction { cause: anyhow::Error },

    #[error("OCR failed on page {page}: {cause:#}")]
    Recognition { page: usize, cause: anyhow::Error },
}

/// Why a job could not be submitted or inspected.
#[derive(Debug, Error)]
pub enum JobError {
    /// The caller sent something we can't accept.
    #[error("{0}")]
    Validation(String),

    /// We could not create or read a job workspace.
    #[error("job workspace error: {cause:#}")]
    Workspace { cause: anyhow::Error },

    /// Every worker is busy and the queue is full.
    #[error("too many jobs are waiting; try again later")]
    QueueFull,
}

impl JobError {
    /// Wrap a filesystem failure.
    pub fn workspace(cause: impl Into<anyhow::Error>) -> Self {
        JobError::Workspace {
            cause: cause.into(),
        }
    }
}
