//! The error taxonomy shared by every stage of the pipeline.
//!
//! These are tagged variants rather than an opaque `anyhow::Error`, because
//! callers outside this crate need to tell the difference between "come
//! back later" (`NotReady`), "retry me" (`Transient`), and "this is broken"
//! (`Permanent`). Application-level code (the CLI) still wraps these in
//! [`anyhow::Result`] at the boundary.

use thiserror::Error;

use crate::retry::IsKnownTransient;

/// A pipeline-level error.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A blob or document was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The pipeline hasn't produced this artifact yet.
    #[error("not ready: stage={stage}, progress={progress}")]
    NotReady {
        /// The current pipeline stage.
        stage: String,
        /// The current progress, 0-100.
        progress: u8,
    },

    /// A retryable transport/rate-limit/timeout error.
    #[error("transient error: {0}")]
    Transient(#[source] anyhow::Error),

    /// A non-retryable logical failure.
    #[error("permanent error: {0}")]
    Permanent(#[source] anyhow::Error),

    /// The Document Queue rejected a duplicate submission.
    #[error("already processing: {0}")]
    Conflict(String),

    /// A malformed client request (e.g. a nested object in an edit delta).
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl PipelineError {
    /// Wrap an arbitrary error as [`PipelineError::Transient`].
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        PipelineError::Transient(err.into())
    }

    /// Wrap an arbitrary error as [`PipelineError::Permanent`].
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        PipelineError::Permanent(err.into())
    }

    /// Is this error one which retrying at a stage boundary might fix?
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

impl IsKnownTransient for PipelineError {
    fn is_known_transient(&self) -> bool {
        self.is_transient()
    }
}

/// A convenience alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_formats_stage_and_progress() {
        let err = PipelineError::NotReady {
            stage: "s_ocr".to_string(),
            progress: 40,
        };
        assert_eq!(err.to_string(), "not ready: stage=s_ocr, progress=40");
    }

    #[test]
    fn transient_is_known_transient() {
        let err = PipelineError::transient(anyhow::anyhow!("boom"));
        assert!(err.is_known_transient());
        let err = PipelineError::permanent(anyhow::anyhow!("boom"));
        assert!(!err.is_known_transient());
    }
}
