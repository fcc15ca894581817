//! Pipeline error types

use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the load job and its collaborators.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Object store listing, fetch, copy or delete failed.
    #[error(transparent)]
    ObjectStore(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid manifest '{key}': {reason}")]
    ManifestParse { key: String, reason: String },

    #[error(
        "Timed out after {waited_secs}s waiting for data files of manifest '{manifest_key}': \
         missing {missing:?}"
    )]
    DataTimeout {
        manifest_key: String,
        waited_secs: u64,
        missing: Vec<String>,
    },

    #[error("Pre-validation rejected manifest '{0}'")]
    PreValidationFailed(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Illegal status transition for '{key}': {from} -> {to}")]
    IllegalTransition { key: String, from: String, to: String },

    #[error("Claim on manifest '{0}' was lost before completion")]
    ClaimLost(String),

    #[error("Loader failed for manifest '{manifest_key}': {source}")]
    Loader {
        manifest_key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{0} has been closed")]
    Closed(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CCW error: {0}")]
    Common(#[from] ccw_common::CcwError),
}

impl PipelineError {
    pub fn manifest_parse(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Errors that clear up on their own and are worth another poll.
    ///
    /// A data timeout is not one of them: the batch stays `STARTED` until an
    /// operator supplies the missing files or the claim goes stale.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ObjectStore(_) | Self::Database(_) | Self::Io(_))
    }
}
