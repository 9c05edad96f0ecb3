//! Pipeline error taxonomy

use serde::Serialize;
use thiserror::Error;

/// Pipeline step a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validate,
    Fetch,
    Merge,
    Clean,
    Upsert,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Fetch => "fetch",
            Stage::Merge => "merge",
            Stage::Clean => "clean",
            Stage::Upsert => "upsert",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a stage or a pipeline run.
///
/// Per-id fetch failures never show up here; they are retried and then
/// dropped inside the fetch stage. Cleanup failures are reported as
/// [`crate::stages::CleanupWarning`] values instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad or missing run parameters. No stage was invoked.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No shard artifacts to merge under {prefix}")]
    NothingToMerge { prefix: String },

    #[error("No cleaned artifact found under {prefix}")]
    NoCleanedArtifact { prefix: String },

    #[error("{stage} stage failed: {cause:#}")]
    Stage { stage: Stage, cause: anyhow::Error },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn stage(stage: Stage, cause: impl Into<anyhow::Error>) -> Self {
        PipelineError::Stage {
            stage,
            cause: cause.into(),
        }
    }

    /// Closure form for `map_err`
    pub fn in_stage<E: Into<anyhow::Error>>(stage: Stage) -> impl FnOnce(E) -> Self {
        move |e| Self::stage(stage, e)
    }

    /// The step the failure belongs to, when there is one
    pub fn failing_stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Validation(_) => Some(Stage::Validate),
            PipelineError::NothingToMerge { .. } => Some(Stage::Merge),
            PipelineError::NoCleanedArtifact { .. } => Some(Stage::Upsert),
            PipelineError::Stage { stage, .. } => Some(*stage),
            PipelineError::Config(_) => None,
        }
    }

    /// Conditions the caller can act on (for example by fetching first)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PipelineError::NothingToMerge { .. } | PipelineError::NoCleanedArtifact { .. }
        )
    }
}
