//! Structured error model for pipeline stages.
//!
//! [`StageError`] carries a classification, the stage that failed, a stable
//! code and optional diagnostic details. Construct via category-specific
//! factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid pipeline configuration.
    Config,
    /// Missing or rejected storage credentials.
    Auth,
    /// Reading from or writing to the object store failed.
    Storage,
    /// Input data could not be decoded or violates a data policy.
    Data,
    /// Schema mismatch between a relation and what a derivation expects.
    Schema,
    /// The dataframe engine failed while planning or executing.
    Engine,
    /// Internal invariant violated.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Storage => "storage",
            Self::Data => "data",
            Self::Schema => "schema",
            Self::Engine => "engine",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Session provisioning and teardown.
    Session,
    /// Songs and artists derivation.
    SongPipeline,
    /// Users and time derivation.
    LogDimensions,
    /// Songplays fact derivation.
    SongplayFacts,
    /// Pre-flight checks (`songlake check`).
    Check,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::SongPipeline => "song_pipeline",
            Self::LogDimensions => "log_dimensions",
            Self::SongplayFacts => "songplay_facts",
            Self::Check => "check",
        };
        f.write_str(s)
    }
}

/// Structured error from a pipeline stage.
///
/// No stage error is retried: every one aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {stage}/{code}: {message}")]
pub struct StageError {
    pub category: ErrorCategory,
    pub stage: PipelineStage,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    fn new(
        category: ErrorCategory,
        stage: PipelineStage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            stage,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Configuration error.
    #[must_use]
    pub fn config(
        stage: PipelineStage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Config, stage, code, message)
    }

    /// Credential error.
    #[must_use]
    pub fn auth(stage: PipelineStage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, stage, code, message)
    }

    /// Object store read/write error.
    #[must_use]
    pub fn storage(
        stage: PipelineStage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Storage, stage, code, message)
    }

    /// Input data error.
    #[must_use]
    pub fn data(stage: PipelineStage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, stage, code, message)
    }

    /// Schema mismatch error.
    #[must_use]
    pub fn schema(
        stage: PipelineStage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Schema, stage, code, message)
    }

    /// Dataframe engine error.
    #[must_use]
    pub fn engine(
        stage: PipelineStage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Engine, stage, code, message)
    }

    /// Internal invariant error.
    #[must_use]
    pub fn internal(
        stage: PipelineStage,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Internal, stage, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Re-attribute the error to another stage.
    #[must_use]
    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = stage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_fields() {
        let err = StageError::storage(PipelineStage::SongPipeline, "WRITE_FAILED", "bucket gone");
        assert_eq!(err.category, ErrorCategory::Storage);
        assert_eq!(err.stage, PipelineStage::SongPipeline);
        assert_eq!(err.code, "WRITE_FAILED");
        assert!(err.details.is_none());
    }

    #[test]
    fn with_stage_reattributes() {
        let err = StageError::data(PipelineStage::Check, "NO_INPUT_FILES", "nothing matched")
            .with_stage(PipelineStage::LogDimensions);
        assert_eq!(err.stage, PipelineStage::LogDimensions);
        assert_eq!(err.category, ErrorCategory::Data);
    }

    #[test]
    fn serde_roundtrip() {
        let err = StageError::data(
            PipelineStage::SongplayFacts,
            "AMBIGUOUS_SONG_TITLE",
            "title maps to several songs",
        )
        .with_details(serde_json::json!({"titles": ["Intro"]}));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"songplay_facts\""));
        let back: StageError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn display_format() {
        let err = StageError::config(PipelineStage::Session, "BAD_ROOT", "root must not be empty");
        assert_eq!(
            err.to_string(),
            "[config] session/BAD_ROOT: root must not be empty"
        );
    }
}
