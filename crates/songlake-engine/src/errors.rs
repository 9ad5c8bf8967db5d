//! Pipeline error model and classification of engine failures.

use datafusion::error::DataFusionError;
use songlake_types::{PipelineStage, StageError, StarTable};

use crate::storage::StorageError;

/// Categorized pipeline error.
///
/// `Stage` wraps a typed [`StageError`] carrying the failing stage, a
/// category and a stable code.
///
/// `Infrastructure` wraps opaque host-side errors (configuration loading,
/// runtime setup) that never originate inside a pipeline stage.
#[derive(Debug)]
pub enum PipelineError {
    /// Typed error raised by a pipeline stage.
    Stage(StageError),
    /// Infrastructure error outside any stage.
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<StageError> for PipelineError {
    fn from(e: StageError) -> Self {
        Self::Stage(e)
    }
}

impl PipelineError {
    /// Returns the typed stage error if this is a `Stage` variant.
    pub fn as_stage_error(&self) -> Option<&StageError> {
        match self {
            Self::Stage(e) => Some(e),
            Self::Infrastructure(_) => None,
        }
    }

    /// Classify a DataFusion failure raised while executing `stage`.
    pub fn engine(stage: PipelineStage, code: &str, err: DataFusionError) -> Self {
        Self::Stage(classify_datafusion(stage, code, &err))
    }

    /// Classify a storage-layer failure raised while executing `stage`.
    pub fn storage(stage: PipelineStage, code: &str, err: StorageError) -> Self {
        let message = err.to_string();
        let stage_error = match err {
            StorageError::InvalidLocation { .. }
            | StorageError::UnsupportedScheme(_)
            | StorageError::InvalidGlob { .. } => StageError::config(stage, code, message),
            StorageError::RefusedRootDelete(_) => StageError::internal(stage, code, message),
            StorageError::ObjectStore(ref inner) => classify_object_store(stage, code, inner),
        };
        Self::Stage(stage_error)
    }

    /// Record which tables were fully written before this error occurred.
    #[must_use]
    pub fn with_completed_tables(self, tables: &[StarTable]) -> Self {
        match self {
            Self::Stage(e) => {
                let names: Vec<&str> = tables.iter().map(|t| t.name()).collect();
                let mut details = e.details.clone().unwrap_or_else(|| serde_json::json!({}));
                if let Some(map) = details.as_object_mut() {
                    map.insert("completed_tables".into(), serde_json::json!(names));
                }
                Self::Stage(e.with_details(details))
            }
            other => other,
        }
    }
}

fn classify_object_store(stage: PipelineStage, code: &str, err: &object_store::Error) -> StageError {
    let message = err.to_string();
    match err {
        object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. } => {
            StageError::auth(stage, code, message)
        }
        _ => StageError::storage(stage, code, message),
    }
}

/// Map a DataFusion error onto the stage error taxonomy.
///
/// Object-store and I/O failures are storage errors, Arrow/JSON decode
/// failures are data errors, planning failures are schema errors and
/// anything else is an engine error.
pub fn classify_datafusion(stage: PipelineStage, code: &str, err: &DataFusionError) -> StageError {
    let message = err.to_string();
    match err.find_root() {
        DataFusionError::ObjectStore(inner) => classify_object_store(stage, code, inner),
        DataFusionError::IoError(_) => StageError::storage(stage, code, message),
        DataFusionError::ArrowError(..) | DataFusionError::ParquetError(_) => {
            StageError::data(stage, code, message)
        }
        DataFusionError::SchemaError(..) | DataFusionError::Plan(_) => {
            StageError::schema(stage, code, message)
        }
        _ => StageError::engine(stage, code, message),
    }
}

#[cfg(test)]
mod tests {
    use datafusion::arrow::error::ArrowError;
    use songlake_types::ErrorCategory;

    use super::*;

    #[test]
    fn test_pipeline_error_from_anyhow() {
        let pe: PipelineError = anyhow::anyhow!("config file unreadable").into();
        assert!(matches!(pe, PipelineError::Infrastructure(_)));
        assert!(pe.as_stage_error().is_none());
    }

    #[test]
    fn test_pipeline_error_display_stage() {
        let err = PipelineError::Stage(StageError::data(
            PipelineStage::SongplayFacts,
            "AMBIGUOUS_SONG_TITLE",
            "title 'Intro' names 2 songs",
        ));
        let msg = err.to_string();
        assert!(msg.contains("[data]"));
        assert!(msg.contains("songplay_facts/AMBIGUOUS_SONG_TITLE"));
    }

    #[test]
    fn test_classify_arrow_error_as_data() {
        let err = DataFusionError::ArrowError(
            ArrowError::JsonError("expected value at line 1".into()),
            None,
        );
        let stage = classify_datafusion(PipelineStage::SongPipeline, "READ_FAILED", &err);
        assert_eq!(stage.category, ErrorCategory::Data);
        assert_eq!(stage.stage, PipelineStage::SongPipeline);
    }

    #[test]
    fn test_classify_plan_error_as_schema() {
        let err = DataFusionError::Plan("No field named song_id".into());
        let stage = classify_datafusion(PipelineStage::SongplayFacts, "PLAN_FAILED", &err);
        assert_eq!(stage.category, ErrorCategory::Schema);
    }

    #[test]
    fn test_classify_context_unwraps_to_root() {
        let err = DataFusionError::Context(
            "writing songs".into(),
            Box::new(DataFusionError::ObjectStore(object_store::Error::NotFound {
                path: "out/songs".into(),
                source: "gone".into(),
            })),
        );
        let stage = classify_datafusion(PipelineStage::SongPipeline, "WRITE_FAILED", &err);
        assert_eq!(stage.category, ErrorCategory::Storage);
    }

    #[test]
    fn test_classify_permission_denied_as_auth() {
        let err = DataFusionError::ObjectStore(object_store::Error::PermissionDenied {
            path: "out".into(),
            source: "403".into(),
        });
        let stage = classify_datafusion(PipelineStage::Session, "WRITE_FAILED", &err);
        assert_eq!(stage.category, ErrorCategory::Auth);
    }

    #[test]
    fn test_classify_execution_as_engine() {
        let err = DataFusionError::Execution("join exploded".into());
        let stage = classify_datafusion(PipelineStage::SongplayFacts, "EXEC_FAILED", &err);
        assert_eq!(stage.category, ErrorCategory::Engine);
    }

    #[test]
    fn test_storage_error_categories() {
        let err = PipelineError::storage(
            PipelineStage::Session,
            "BAD_ROOT",
            StorageError::UnsupportedScheme("gs".into()),
        );
        assert_eq!(err.as_stage_error().unwrap().category, ErrorCategory::Config);

        let err = PipelineError::storage(
            PipelineStage::SongPipeline,
            "CLEAR_FAILED",
            StorageError::RefusedRootDelete("memory".into()),
        );
        assert_eq!(err.as_stage_error().unwrap().category, ErrorCategory::Internal);
    }

    #[test]
    fn test_completed_tables_attached_to_details() {
        let err = PipelineError::Stage(StageError::storage(
            PipelineStage::LogDimensions,
            "WRITE_FAILED",
            "bucket gone",
        ))
        .with_completed_tables(&[StarTable::Songs, StarTable::Artists]);
        let details = err.as_stage_error().unwrap().details.clone().unwrap();
        assert_eq!(details["completed_tables"], serde_json::json!(["songs", "artists"]));
    }

    #[test]
    fn test_completed_tables_ignored_for_infrastructure() {
        let err = PipelineError::Infrastructure(anyhow::anyhow!("boom"))
            .with_completed_tables(&[StarTable::Songs]);
        assert!(err.as_stage_error().is_none());
    }
}
