//! Shared songlake record, table and error model types.
//!
//! This crate stays free of the execution engine so that fixtures, the CLI
//! and the engine can all agree on record shapes and the star-schema
//! catalogue without pulling in DataFusion.

pub mod error;
pub mod record;
pub mod table;

pub use error::{ErrorCategory, PipelineStage, StageError};
pub use record::{LogRecord, SongRecord, NEXT_SONG_PAGE};
pub use table::StarTable;
