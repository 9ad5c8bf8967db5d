//! Song-metadata and session-log star-schema pipeline on DataFusion.

pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod pipeline;
pub mod result;
pub mod session;
pub mod source;
pub mod storage;
pub mod surrogate;

// Re-export public API for convenience
pub use errors::PipelineError;
pub use orchestrator::{check_pipeline, run_pipeline};
pub use result::{CheckResult, PipelineResult, TableWriteSummary};
