pub mod check;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use songlake_engine::config::parser;
use songlake_engine::config::types::PipelineConfig;
use songlake_engine::config::validator;

/// Load the pipeline file (or the built-in defaults) and validate it.
pub(crate) fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let config = parser::load_or_default(path)
        .with_context(|| format!("Failed to parse pipeline: {}", path.display()))?;
    validator::validate_pipeline(&config)?;
    Ok(config)
}
