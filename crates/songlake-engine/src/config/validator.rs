//! Semantic validation for parsed pipeline configuration values.

use anyhow::{bail, Result};

use crate::config::types::PipelineConfig;
use crate::storage::StorageLocation;

/// Validate an input glob relative to the input root.
fn validate_glob(pattern: &str, context: &str, errors: &mut Vec<String>) {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        errors.push(format!("{context}: glob must not be empty"));
        return;
    }
    if !trimmed.ends_with(".json") {
        errors.push(format!(
            "{context}: glob '{pattern}' must match JSON-per-line files (*.json)"
        ));
    }
    if trimmed.contains("**") {
        errors.push(format!(
            "{context}: recursive '**' wildcards are not supported in '{pattern}'"
        ));
    }
}

/// Validate a root location, returning the parsed location when usable.
fn validate_root(root: &str, context: &str, errors: &mut Vec<String>) -> Option<StorageLocation> {
    if root.trim().is_empty() {
        errors.push(format!("{context}: root must not be empty"));
        return None;
    }
    match StorageLocation::parse(root) {
        Ok(location) => Some(location),
        Err(e) => {
            errors.push(format!("{context}: {e}"));
            None
        }
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    let input = validate_root(&config.input.root, "input", &mut errors);
    let output = validate_root(&config.output.root, "output", &mut errors);
    validate_glob(&config.input.song_data, "input.song_data", &mut errors);
    validate_glob(&config.input.log_data, "input.log_data", &mut errors);

    if let (Some(input), Some(output)) = (&input, &output) {
        if output.is_within(input) {
            errors.push(format!(
                "output root '{}' must not be inside input root '{}'",
                config.output.root, config.input.root
            ));
        }
    }

    if let Some(aws) = &config.storage.aws {
        if aws.access_key_id.trim().is_empty() {
            errors.push("storage.aws.access_key_id must not be empty".to_string());
        }
        if aws.secret_access_key.trim().is_empty() {
            errors.push("storage.aws.secret_access_key must not be empty".to_string());
        }
    }

    if config.engine.target_partitions == Some(0) {
        errors.push("engine.target_partitions must be at least 1".to_string());
    }
    if config.engine.batch_size == 0 {
        errors.push("engine.batch_size must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    fn valid_yaml() -> &'static str {
        r#"
version: "1.0"
pipeline: test_pipeline
input:
  root: /tmp/songlake/in
  song_data: song_data/*/*/*/*.json
  log_data: log_data/2018/11/*.json
output:
  root: /tmp/songlake/out
"#
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let config = parse_pipeline_str(valid_yaml()).unwrap();
        assert!(validate_pipeline(&config).is_ok());
    }

    #[test]
    fn test_builtin_defaults_pass() {
        assert!(validate_pipeline(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_wrong_version_fails() {
        let yaml = valid_yaml().replace("\"1.0\"", "\"2.0\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Unsupported pipeline version"));
    }

    #[test]
    fn test_empty_pipeline_name_fails() {
        let yaml = valid_yaml().replace("test_pipeline", "\"\"");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("Pipeline name must not be empty"));
    }

    #[test]
    fn test_non_json_glob_fails() {
        let yaml = valid_yaml().replace("log_data/2018/11/*.json", "log_data/2018/11/*.csv");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("input.log_data"));
    }

    #[test]
    fn test_recursive_glob_fails() {
        let yaml = valid_yaml().replace("song_data/*/*/*/*.json", "song_data/**/*.json");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("recursive"));
    }

    #[test]
    fn test_unsupported_scheme_fails() {
        let yaml = valid_yaml().replace("/tmp/songlake/out", "gs://bucket/out");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("output"));
        assert!(err.contains("gs"));
    }

    #[test]
    fn test_output_inside_input_fails() {
        let yaml = valid_yaml().replace("/tmp/songlake/out", "/tmp/songlake/in/out");
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("must not be inside input root"));
    }

    #[test]
    fn test_blank_credentials_fail() {
        let yaml = format!(
            "{}storage:\n  aws:\n    access_key_id: \"\"\n    secret_access_key: \" \"\n",
            valid_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("access_key_id"));
        assert!(err.contains("secret_access_key"));
    }

    #[test]
    fn test_zero_engine_settings_fail() {
        let yaml = format!(
            "{}engine:\n  target_partitions: 0\n  batch_size: 0\n",
            valid_yaml()
        );
        let config = parse_pipeline_str(&yaml).unwrap();
        let err = validate_pipeline(&config).unwrap_err().to_string();
        assert!(err.contains("target_partitions"));
        assert!(err.contains("batch_size"));
    }
}
