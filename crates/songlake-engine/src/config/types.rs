use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_INPUT_ROOT: &str = "s3a://udacity-dend/";
pub const DEFAULT_OUTPUT_ROOT: &str = "s3a://data-lake-simple-storage/";
pub const DEFAULT_SONG_GLOB: &str = "song_data/*/*/*/*.json";
pub const DEFAULT_LOG_GLOB: &str = "log_data/2018/11/*.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_pipeline_name")]
    pub pipeline: String,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub songplays: SongplaysConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_pipeline_name() -> String {
    "sparkify".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            pipeline: default_pipeline_name(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            songplays: SongplaysConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(default = "default_input_root")]
    pub root: String,
    #[serde(default = "default_song_glob")]
    pub song_data: String,
    #[serde(default = "default_log_glob")]
    pub log_data: String,
}

fn default_input_root() -> String {
    DEFAULT_INPUT_ROOT.to_string()
}
fn default_song_glob() -> String {
    DEFAULT_SONG_GLOB.to_string()
}
fn default_log_glob() -> String {
    DEFAULT_LOG_GLOB.to_string()
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            root: default_input_root(),
            song_data: default_song_glob(),
            log_data: default_log_glob(),
        }
    }
}

impl InputConfig {
    /// Full glob for song-metadata files.
    #[must_use]
    pub fn song_pattern(&self) -> String {
        join_root(&self.root, &self.song_data)
    }

    /// Full glob for session-log files.
    #[must_use]
    pub fn log_pattern(&self) -> String {
        join_root(&self.root, &self.log_data)
    }
}

/// Join a root location and a relative path with exactly one `/`.
#[must_use]
pub fn join_root(root: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_root")]
    pub root: String,
    #[serde(default)]
    pub commit: CommitProtocol,
}

fn default_output_root() -> String {
    DEFAULT_OUTPUT_ROOT.to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            commit: CommitProtocol::default(),
        }
    }
}

/// How a table write is made visible at its final location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitProtocol {
    /// Clear the table location, then write straight into it.
    #[default]
    Direct,
    /// Write under a per-run staging prefix, then promote into place.
    Staged,
}

impl fmt::Display for CommitProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Staged => f.write_str("staged"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution partitions; `None` lets the engine use all cores.
    #[serde(default)]
    pub target_partitions: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    8192
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_partitions: None,
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SongplaysConfig {
    #[serde(default)]
    pub title_match: TitleMatchPolicy,
}

/// What to do when a play event's song title names more than one song.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMatchPolicy {
    /// Emit one fact row per matching song.
    #[default]
    FanOut,
    /// Keep only the song with the lowest `song_id` for each title.
    FirstMatch,
    /// Fail the run.
    Reject,
}

impl fmt::Display for TitleMatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FanOut => f.write_str("fan_out"),
            Self::FirstMatch => f.write_str("first_match"),
            Self::Reject => f.write_str("reject"),
        }
    }
}
