//! In-memory [`Engine`] double for stage tests.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use datafusion::arrow::datatypes::{Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use datafusion::datasource::MemTable;
use datafusion::prelude::*;
use serde::Serialize;
use songlake_types::{LogRecord, PipelineStage, SongRecord, StageError, StarTable};
use tempfile::TempDir;

use crate::errors::PipelineError;
use crate::result::TableWriteSummary;
use crate::session::{Engine, PersistedTable, SourceRelation};

pub(crate) const SONG_GLOB: &str = "memory:///song_data/*/*/*/*.json";
pub(crate) const LOG_GLOB: &str = "memory:///log_data/*.json";

/// Serves JSON inputs from a scratch directory and keeps written tables as
/// record batches.
pub(crate) struct MemoryEngine {
    ctx: SessionContext,
    scratch: TempDir,
    inputs: HashMap<String, PathBuf>,
    tables: Mutex<HashMap<StarTable, (SchemaRef, Vec<RecordBatch>)>>,
}

impl MemoryEngine {
    pub(crate) fn new() -> Self {
        Self {
            ctx: SessionContext::new_with_config(SessionConfig::new().with_target_partitions(4)),
            scratch: tempfile::tempdir().unwrap(),
            inputs: HashMap::new(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn with_records<T: Serialize>(mut self, pattern: &str, records: &[T]) -> Self {
        let path = self.scratch.path().join(format!("input-{}.json", self.inputs.len()));
        let mut file = std::fs::File::create(&path).unwrap();
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
        }
        self.inputs.insert(pattern.to_string(), path);
        self
    }

    pub(crate) fn with_songs(self, songs: &[SongRecord]) -> Self {
        self.with_records(SONG_GLOB, songs)
    }

    pub(crate) fn with_logs(self, logs: &[LogRecord]) -> Self {
        self.with_records(LOG_GLOB, logs)
    }

    pub(crate) fn written(&self, table: StarTable) -> Option<Vec<RecordBatch>> {
        self.tables
            .lock()
            .unwrap()
            .get(&table)
            .map(|(_, batches)| batches.clone())
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn context(&self) -> &SessionContext {
        &self.ctx
    }

    async fn read_records(
        &self,
        stage: PipelineStage,
        pattern: &str,
        schema: &Schema,
    ) -> Result<SourceRelation, PipelineError> {
        let path = self.inputs.get(pattern).ok_or_else(|| {
            StageError::data(stage, "NO_INPUT_FILES", format!("no files match '{pattern}'"))
        })?;
        let frame = self
            .ctx
            .read_json(path.display().to_string(), NdJsonReadOptions::default().schema(schema))
            .await
            .map_err(|e| PipelineError::engine(stage, "READ_FAILED", e))?;
        Ok(SourceRelation { frame, files: 1 })
    }

    async fn write_table(
        &self,
        stage: PipelineStage,
        table: StarTable,
        frame: DataFrame,
    ) -> Result<PersistedTable, PipelineError> {
        let schema = Arc::clone(frame.schema().inner());
        let batches = frame
            .collect()
            .await
            .map_err(|e| PipelineError::engine(stage, "WRITE_FAILED", e))?;
        let rows_written = batches.iter().map(|b| b.num_rows() as u64).sum();
        self.tables
            .lock()
            .unwrap()
            .insert(table, (Arc::clone(&schema), batches));

        Ok(PersistedTable {
            summary: TableWriteSummary {
                table,
                location: format!("memory:///{table}/"),
                rows_written,
                partition_columns: table
                    .partition_columns()
                    .iter()
                    .map(|c| (*c).to_string())
                    .collect(),
                partitions: 0,
                duration_secs: 0.0,
            },
            file_schema: schema,
        })
    }

    async fn read_table(
        &self,
        stage: PipelineStage,
        persisted: &PersistedTable,
    ) -> Result<DataFrame, PipelineError> {
        let (schema, batches) = self
            .tables
            .lock()
            .unwrap()
            .get(&persisted.table())
            .cloned()
            .ok_or_else(|| {
                StageError::internal(stage, "NOT_WRITTEN", persisted.table().to_string())
            })?;
        let provider = MemTable::try_new(schema, vec![batches])
            .map_err(|e| PipelineError::engine(stage, "READ_BACK_FAILED", e))?;
        self.ctx
            .read_table(Arc::new(provider))
            .map_err(|e| PipelineError::engine(stage, "READ_BACK_FAILED", e))
    }
}

/// Render the named columns of every row as strings (nulls as ""), sorted.
pub(crate) fn rows(batches: &[RecordBatch], columns: &[&str]) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = batches
        .iter()
        .flat_map(|batch| {
            (0..batch.num_rows()).map(move |row| {
                columns
                    .iter()
                    .map(|name| {
                        let column = batch.column_by_name(name).unwrap();
                        array_value_to_string(column.as_ref(), row).unwrap()
                    })
                    .collect()
            })
        })
        .collect();
    rows.sort();
    rows
}

pub(crate) fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

pub(crate) fn song(song_id: &str, title: &str, artist_id: &str, year: i64) -> SongRecord {
    SongRecord {
        num_songs: Some(1),
        artist_id: artist_id.to_string(),
        artist_latitude: None,
        artist_longitude: None,
        artist_location: Some(String::new()),
        artist_name: format!("Artist {artist_id}"),
        song_id: song_id.to_string(),
        title: title.to_string(),
        duration: 200.0,
        year,
    }
}

pub(crate) fn play(user_id: &str, song: &str, session_id: i64, ts: i64) -> LogRecord {
    LogRecord {
        artist: Some("Some Artist".to_string()),
        auth: Some("Logged In".to_string()),
        first_name: Some(format!("First{user_id}")),
        gender: Some("F".to_string()),
        item_in_session: Some(0),
        last_name: Some(format!("Last{user_id}")),
        length: Some(200.0),
        level: Some("free".to_string()),
        location: Some("Phoenix-Mesa-Scottsdale, AZ".to_string()),
        method: Some("PUT".to_string()),
        page: "NextSong".to_string(),
        registration: Some(1_540_344_794_796.0),
        session_id,
        song: Some(song.to_string()),
        status: Some(200),
        ts,
        user_agent: Some("Mozilla/5.0".to_string()),
        user_id: user_id.to_string(),
    }
}

pub(crate) fn page_event(user_id: &str, page: &str, ts: i64) -> LogRecord {
    LogRecord {
        artist: None,
        song: None,
        length: None,
        page: page.to_string(),
        ..play(user_id, "", 1, ts)
    }
}
