//! Song pipeline: the `songs` and `artists` dimensions.

use std::time::Instant;

use datafusion::error::Result as DFResult;
use datafusion::prelude::*;
use songlake_types::record::song_record_schema;
use songlake_types::{PipelineStage, StarTable};

use super::WrittenTables;
use crate::errors::PipelineError;
use crate::session::{Engine, PersistedTable};

const STAGE: PipelineStage = PipelineStage::SongPipeline;

/// 1:1 projection of song records onto the `songs` columns.
///
/// # Errors
///
/// Fails if the input lacks a song column.
pub fn songs_table(records: DataFrame) -> DFResult<DataFrame> {
    records.select(vec![
        col("song_id"),
        col("title"),
        col("artist_id"),
        col("year"),
        col("duration"),
    ])
}

/// Artist attributes with exact-duplicate rows removed. Rows sharing an
/// `artist_id` but differing in any attribute are all kept.
///
/// # Errors
///
/// Fails if the input lacks an artist column.
pub fn artists_table(records: DataFrame) -> DFResult<DataFrame> {
    records
        .select(vec![
            col("artist_id"),
            col("artist_name").alias("name"),
            col("artist_location").alias("location"),
            col("artist_latitude").alias("latitude"),
            col("artist_longitude").alias("longitude"),
        ])?
        .distinct()
}

/// The `songs` table as persisted by a completed song pipeline.
///
/// Only [`run_song_pipeline`] creates one, so holding it proves `songs` was
/// written and flushed before anything reads it back.
#[derive(Debug, Clone)]
pub struct PersistedSongs(PersistedTable);

impl PersistedSongs {
    #[must_use]
    pub fn table(&self) -> &PersistedTable {
        &self.0
    }
}

/// Output of the song pipeline.
#[derive(Debug, Clone)]
pub struct SongPhase {
    pub songs: PersistedSongs,
    pub artists: PersistedTable,
    pub files: usize,
}

/// Read song records, then write `songs` (partitioned by year and artist)
/// and `artists`.
///
/// # Errors
///
/// Any read, plan or write failure aborts the stage.
pub async fn run_song_pipeline(
    engine: &dyn Engine,
    pattern: &str,
    written: &mut WrittenTables,
) -> Result<SongPhase, PipelineError> {
    let started = Instant::now();
    tracing::info!(pattern, "Song pipeline started");

    let source = engine
        .read_records(STAGE, pattern, &song_record_schema())
        .await?;
    tracing::info!(files = source.files, "Song files resolved");

    let songs = songs_table(source.frame.clone())
        .map_err(|e| PipelineError::engine(STAGE, "PLAN_FAILED", e))?;
    let songs = engine.write_table(STAGE, StarTable::Songs, songs).await?;
    written.record(&songs);

    let artists = artists_table(source.frame)
        .map_err(|e| PipelineError::engine(STAGE, "PLAN_FAILED", e))?;
    let artists = engine.write_table(STAGE, StarTable::Artists, artists).await?;
    written.record(&artists);

    tracing::info!(
        songs = songs.summary.rows_written,
        artists = artists.summary.rows_written,
        duration_secs = started.elapsed().as_secs_f64(),
        "Song pipeline finished"
    );

    Ok(SongPhase {
        songs: PersistedSongs(songs),
        artists,
        files: source.files,
    })
}
