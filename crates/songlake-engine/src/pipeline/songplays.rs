//! Log pipeline, fact half: attributing play events to songs and writing
//! the `songplays` table.
//!
//! The log stream carries no song identifier, so events are matched to
//! songs on `songs.title == log.song`. A title can name several songs; the
//! [`TitleMatchPolicy`] decides whether such events fan out, keep the
//! lowest `song_id`, or fail the run.

use std::time::Instant;

use datafusion::arrow::array::AsArray;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::JoinType;
use datafusion::error::Result as DFResult;
use datafusion::functions_aggregate::expr_fn::{count, min};
use datafusion::prelude::*;
use songlake_types::{PipelineStage, StageError, StarTable};

use super::logs::{calendar_field, load_play_events, user_id_expr};
use super::songs::PersistedSongs;
use super::WrittenTables;
use crate::config::types::TitleMatchPolicy;
use crate::errors::PipelineError;
use crate::session::{Engine, PersistedTable};
use crate::surrogate::assign_ids;

const STAGE: PipelineStage = PipelineStage::SongplayFacts;

/// Ambiguous titles reported when the `reject` policy fails a run.
pub const MAX_REPORTED_TITLES: usize = 5;

/// The songs a play event may be matched against, shaped by `policy`.
///
/// `FanOut` and `Reject` keep every song. `FirstMatch` keeps, per title,
/// the song with the lowest `song_id`.
///
/// # Errors
///
/// Fails if the songs relation lacks `song_id`, `title` or `artist_id`.
pub fn candidate_songs(songs: DataFrame, policy: TitleMatchPolicy) -> DFResult<DataFrame> {
    let songs = songs.select(vec![col("song_id"), col("title"), col("artist_id")])?;
    match policy {
        TitleMatchPolicy::FanOut | TitleMatchPolicy::Reject => Ok(songs),
        TitleMatchPolicy::FirstMatch => {
            let chosen = songs.clone().aggregate(
                vec![col("title").alias("chosen_title")],
                vec![min(col("song_id")).alias("chosen_song_id")],
            )?;
            songs
                .join(
                    chosen,
                    JoinType::Inner,
                    &["title", "song_id"],
                    &["chosen_title", "chosen_song_id"],
                    None,
                )?
                .select(vec![col("song_id"), col("title"), col("artist_id")])?
                .distinct()
        }
    }
}

/// Titles that are both played and shared by more than one song, sorted,
/// at most `limit` of them.
///
/// # Errors
///
/// Propagates planning and execution failures.
pub async fn ambiguous_titles(
    plays: DataFrame,
    songs: DataFrame,
    limit: usize,
) -> DFResult<Vec<String>> {
    let shared = songs
        .aggregate(vec![col("title")], vec![count(col("song_id")).alias("candidates")])?
        .filter(col("candidates").gt(lit(1_i64)))?;
    let batches = plays
        .select(vec![col("song")])?
        .distinct()?
        .join(shared, JoinType::Inner, &["song"], &["title"], None)?
        .select(vec![cast(col("song"), DataType::Utf8).alias("song")])?
        .sort(vec![col("song").sort(true, false)])?
        .limit(0, Some(limit))?
        .collect()
        .await?;

    Ok(batches
        .iter()
        .flat_map(|batch| {
            batch
                .column(0)
                .as_string::<i32>()
                .iter()
                .flatten()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect())
}

/// Inner equi-join of play events to candidate songs, projected onto the
/// fact columns (everything but `songplay_id`). Unmatched events drop out.
///
/// # Errors
///
/// Fails if either side lacks a joined or projected column.
pub fn match_plays(plays: DataFrame, songs: DataFrame) -> DFResult<DataFrame> {
    plays
        .join(songs, JoinType::Inner, &["song"], &["title"], None)?
        .select(vec![
            col("start_time"),
            user_id_expr(),
            col("level"),
            col("song_id"),
            col("artist_id"),
            ident("sessionId").alias("session_id"),
            col("location"),
            ident("userAgent").alias("user_agent"),
        ])
}

/// Final `songplays` layout: the nine fact columns plus `year` and `month`
/// partition columns derived from `start_time`.
///
/// # Errors
///
/// Fails if a fact column is missing.
pub fn songplays_table(with_ids: DataFrame) -> DFResult<DataFrame> {
    with_ids
        .select(vec![
            col("songplay_id"),
            col("start_time"),
            col("user_id"),
            col("level"),
            col("song_id"),
            col("artist_id"),
            col("session_id"),
            col("location"),
            col("user_agent"),
        ])?
        .with_column("year", calendar_field("year"))?
        .with_column("month", calendar_field("month"))
}

/// Output of the fact stage.
#[derive(Debug, Clone)]
pub struct SongplayFacts {
    pub songplays: PersistedTable,
    pub files: usize,
}

/// Re-load play events, read the persisted `songs` table back and write
/// `songplays` partitioned by year and month.
///
/// Taking [`PersistedSongs`] by value ties this stage to a completed song
/// pipeline.
///
/// # Errors
///
/// Fails on any read, plan or write failure, and with
/// `AMBIGUOUS_SONG_TITLE` under [`TitleMatchPolicy::Reject`].
pub async fn run_songplays(
    engine: &dyn Engine,
    pattern: &str,
    songs: PersistedSongs,
    policy: TitleMatchPolicy,
    written: &mut WrittenTables,
) -> Result<SongplayFacts, PipelineError> {
    let started = Instant::now();
    tracing::info!(pattern, policy = %policy, "Songplay facts started");

    let plays = load_play_events(engine, STAGE, pattern).await?;
    let song_rows = engine.read_table(STAGE, songs.table()).await?;
    let candidates = candidate_songs(song_rows, policy)
        .map_err(|e| PipelineError::engine(STAGE, "PLAN_FAILED", e))?;

    if policy == TitleMatchPolicy::Reject {
        let titles = ambiguous_titles(plays.frame.clone(), candidates.clone(), MAX_REPORTED_TITLES)
            .await
            .map_err(|e| PipelineError::engine(STAGE, "TITLE_CHECK_FAILED", e))?;
        if !titles.is_empty() {
            return Err(StageError::data(
                STAGE,
                "AMBIGUOUS_SONG_TITLE",
                format!("played titles name more than one song: {}", titles.join(", ")),
            )
            .with_details(serde_json::json!({ "titles": titles }))
            .into());
        }
    }

    let matched = match_plays(plays.frame, candidates)
        .map_err(|e| PipelineError::engine(STAGE, "PLAN_FAILED", e))?;
    let with_ids = assign_ids(engine.context(), matched, "songplay_id")
        .map_err(|e| PipelineError::engine(STAGE, "ID_ASSIGNMENT_FAILED", e))?;
    let facts =
        songplays_table(with_ids).map_err(|e| PipelineError::engine(STAGE, "PLAN_FAILED", e))?;

    let songplays = engine.write_table(STAGE, StarTable::Songplays, facts).await?;
    written.record(&songplays);

    tracing::info!(
        songplays = songplays.summary.rows_written,
        partitions = songplays.summary.partitions,
        duration_secs = started.elapsed().as_secs_f64(),
        "Songplay facts finished"
    );

    Ok(SongplayFacts {
        songplays,
        files: plays.files,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use datafusion::arrow::datatypes::Int64Type;
    use songlake_types::{ErrorCategory, LogRecord, SongRecord};

    use super::*;
    use crate::pipeline::songs::run_song_pipeline;
    use crate::pipeline::testing::{
        page_event, play, row_count, rows, song, MemoryEngine, LOG_GLOB, SONG_GLOB,
    };

    const TS: i64 = 1_541_121_934_796;

    async fn run(
        songs: &[SongRecord],
        logs: &[LogRecord],
        policy: TitleMatchPolicy,
    ) -> (MemoryEngine, Result<SongplayFacts, PipelineError>) {
        let engine = MemoryEngine::new().with_songs(songs).with_logs(logs);
        let mut written = WrittenTables::default();
        let phase = run_song_pipeline(&engine, SONG_GLOB, &mut written)
            .await
            .unwrap();
        let facts = run_songplays(&engine, LOG_GLOB, phase.songs, policy, &mut written).await;
        (engine, facts)
    }

    fn songplay_ids(engine: &MemoryEngine) -> Vec<i64> {
        engine
            .written(StarTable::Songplays)
            .unwrap()
            .iter()
            .flat_map(|b| {
                b.column_by_name("songplay_id")
                    .unwrap()
                    .as_primitive::<Int64Type>()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    #[tokio::test]
    async fn each_matching_event_becomes_a_fact() {
        let (engine, facts) = run(
            &[song("SOA1", "Song A", "ART1", 2001)],
            &[
                play("8", "Song A", 139, TS),
                play("8", "Song A", 140, TS + 5_000),
                play("8", "Unknown Title", 141, TS + 9_000),
            ],
            TitleMatchPolicy::FanOut,
        )
        .await;
        assert_eq!(facts.unwrap().songplays.summary.rows_written, 2);

        let batches = engine.written(StarTable::Songplays).unwrap();
        assert_eq!(
            rows(&batches, &["song_id", "artist_id", "session_id", "user_id", "year", "month"]),
            vec![
                vec!["SOA1", "ART1", "139", "8", "2018", "11"],
                vec!["SOA1", "ART1", "140", "8", "2018", "11"],
            ]
        );
    }

    #[tokio::test]
    async fn output_has_the_fact_columns_in_order() {
        let (engine, facts) = run(
            &[song("SOA1", "Song A", "ART1", 2001)],
            &[play("8", "Song A", 139, TS)],
            TitleMatchPolicy::FanOut,
        )
        .await;
        facts.unwrap();
        let batches = engine.written(StarTable::Songplays).unwrap();
        let schema = batches[0].schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, StarTable::Songplays.columns());
        assert_eq!(
            rows(&batches, &["level", "location", "user_agent"]),
            vec![vec!["free", "Phoenix-Mesa-Scottsdale, AZ", "Mozilla/5.0"]]
        );
    }

    #[tokio::test]
    async fn non_play_events_never_match() {
        let (engine, facts) = run(
            &[song("SOA1", "Song A", "ART1", 2001)],
            &[
                play("8", "Song A", 139, TS),
                LogRecord {
                    song: Some("Song A".to_string()),
                    ..page_event("8", "Home", TS)
                },
            ],
            TitleMatchPolicy::FanOut,
        )
        .await;
        facts.unwrap();
        assert_eq!(row_count(&engine.written(StarTable::Songplays).unwrap()), 1);
    }

    #[tokio::test]
    async fn fan_out_keeps_ids_unique() {
        let (engine, facts) = run(
            &[
                song("SOA1", "Intro", "ART1", 2001),
                song("SOB2", "Intro", "ART2", 2005),
            ],
            &[play("8", "Intro", 139, TS), play("9", "Intro", 140, TS)],
            TitleMatchPolicy::FanOut,
        )
        .await;
        assert_eq!(facts.unwrap().songplays.summary.rows_written, 4);

        let ids = songplay_ids(&engine);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
        assert!(ids.iter().all(|id| *id >= 0));
    }

    #[tokio::test]
    async fn first_match_keeps_lowest_song_id() {
        let (engine, facts) = run(
            &[
                song("SOB2", "Intro", "ART2", 2005),
                song("SOA1", "Intro", "ART1", 2001),
                song("SOC3", "Outro", "ART3", 2007),
            ],
            &[play("8", "Intro", 139, TS), play("9", "Outro", 140, TS)],
            TitleMatchPolicy::FirstMatch,
        )
        .await;
        assert_eq!(facts.unwrap().songplays.summary.rows_written, 2);
        assert_eq!(
            rows(&engine.written(StarTable::Songplays).unwrap(), &["session_id", "song_id"]),
            vec![vec!["139", "SOA1"], vec!["140", "SOC3"]]
        );
    }

    #[tokio::test]
    async fn reject_fails_on_played_ambiguous_title() {
        let (engine, facts) = run(
            &[
                song("SOA1", "Intro", "ART1", 2001),
                song("SOB2", "Intro", "ART2", 2005),
                song("SOC3", "Outro", "ART3", 2007),
            ],
            &[play("8", "Intro", 139, TS), play("9", "Outro", 140, TS)],
            TitleMatchPolicy::Reject,
        )
        .await;
        let err = facts.unwrap_err();
        let stage_err = err.as_stage_error().unwrap();
        assert_eq!(stage_err.category, ErrorCategory::Data);
        assert_eq!(stage_err.code, "AMBIGUOUS_SONG_TITLE");
        assert_eq!(
            stage_err.details.as_ref().unwrap()["titles"],
            serde_json::json!(["Intro"])
        );
        assert!(engine.written(StarTable::Songplays).is_none());
    }

    #[tokio::test]
    async fn reject_ignores_ambiguous_titles_nobody_played() {
        let (_engine, facts) = run(
            &[
                song("SOA1", "Intro", "ART1", 2001),
                song("SOB2", "Intro", "ART2", 2005),
                song("SOC3", "Outro", "ART3", 2007),
            ],
            &[play("9", "Outro", 140, TS)],
            TitleMatchPolicy::Reject,
        )
        .await;
        assert_eq!(facts.unwrap().songplays.summary.rows_written, 1);
    }

    #[tokio::test]
    async fn no_matches_writes_an_empty_table() {
        let (engine, facts) = run(
            &[song("SOA1", "Song A", "ART1", 2001)],
            &[play("8", "Unknown Title", 139, TS)],
            TitleMatchPolicy::FanOut,
        )
        .await;
        assert_eq!(facts.unwrap().songplays.summary.rows_written, 0);
        assert_eq!(row_count(&engine.written(StarTable::Songplays).unwrap()), 0);
    }
}
