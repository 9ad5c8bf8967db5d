//! Log pipeline, dimension half: play-event filtering, the canonical event
//! timestamp and the `users` and `time` dimensions.

use std::time::Instant;

use datafusion::arrow::datatypes::{DataType, TimeUnit};
use datafusion::error::Result as DFResult;
use datafusion::prelude::*;
use songlake_types::record::log_record_schema;
use songlake_types::{PipelineStage, StarTable, NEXT_SONG_PAGE};

use super::WrittenTables;
use crate::errors::PipelineError;
use crate::session::{Engine, PersistedTable};

/// Keep only `NextSong` events.
///
/// # Errors
///
/// Fails if the input has no `page` column.
pub fn next_song_events(records: DataFrame) -> DFResult<DataFrame> {
    records.filter(col("page").eq(lit(NEXT_SONG_PAGE)))
}

/// `ts` (epoch milliseconds) rounded to whole seconds, as a UTC timestamp.
#[must_use]
pub fn start_time_expr() -> Expr {
    let seconds = cast(
        round(vec![ident("ts") / lit(1000.0_f64)]),
        DataType::Int64,
    );
    cast(
        cast(seconds, DataType::Timestamp(TimeUnit::Second, None)),
        DataType::Timestamp(TimeUnit::Microsecond, None),
    )
}

/// Lenient integer user id: unparseable ids (logged-out events) become null.
pub(crate) fn user_id_expr() -> Expr {
    try_cast(ident("userId"), DataType::Int32).alias("user_id")
}

/// A calendar component of `start_time` as Int32.
pub(crate) fn calendar_field(part: &str) -> Expr {
    cast(date_part(lit(part), col("start_time")), DataType::Int32)
}

/// Append the `start_time` column derived from `ts`.
///
/// # Errors
///
/// Fails if the input has no `ts` column.
pub fn with_start_time(events: DataFrame) -> DFResult<DataFrame> {
    events.with_column("start_time", start_time_expr())
}

/// User attributes with exact-duplicate rows removed. A user seen at two
/// levels yields two rows.
///
/// # Errors
///
/// Fails if a user column is missing.
pub fn users_table(plays: DataFrame) -> DFResult<DataFrame> {
    plays
        .select(vec![
            user_id_expr(),
            ident("firstName").alias("first_name"),
            ident("lastName").alias("last_name"),
            col("gender"),
            col("level"),
        ])?
        .distinct()
}

/// Distinct `start_time` values, newest first, with their calendar fields.
/// `weekday` runs from 1 (Sunday) to 7 (Saturday).
///
/// # Errors
///
/// Fails if the input has no `start_time` column.
pub fn time_table(plays: DataFrame) -> DFResult<DataFrame> {
    plays
        .select(vec![col("start_time")])?
        .distinct()?
        .sort(vec![col("start_time").sort(false, false)])?
        .with_column("hour", calendar_field("hour"))?
        .with_column("day", calendar_field("day"))?
        .with_column("week", calendar_field("week"))?
        .with_column("month", calendar_field("month"))?
        .with_column("year", calendar_field("year"))?
        .with_column("weekday", calendar_field("dow") + lit(1_i32))
}

/// Filtered play events with `start_time`, plus the number of files read.
pub struct PlayEvents {
    pub frame: DataFrame,
    pub files: usize,
}

/// Load log records matched by `pattern` and reduce them to play events.
///
/// # Errors
///
/// Fails if nothing matches or the records cannot be planned.
pub async fn load_play_events(
    engine: &dyn Engine,
    stage: PipelineStage,
    pattern: &str,
) -> Result<PlayEvents, PipelineError> {
    let source = engine
        .read_records(stage, pattern, &log_record_schema())
        .await?;
    let frame = next_song_events(source.frame)
        .and_then(with_start_time)
        .map_err(|e| PipelineError::engine(stage, "PLAN_FAILED", e))?;
    Ok(PlayEvents {
        frame,
        files: source.files,
    })
}

/// Output of the dimension half of the log pipeline.
#[derive(Debug, Clone)]
pub struct LogDimensions {
    pub users: PersistedTable,
    pub time: PersistedTable,
    pub files: usize,
}

/// Write `users` and `time` from the play events matched by `pattern`.
///
/// # Errors
///
/// Any read, plan or write failure aborts the stage.
pub async fn run_log_dimensions(
    engine: &dyn Engine,
    pattern: &str,
    written: &mut WrittenTables,
) -> Result<LogDimensions, PipelineError> {
    let stage = PipelineStage::LogDimensions;
    let started = Instant::now();
    tracing::info!(pattern, "Log dimensions started");

    let plays = load_play_events(engine, stage, pattern).await?;
    tracing::info!(files = plays.files, "Log files resolved");

    let users = users_table(plays.frame.clone())
        .map_err(|e| PipelineError::engine(stage, "PLAN_FAILED", e))?;
    let users = engine.write_table(stage, StarTable::Users, users).await?;
    written.record(&users);

    let time = time_table(plays.frame)
        .map_err(|e| PipelineError::engine(stage, "PLAN_FAILED", e))?;
    let time = engine.write_table(stage, StarTable::Time, time).await?;
    written.record(&time);

    tracing::info!(
        users = users.summary.rows_written,
        time = time.summary.rows_written,
        duration_secs = started.elapsed().as_secs_f64(),
        "Log dimensions finished"
    );

    Ok(LogDimensions {
        users,
        time,
        files: plays.files,
    })
}
