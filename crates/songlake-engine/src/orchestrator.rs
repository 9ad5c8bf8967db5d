//! Pipeline orchestrator: provisions the session, runs the song pipeline,
//! the log dimensions and the songplay facts in order, then releases.

use std::time::Instant;

use chrono::Utc;
use songlake_types::PipelineStage;

use crate::config::types::PipelineConfig;
use crate::errors::PipelineError;
use crate::pipeline::{run_log_dimensions, run_song_pipeline, run_songplays, WrittenTables};
use crate::result::{CheckResult, PipelineResult};
use crate::session::{Engine, SessionGuard};

/// Input file counts seen by a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputCounts {
    pub song_files: usize,
    pub log_files: usize,
}

/// Run every stage against `engine`, recording each table as it lands.
///
/// Phase 1 writes `songs` and `artists`; the log dimensions follow; phase 2
/// consumes the persisted songs and writes `songplays`. The first failure
/// aborts the rest.
///
/// # Errors
///
/// Returns the first stage failure.
pub async fn execute_stages(
    engine: &dyn Engine,
    config: &PipelineConfig,
    written: &mut WrittenTables,
) -> Result<InputCounts, PipelineError> {
    let log_pattern = config.input.log_pattern();

    let songs = run_song_pipeline(engine, &config.input.song_pattern(), written).await?;
    let dimensions = run_log_dimensions(engine, &log_pattern, written).await?;
    run_songplays(
        engine,
        &log_pattern,
        songs.songs,
        config.songplays.title_match,
        written,
    )
    .await?;

    Ok(InputCounts {
        song_files: songs.files,
        log_files: dimensions.files,
    })
}

fn log_failure(err: &PipelineError) {
    if let Some(stage_err) = err.as_stage_error() {
        tracing::error!(
            stage = %stage_err.stage,
            category = %stage_err.category,
            code = %stage_err.code,
            details = stage_err.details.as_ref().map(ToString::to_string),
            "Stage failed, aborting pipeline"
        );
    } else {
        tracing::error!("Infrastructure error, aborting pipeline: {}", err);
    }
}

/// Execute a full pipeline run: all five tables, overwrite semantics.
///
/// The session is released whether or not the stages succeed. On failure
/// the error's details list the tables already written (`completed_tables`);
/// there is no multi-table commit, so those stay overwritten.
///
/// # Errors
///
/// Returns the first session or stage failure.
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineResult, PipelineError> {
    let started_at = Utc::now();
    let started = Instant::now();
    tracing::info!(
        pipeline = config.pipeline,
        input_root = config.input.root,
        output_root = config.output.root,
        title_match = %config.songplays.title_match,
        "Starting pipeline run"
    );

    let guard = SessionGuard::acquire(config.clone()).await?;
    let run_id = guard.session().run_id().to_string();

    let mut written = WrittenTables::default();
    let outcome = execute_stages(guard.session(), config, &mut written).await;
    guard.release().await;

    let counts = match outcome {
        Ok(counts) => counts,
        Err(err) => {
            let err = err.with_completed_tables(&written.tables());
            log_failure(&err);
            return Err(err);
        }
    };

    let result = PipelineResult {
        pipeline: config.pipeline.clone(),
        run_id,
        started_at,
        song_files: counts.song_files,
        log_files: counts.log_files,
        tables: written.into_summaries(),
        duration_secs: started.elapsed().as_secs_f64(),
    };

    tracing::info!(
        pipeline = result.pipeline,
        run_id = result.run_id,
        tables = result.tables.len(),
        rows = result.rows_written(),
        duration_secs = result.duration_secs,
        "Pipeline run finished"
    );
    Ok(result)
}

/// Resolve both input globs and probe the output root without writing.
///
/// # Errors
///
/// Fails if the session cannot be opened or a glob cannot be listed. An
/// unreachable output root is reported in the result, not as an error.
pub async fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult, PipelineError> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");

    let guard = SessionGuard::acquire(config.clone()).await?;
    let session = guard.session();
    let song_pattern = config.input.song_pattern();
    let log_pattern = config.input.log_pattern();

    let outcome = async {
        let song_files = session
            .count_matches(PipelineStage::Check, &song_pattern)
            .await?;
        let log_files = session
            .count_matches(PipelineStage::Check, &log_pattern)
            .await?;
        let output_reachable = match session.probe_output().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Output root is not reachable");
                false
            }
        };
        Ok::<_, PipelineError>(CheckResult {
            song_pattern: song_pattern.clone(),
            song_files,
            log_pattern: log_pattern.clone(),
            log_files,
            output_root: session.output_root().to_string(),
            output_reachable,
        })
    }
    .await;
    guard.release().await;
    outcome
}
