use std::path::Path;

use anyhow::Result;
use songlake_engine::orchestrator;

/// Execute the `run` command: load, validate, and run the pipeline.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;

    tracing::info!(
        pipeline = config.pipeline,
        input_root = config.input.root,
        output_root = config.output.root,
        commit = %config.output.commit,
        "Pipeline validated"
    );

    let result = orchestrator::run_pipeline(&config).await?;

    println!("Pipeline '{}' completed successfully.", result.pipeline);
    println!("  Run id:          {}", result.run_id);
    println!("  Song files:      {}", result.song_files);
    println!("  Log files:       {}", result.log_files);
    for table in &result.tables {
        let partitions = if table.partition_columns.is_empty() {
            String::new()
        } else {
            format!(
                " in {} partition(s) by ({})",
                table.partitions,
                table.partition_columns.join(", ")
            )
        };
        println!(
            "  {:<16} {} rows{} ({:.2}s)",
            format!("{}:", table.table),
            table.rows_written,
            partitions,
            table.duration_secs
        );
    }
    println!("  Rows written:    {}", result.rows_written());
    println!("  Duration:        {:.2}s", result.duration_secs);

    // Machine-readable JSON for scripts
    println!("@@SONGLAKE_JSON@@{}", serde_json::to_string(&result)?);

    Ok(())
}
