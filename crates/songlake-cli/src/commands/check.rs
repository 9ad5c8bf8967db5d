use std::path::Path;

use anyhow::Result;
use songlake_engine::orchestrator;

/// Execute the `check` command: validate configuration, resolve inputs and
/// probe the output root.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = super::load_pipeline(pipeline_path)?;
    println!("Pipeline structure: OK");

    let result = orchestrator::check_pipeline(&config).await?;

    print_count("Song files", &result.song_pattern, result.song_files);
    print_count("Log files", &result.log_pattern, result.log_files);
    if result.output_reachable {
        println!("{:18} OK", "Output root:");
    } else {
        println!("{:18} FAILED", "Output root:");
        println!("  {}", result.output_root);
    }

    if result.is_ready() {
        println!("\nAll checks passed.");
        Ok(())
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn print_count(label: &str, pattern: &str, files: usize) {
    let status = if files > 0 { "OK" } else { "FAILED" };
    println!("{:18} {} ({} matched)", format!("{label}:"), status, files);
    println!("  {pattern}");
}
