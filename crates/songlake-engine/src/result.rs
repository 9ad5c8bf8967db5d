//! Pipeline execution result types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use songlake_types::StarTable;

/// Outcome of writing one star-schema table.
#[derive(Debug, Clone, Serialize)]
pub struct TableWriteSummary {
    pub table: StarTable,
    /// Final directory URL of the table.
    pub location: String,
    pub rows_written: u64,
    pub partition_columns: Vec<String>,
    /// Distinct partition directories present after the write (0 when unpartitioned).
    pub partitions: usize,
    pub duration_secs: f64,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub song_files: usize,
    pub log_files: usize,
    /// Tables in the order they were written.
    pub tables: Vec<TableWriteSummary>,
    pub duration_secs: f64,
}

impl PipelineResult {
    #[must_use]
    pub fn table(&self, table: StarTable) -> Option<&TableWriteSummary> {
        self.tables.iter().find(|summary| summary.table == table)
    }

    /// Total rows across every table written.
    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.tables.iter().map(|summary| summary.rows_written).sum()
    }
}

/// Result of a pipeline check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub song_pattern: String,
    pub song_files: usize,
    pub log_pattern: String,
    pub log_files: usize,
    pub output_root: String,
    pub output_reachable: bool,
}

impl CheckResult {
    /// Whether a run with this configuration could start.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.song_files > 0 && self.log_files > 0 && self.output_reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(table: StarTable, rows: u64) -> TableWriteSummary {
        TableWriteSummary {
            table,
            location: format!("file:///tmp/out/{table}/"),
            rows_written: rows,
            partition_columns: table
                .partition_columns()
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
            partitions: 0,
            duration_secs: 0.1,
        }
    }

    #[test]
    fn totals_and_lookup() {
        let result = PipelineResult {
            pipeline: "sparkify".into(),
            run_id: "20181102T012535Z".into(),
            started_at: Utc::now(),
            song_files: 2,
            log_files: 1,
            tables: vec![summary(StarTable::Songs, 3), summary(StarTable::Songplays, 4)],
            duration_secs: 1.0,
        };
        assert_eq!(result.rows_written(), 7);
        assert_eq!(result.table(StarTable::Songplays).unwrap().rows_written, 4);
        assert!(result.table(StarTable::Users).is_none());
    }

    #[test]
    fn check_readiness_requires_inputs_and_output() {
        let mut check = CheckResult {
            song_pattern: "/in/song_data/*/*/*/*.json".into(),
            song_files: 1,
            log_pattern: "/in/log_data/*.json".into(),
            log_files: 1,
            output_root: "/out".into(),
            output_reachable: true,
        };
        assert!(check.is_ready());
        check.log_files = 0;
        assert!(!check.is_ready());
    }
}
