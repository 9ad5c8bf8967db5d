//! Relational derivations for the five star-schema tables.
//!
//! Each stage is written against the [`Engine`](crate::session::Engine)
//! trait. The pure functions (`songs_table`, `users_table`, ...) only build
//! lazy `DataFrame` plans; the `run_*` functions read inputs, write tables
//! and record what was written.

pub mod logs;
pub mod songplays;
pub mod songs;

#[cfg(test)]
pub(crate) mod testing;

use songlake_types::StarTable;

use crate::result::TableWriteSummary;
use crate::session::PersistedTable;

pub use logs::{run_log_dimensions, LogDimensions, PlayEvents};
pub use songplays::{run_songplays, SongplayFacts};
pub use songs::{run_song_pipeline, PersistedSongs, SongPhase};

/// Tables written so far in a run, in write order.
#[derive(Debug, Default)]
pub struct WrittenTables {
    summaries: Vec<TableWriteSummary>,
}

impl WrittenTables {
    pub fn record(&mut self, persisted: &PersistedTable) {
        self.summaries.push(persisted.summary.clone());
    }

    #[must_use]
    pub fn tables(&self) -> Vec<StarTable> {
        self.summaries.iter().map(|summary| summary.table).collect()
    }

    #[must_use]
    pub fn into_summaries(self) -> Vec<TableWriteSummary> {
        self.summaries
    }
}
