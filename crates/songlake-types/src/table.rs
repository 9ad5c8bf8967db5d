//! The star-schema catalogue: table names, output columns and partitioning.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the five output tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StarTable {
    Songs,
    Artists,
    Users,
    Time,
    Songplays,
}

impl StarTable {
    /// All tables in the order a run writes them.
    pub const ALL: [StarTable; 5] = [
        StarTable::Songs,
        StarTable::Artists,
        StarTable::Users,
        StarTable::Time,
        StarTable::Songplays,
    ];

    /// Directory name under the output root.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Songs => "songs",
            Self::Artists => "artists",
            Self::Users => "users",
            Self::Time => "time",
            Self::Songplays => "songplays",
        }
    }

    /// Columns of the derived relation, partition columns included, in
    /// output order.
    #[must_use]
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Songs => &["song_id", "title", "artist_id", "year", "duration"],
            Self::Artists => &["artist_id", "name", "location", "latitude", "longitude"],
            Self::Users => &["user_id", "first_name", "last_name", "gender", "level"],
            Self::Time => &[
                "start_time",
                "hour",
                "day",
                "week",
                "month",
                "year",
                "weekday",
            ],
            Self::Songplays => &[
                "songplay_id",
                "start_time",
                "user_id",
                "level",
                "song_id",
                "artist_id",
                "session_id",
                "location",
                "user_agent",
                "year",
                "month",
            ],
        }
    }

    /// Columns the table is physically partitioned by, outermost first.
    #[must_use]
    pub fn partition_columns(self) -> &'static [&'static str] {
        match self {
            Self::Songs => &["year", "artist_id"],
            Self::Songplays => &["year", "month"],
            Self::Artists | Self::Users | Self::Time => &[],
        }
    }

    /// Key column of the table.
    #[must_use]
    pub fn key_column(self) -> &'static str {
        match self {
            Self::Songs => "song_id",
            Self::Artists => "artist_id",
            Self::Users => "user_id",
            Self::Time => "start_time",
            Self::Songplays => "songplay_id",
        }
    }
}

impl fmt::Display for StarTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StarTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.name() == s)
            .ok_or_else(|| format!("unknown table '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_columns_are_output_columns() {
        for table in StarTable::ALL {
            for col in table.partition_columns() {
                assert!(
                    table.columns().contains(col),
                    "{table}: partition column {col} missing from columns"
                );
            }
            assert!(table.columns().contains(&table.key_column()));
        }
    }

    #[test]
    fn only_songs_and_songplays_are_partitioned() {
        assert_eq!(StarTable::Songs.partition_columns(), &["year", "artist_id"]);
        assert_eq!(StarTable::Songplays.partition_columns(), &["year", "month"]);
        assert!(StarTable::Artists.partition_columns().is_empty());
        assert!(StarTable::Users.partition_columns().is_empty());
        assert!(StarTable::Time.partition_columns().is_empty());
    }

    #[test]
    fn songplays_has_nine_data_columns() {
        let data: Vec<_> = StarTable::Songplays
            .columns()
            .iter()
            .filter(|c| !StarTable::Songplays.partition_columns().contains(c))
            .collect();
        assert_eq!(data.len(), 9);
    }

    #[test]
    fn parse_roundtrip() {
        for table in StarTable::ALL {
            assert_eq!(table.name().parse::<StarTable>().unwrap(), table);
        }
        assert!("plays".parse::<StarTable>().is_err());
    }
}
