//! Source record shapes and the Arrow schemas they are read with.
//!
//! Both record families arrive as JSON-per-line files. The serde structs
//! describe one line; the schema functions describe the same shape to the
//! dataframe reader so that column types do not depend on which fields a
//! particular shard happens to contain.

use arrow_schema::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};

/// `page` value of log events that represent an actual play.
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// One song-metadata record. Artist attributes are denormalized onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_songs: Option<i64>,
    pub artist_id: String,
    pub artist_latitude: Option<f64>,
    pub artist_longitude: Option<f64>,
    pub artist_location: Option<String>,
    pub artist_name: String,
    pub song_id: String,
    pub title: String,
    pub duration: f64,
    pub year: i64,
}

/// One session-log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    pub first_name: Option<String>,
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_in_session: Option<i64>,
    pub last_name: Option<String>,
    pub length: Option<f64>,
    pub level: Option<String>,
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub page: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<f64>,
    pub session_id: i64,
    pub song: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    /// Event time in epoch milliseconds.
    pub ts: i64,
    pub user_agent: Option<String>,
    /// Numeric id rendered as a string; empty for logged-out events.
    pub user_id: String,
}

impl LogRecord {
    /// Whether this event is a song play.
    #[must_use]
    pub fn is_play(&self) -> bool {
        self.page == NEXT_SONG_PAGE
    }
}

/// Read schema for [`SongRecord`] files.
#[must_use]
pub fn song_record_schema() -> Schema {
    Schema::new(vec![
        Field::new("num_songs", DataType::Int64, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("artist_latitude", DataType::Float64, true),
        Field::new("artist_longitude", DataType::Float64, true),
        Field::new("artist_location", DataType::Utf8, true),
        Field::new("artist_name", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("duration", DataType::Float64, true),
        Field::new("year", DataType::Int64, true),
    ])
}

/// Read schema for [`LogRecord`] files.
#[must_use]
pub fn log_record_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist", DataType::Utf8, true),
        Field::new("auth", DataType::Utf8, true),
        Field::new("firstName", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("itemInSession", DataType::Int64, true),
        Field::new("lastName", DataType::Utf8, true),
        Field::new("length", DataType::Float64, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("page", DataType::Utf8, true),
        Field::new("registration", DataType::Float64, true),
        Field::new("sessionId", DataType::Int64, true),
        Field::new("song", DataType::Utf8, true),
        Field::new("status", DataType::Int64, true),
        Field::new("ts", DataType::Int64, true),
        Field::new("userAgent", DataType::Utf8, true),
        Field::new("userId", DataType::Utf8, true),
    ])
}
