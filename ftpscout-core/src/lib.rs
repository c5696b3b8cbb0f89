//! Shared types for ftpscout
//!
//! Records exchanged between the crawler, the index and the server registry.
//! Nothing in here performs I/O.

use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Text format used for modified times stored in the index.
///
/// Lexicographic order matches chronological order, so the stored field is
/// sortable as plain text.
pub const MTIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a modified time for storage in the index
pub fn format_mtime(mtime: &NaiveDateTime) -> String {
    mtime.format(MTIME_FORMAT).to_string()
}

/// Parse a stored modified time, `None` if the text is malformed
pub fn parse_mtime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, MTIME_FORMAT).ok()
}

/// A regular file found on a remote server during one crawl
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified: NaiveDateTime,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64, modified: NaiveDateTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
        }
    }

    /// Last path component
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Extension without the leading dot, empty when the name has none.
    /// A leading dot (".profile") does not start an extension.
    pub fn extension(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(idx) if idx > 0 => &name[idx + 1..],
            _ => "",
        }
    }
}

/// Per-server bookkeeping owned by the server registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: i64,
    pub address: Ipv4Addr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Epoch until the first successful scan
    pub last_scanned: DateTime<Utc>,
    pub file_count: u64,
    pub total_size: u64,
}

impl ServerRecord {
    /// The "never" sentinel used for `last_scanned`
    pub fn never() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    /// Whether at least `interval` has elapsed since the last scan
    pub fn is_due(&self, now: DateTime<Utc>, interval: TimeDelta) -> bool {
        now - self.last_scanned >= interval
    }

    /// Whether the server has been silent for longer than `max_offline`
    pub fn is_offline_since(&self, now: DateTime<Utc>, max_offline: TimeDelta) -> bool {
        now - self.last_seen > max_offline
    }
}

/// Tag metadata extracted from an audio file. Absent fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTags {
    pub album: Option<String>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub year: Option<String>,
    pub track: Option<String>,
}

impl AudioTags {
    pub fn is_empty(&self) -> bool {
        self.album.is_none()
            && self.artist.is_none()
            && self.title.is_none()
            && self.year.is_none()
            && self.track.is_none()
    }

    /// Fill every field still missing from `other`
    pub fn fill_from(&mut self, other: AudioTags) {
        fn fill(slot: &mut Option<String>, value: Option<String>) {
            if slot.is_none() {
                *slot = value;
            }
        }

        fill(&mut self.album, other.album);
        fill(&mut self.artist, other.artist);
        fill(&mut self.title, other.title);
        fill(&mut self.year, other.year);
        fill(&mut self.track, other.track);
    }
}

/// Stored fields of one indexed document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub server_id: i64,
    pub path: String,
    pub name: String,
    pub extension: String,
    /// Decimal text, as stored
    pub size: String,
    /// `MTIME_FORMAT` text, as stored
    pub modified: String,
    #[serde(default)]
    pub tags: AudioTags,
}

/// Search results returned by the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub files: Vec<IndexedFile>,
    pub total_found: usize,
    pub query_time_ms: u64,
}

/// Index statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: u64,
    pub servers: u64,
}
