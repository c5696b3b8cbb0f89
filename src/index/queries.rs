//! Read-side queries against committed index state

use std::time::Instant;

use ftpscout_core::{AudioTags, IndexStats, IndexedFile, SearchResults};
use rusqlite::{Row, params};

use super::{IndexError, SearchIndex};

const DOCUMENT_COLUMNS: &str = "d.server_id, d.path, d.name, d.extension, d.size, d.modified, \
     d.audio_album, d.audio_artist, d.audio_title, d.audio_year, d.audio_track";

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<IndexedFile> {
    Ok(IndexedFile {
        server_id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        extension: row.get(3)?,
        size: row.get(4)?,
        modified: row.get(5)?,
        tags: AudioTags {
            album: row.get(6)?,
            artist: row.get(7)?,
            title: row.get(8)?,
            year: row.get(9)?,
            track: row.get(10)?,
        },
    })
}

/// Turn free text into an FTS5 query: every word becomes a quoted prefix
/// term, so user input can never be parsed as query syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| format!("\"{}\"*", word.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

impl SearchIndex {
    /// Committed documents of one server
    pub fn documents_for_server(&self, server_id: i64) -> Result<Vec<IndexedFile>, IndexError> {
        let conn = self.reader.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM documents d WHERE d.server_id = ?1 AND d.valid = 1",
            DOCUMENT_COLUMNS
        ))?;
        let docs = stmt
            .query_map(params![server_id], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    /// Full-text search over paths, names, extensions and tags
    pub fn search(&self, query: &str, max_results: usize) -> Result<SearchResults, IndexError> {
        let start = Instant::now();
        let Some(fts) = fts_query(query) else {
            return Ok(SearchResults {
                files: Vec::new(),
                total_found: 0,
                query_time_ms: 0,
            });
        };

        let conn = self.reader.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM documents_fts f JOIN documents d ON d.id = f.rowid \
             WHERE documents_fts MATCH ?1 AND d.valid = 1 \
             ORDER BY f.rank LIMIT ?2",
            DOCUMENT_COLUMNS
        ))?;
        let files = stmt
            .query_map(params![fts, max_results as i64], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total_found: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents_fts f JOIN documents d ON d.id = f.rowid \
             WHERE documents_fts MATCH ?1 AND d.valid = 1",
            params![fts],
            |row| row.get(0),
        )?;

        Ok(SearchResults {
            files,
            total_found: total_found as usize,
            query_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        let conn = self.reader.lock();
        let (documents, servers): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT server_id) FROM documents WHERE valid = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(IndexStats {
            documents: documents as u64,
            servers: servers as u64,
        })
    }
}
