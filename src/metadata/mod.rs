//! Audio tag extraction over byte-range fetches
//!
//! The position of a tag inside a remote file is unknown, so a few small
//! ranges are probed in turn: the front of the file, the last ten bytes (a
//! v2.4 footer), and the 128-byte ID3v1 trailer together with any v2 tag
//! sitting just before it. Announced tag sizes are checked against the file
//! size and a fixed cap before anything past the probes is fetched, so whole
//! files are never downloaded.

pub mod id3;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ftpscout_core::{AudioTags, FileEntry};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ftp::{Connector, FtpError, RemoteSession};
use id3::{HEADER_LEN, TagError, V1_LEN, check_tag_len};

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Ftp(#[from] FtpError),

    #[error(transparent)]
    Tag(#[from] TagError),
}

/// Locate and decode the tags of one remote file
pub async fn read_tags(
    session: &mut dyn RemoteSession,
    file: &FileEntry,
) -> Result<AudioTags, MetadataError> {
    let path = file.path.as_str();
    let size = file.size;
    if size < HEADER_LEN {
        return Ok(AudioTags::default());
    }

    let head = session.fetch_range(path, 0, HEADER_LEN).await?;
    if let Some(header) = id3::parse_header(&head) {
        check_tag_len(header.total_len(), size)?;
        let mut tag = head;
        tag.extend(session.fetch_range(path, HEADER_LEN, header.size as u64).await?);
        return Ok(id3::parse_v2(&tag)?);
    }

    let tail = session.fetch_range(path, size - HEADER_LEN, HEADER_LEN).await?;
    if let Some(footer) = id3::parse_footer(&tail) {
        let total = footer.size as u64 + 2 * HEADER_LEN;
        check_tag_len(total, size)?;
        let tag = session.fetch_range(path, size - total, total).await?;
        return Ok(id3::parse_v2(&tag)?);
    }

    if size < V1_LEN {
        return Ok(AudioTags::default());
    }
    let trailer = session.fetch_range(path, size - V1_LEN, V1_LEN).await?;
    let Some(legacy) = id3::parse_v1(&trailer) else {
        return Ok(AudioTags::default());
    };

    let mut tags = AudioTags::default();
    if size >= V1_LEN + HEADER_LEN {
        let before = session
            .fetch_range(path, size - V1_LEN - HEADER_LEN, HEADER_LEN)
            .await?;
        if let Some(footer) = id3::parse_footer(&before) {
            let total = footer.size as u64 + 2 * HEADER_LEN;
            match check_tag_len(total, size - V1_LEN) {
                Ok(()) => {
                    let tag = session.fetch_range(path, size - V1_LEN - total, total).await?;
                    match id3::parse_v2(&tag) {
                        Ok(modern) => tags = modern,
                        Err(e) => debug!(path, error = %e, "Ignoring tag before ID3v1 trailer"),
                    }
                }
                Err(e) => debug!(path, error = %e, "Ignoring tag before ID3v1 trailer"),
            }
        }
    }

    tags.fill_from(legacy);
    Ok(tags)
}

/// Decides which files get tag extraction and opens the sessions for it
pub struct MetadataExtractor {
    connector: Arc<dyn Connector>,
    extensions: HashSet<String>,
}

impl MetadataExtractor {
    pub fn new(connector: Arc<dyn Connector>, extensions: &[String]) -> Self {
        Self {
            connector,
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    pub fn wants(&self, file: &FileEntry) -> bool {
        self.extensions.contains(&file.extension().to_ascii_lowercase())
    }

    /// Start extracting from one server; the connection is opened on first use
    pub fn begin(&self, address: Ipv4Addr) -> ExtractionRun<'_> {
        ExtractionRun {
            extractor: self,
            address,
            session: None,
            unreachable: false,
        }
    }
}

/// Extraction state for one update cycle of one server
pub struct ExtractionRun<'a> {
    extractor: &'a MetadataExtractor,
    address: Ipv4Addr,
    session: Option<Box<dyn RemoteSession>>,
    unreachable: bool,
}

impl ExtractionRun<'_> {
    /// Tags for `file`, empty when it is not an audio file or anything fails
    pub async fn tags_for(&mut self, file: &FileEntry) -> AudioTags {
        if !self.extractor.wants(file) || self.unreachable {
            return AudioTags::default();
        }

        if self.session.is_none() {
            match self.extractor.connector.connect(self.address).await {
                Ok(session) => self.session = Some(session),
                Err(e) => {
                    warn!(address = %self.address, error = %e, "No session for tag extraction");
                    self.unreachable = true;
                    return AudioTags::default();
                }
            }
        }
        let Some(session) = self.session.as_mut() else {
            return AudioTags::default();
        };

        match read_tags(session.as_mut(), file).await {
            Ok(tags) => tags,
            Err(MetadataError::Ftp(e)) if !e.is_permanent() => {
                warn!(path = %file.path, error = %e, "Tag fetch failed, dropping session");
                self.session = None;
                AudioTags::default()
            }
            Err(e) => {
                debug!(path = %file.path, error = %e, "No usable tags");
                AudioTags::default()
            }
        }
    }

    pub async fn finish(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        MockServer, at, id3v1_trailer, id3v23_tag, id3v24_tag_with_footer, v23_frame, v24_frame,
    };

    const ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

    fn audio(len: usize) -> Vec<u8> {
        vec![0x55; len]
    }

    async fn extract(server: &MockServer, path: &str, size: u64) -> AudioTags {
        let extractor = MetadataExtractor::new(Arc::new(server.clone()), &["mp3".to_string()]);
        let mut run = extractor.begin(ADDR);
        let tags = run.tags_for(&FileEntry::new(path, size, at(2020, 1, 1))).await;
        run.finish().await;
        tags
    }

    #[tokio::test]
    async fn test_front_tag() {
        let mut content = id3v23_tag(&[v23_frame(b"TIT2", "Front")]);
        content.extend(audio(400));
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/a.mp3", content, at(2020, 1, 1));

        let tags = extract(&server, "/a.mp3", size).await;
        assert_eq!(tags.title.as_deref(), Some("Front"));
        assert_eq!(server.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_trailing_tag_found_by_footer() {
        let mut content = audio(400);
        content.extend(id3v24_tag_with_footer(&[v24_frame(b"TPE1", "Tail")]));
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/b.mp3", content, at(2020, 1, 1));

        let tags = extract(&server, "/b.mp3", size).await;
        assert_eq!(tags.artist.as_deref(), Some("Tail"));
    }

    #[tokio::test]
    async fn test_legacy_trailer_only() {
        let mut content = audio(500);
        content.extend(id3v1_trailer("Old Song", "Old Band", "Old Album", "1977", 0));
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/c.mp3", content, at(2020, 1, 1));

        let tags = extract(&server, "/c.mp3", size).await;
        assert_eq!(tags.title.as_deref(), Some("Old Song"));
        assert_eq!(tags.artist.as_deref(), Some("Old Band"));
        assert_eq!(tags.album.as_deref(), Some("Old Album"));
        assert_eq!(tags.year.as_deref(), Some("1977"));
        assert_eq!(tags.track, None);
        // head, last ten bytes, trailer, the ten bytes before it
        assert_eq!(server.fetch_count(), 4);
    }

    #[tokio::test]
    async fn test_modern_tag_before_legacy_trailer_wins() {
        let mut content = audio(300);
        content.extend(id3v24_tag_with_footer(&[
            v24_frame(b"TIT2", "Modern Title"),
            v24_frame(b"TALB", "Modern Album"),
        ]));
        content.extend(id3v1_trailer("Legacy Title", "Legacy Artist", "Legacy Album", "2001", 7));
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/d.mp3", content, at(2020, 1, 1));

        let tags = extract(&server, "/d.mp3", size).await;
        assert_eq!(tags.title.as_deref(), Some("Modern Title"));
        assert_eq!(tags.album.as_deref(), Some("Modern Album"));
        assert_eq!(tags.artist.as_deref(), Some("Legacy Artist"));
        assert_eq!(tags.year.as_deref(), Some("2001"));
        assert_eq!(tags.track.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_untagged_and_unwanted_files() {
        let server = MockServer::new();
        server.add_file_with_content("/plain.mp3", audio(1000), at(2020, 1, 1));
        server.add_file_with_content("/notes.txt", audio(1000), at(2020, 1, 1));

        assert!(extract(&server, "/plain.mp3", 1000).await.is_empty());

        let fetches = server.fetch_count();
        assert!(extract(&server, "/notes.txt", 1000).await.is_empty());
        assert_eq!(server.fetch_count(), fetches);
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_tag_is_not_fatal() {
        // header announces far more than the file holds
        let mut content = b"ID3\x03\x00\x00\x00\x7f\x7f\x7f".to_vec();
        content.extend(audio(50));
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/broken.MP3", content, at(2020, 1, 1));

        assert!(extract(&server, "/broken.MP3", size).await.is_empty());
        assert_eq!(server.bytes_fetched(), HEADER_LEN);
    }

    #[tokio::test]
    async fn test_oversized_front_tag_is_not_downloaded() {
        // 2 MiB announced, and the file really is that long
        let mut content = b"ID3\x03\x00\x00\x01\x00\x00\x00".to_vec();
        content.extend(audio(3 << 20));
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/huge.mp3", content, at(2020, 1, 1));

        assert!(extract(&server, "/huge.mp3", size).await.is_empty());
        assert_eq!(server.bytes_fetched(), HEADER_LEN);
    }

    #[tokio::test]
    async fn test_oversized_footer_is_not_downloaded() {
        let mut content = audio(5000);
        // footer claiming a tag larger than the whole file
        content.extend_from_slice(b"3DI\x04\x00\x10\x7f\x7f\x7f\x7f");
        let size = content.len() as u64;

        let server = MockServer::new();
        server.add_file_with_content("/tail.mp3", content, at(2020, 1, 1));

        assert!(extract(&server, "/tail.mp3", size).await.is_empty());
        assert_eq!(server.bytes_fetched(), 2 * HEADER_LEN);
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_empty_tags() {
        let server = MockServer::new();
        server.add_file_with_content("/a.mp3", audio(100), at(2020, 1, 1));
        server.refuse_connections(true);

        assert!(extract(&server, "/a.mp3", 100).await.is_empty());
    }
}
