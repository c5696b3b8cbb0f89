//! In-memory FTP server for tests
//!
//! The tree is built from file paths; every ancestor directory exists
//! implicitly. Switches allow simulating refused connections, dropped
//! sessions and permission errors per directory.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;

use crate::ftp::{Connector, EntryKind, FtpError, ListEntry, RemoteSession};

pub fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|date| date.and_hms_opt(12, 0, 0))
        .unwrap()
}

struct MockFile {
    size: u64,
    modified: NaiveDateTime,
    content: Vec<u8>,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, MockFile>,
    dirs: BTreeSet<String>,
    extra: HashMap<String, Vec<ListEntry>>,
    refuse_connect: bool,
    transient: HashMap<String, usize>,
    transient_fetch: HashMap<String, usize>,
    denied: HashSet<String>,
    connects: usize,
    listed: Vec<String>,
    fetches: usize,
    bytes_fetched: u64,
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((head, _)) => head,
    }
}

fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl State {
    fn all_dirs(&self) -> BTreeSet<String> {
        let mut dirs = self.dirs.clone();
        dirs.insert("/".to_string());
        for path in self.files.keys() {
            let mut dir = parent(path);
            while dir != "/" {
                dirs.insert(dir.to_string());
                dir = parent(dir);
            }
        }
        dirs
    }

    fn listing(&self, dir: &str) -> Option<Vec<ListEntry>> {
        let dirs = self.all_dirs();
        if !dirs.contains(dir) {
            return None;
        }

        let mut entries = vec![ListEntry {
            name: ".".to_string(),
            kind: EntryKind::CurrentDir,
            size: None,
            modified: None,
            interesting: false,
        }];
        for sub in dirs.iter().filter(|d| *d != "/" && parent(d) == dir) {
            entries.push(ListEntry {
                name: name(sub).to_string(),
                kind: EntryKind::Dir,
                size: None,
                modified: Some(at(2020, 1, 1)),
                interesting: true,
            });
        }
        for (path, file) in self.files.iter().filter(|(p, _)| parent(p) == dir) {
            entries.push(ListEntry {
                name: name(path).to_string(),
                kind: EntryKind::File,
                size: Some(file.size),
                modified: Some(file.modified),
                interesting: true,
            });
        }
        if let Some(extra) = self.extra.get(dir) {
            entries.extend(extra.iter().cloned());
        }
        Some(entries)
    }
}

/// A fake anonymous FTP server shared by all sessions opened on it
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<State>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file whose content is irrelevant
    pub fn add_file(&self, path: &str, size: u64, modified: NaiveDateTime) {
        self.state.lock().files.insert(
            path.to_string(),
            MockFile {
                size,
                modified,
                content: vec![0; size as usize],
            },
        );
    }

    pub fn add_file_with_content(&self, path: &str, content: Vec<u8>, modified: NaiveDateTime) {
        self.state.lock().files.insert(
            path.to_string(),
            MockFile {
                size: content.len() as u64,
                modified,
                content,
            },
        );
    }

    pub fn remove_file(&self, path: &str) {
        self.state.lock().files.remove(path);
    }

    pub fn touch(&self, path: &str, modified: NaiveDateTime) {
        if let Some(file) = self.state.lock().files.get_mut(path) {
            file.modified = modified;
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().dirs.insert(path.to_string());
    }

    /// Append a raw entry to a directory's listing
    pub fn add_entry(&self, dir: &str, entry: ListEntry) {
        self.state
            .lock()
            .extra
            .entry(dir.to_string())
            .or_default()
            .push(entry);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Drop the session the next `times` times `dir` is listed
    pub fn fail_listing(&self, dir: &str, times: usize) {
        self.state.lock().transient.insert(dir.to_string(), times);
    }

    /// Drop the session the next `times` times `path` is fetched from
    pub fn fail_fetch(&self, path: &str, times: usize) {
        self.state.lock().transient_fetch.insert(path.to_string(), times);
    }

    /// Answer 550 whenever `dir` is listed
    pub fn deny_listing(&self, dir: &str) {
        self.state.lock().denied.insert(dir.to_string());
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn listed_dirs(&self) -> Vec<String> {
        self.state.lock().listed.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    /// Total payload returned by every range fetch so far
    pub fn bytes_fetched(&self) -> u64 {
        self.state.lock().bytes_fetched
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self, _addr: Ipv4Addr) -> Result<Box<dyn RemoteSession>, FtpError> {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(FtpError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        state.connects += 1;
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            broken: false,
        }))
    }
}

struct MockSession {
    state: Arc<Mutex<State>>,
    broken: bool,
}

fn not_found(command: &str) -> FtpError {
    FtpError::Reply {
        command: command.to_string(),
        code: 550,
        message: "No such file or directory".to_string(),
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<ListEntry>, FtpError> {
        if self.broken {
            return Err(FtpError::Closed);
        }
        let mut state = self.state.lock();
        if let Some(remaining) = state.transient.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                self.broken = true;
                return Err(FtpError::Closed);
            }
        }
        if state.denied.contains(path) {
            return Err(not_found("CWD"));
        }
        state.listed.push(path.to_string());
        state.listing(path).ok_or_else(|| not_found("CWD"))
    }

    async fn fetch_range(&mut self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, FtpError> {
        if self.broken {
            return Err(FtpError::Closed);
        }
        let mut state = self.state.lock();
        if let Some(remaining) = state.transient_fetch.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                self.broken = true;
                return Err(FtpError::Closed);
            }
        }
        state.fetches += 1;
        let file = state.files.get(path).ok_or_else(|| not_found("RETR"))?;
        let end = offset.saturating_add(len).min(file.content.len() as u64) as usize;
        let start = (offset as usize).min(end);
        let chunk = file.content[start..end].to_vec();
        state.bytes_fetched += chunk.len() as u64;
        Ok(chunk)
    }

    async fn close(&mut self) {}
}

fn syncsafe(n: u32) -> [u8; 4] {
    [
        ((n >> 21) & 0x7f) as u8,
        ((n >> 14) & 0x7f) as u8,
        ((n >> 7) & 0x7f) as u8,
        (n & 0x7f) as u8,
    ]
}

/// ISO-8859-1 text frame for an ID3v2.3 tag
pub fn v23_frame(id: &[u8; 4], text: &str) -> Vec<u8> {
    let mut data = vec![0u8];
    data.extend_from_slice(text.as_bytes());
    let mut frame = id.to_vec();
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend(data);
    frame
}

/// UTF-8 text frame for an ID3v2.4 tag
pub fn v24_frame(id: &[u8; 4], text: &str) -> Vec<u8> {
    let mut data = vec![3u8];
    data.extend_from_slice(text.as_bytes());
    let mut frame = id.to_vec();
    frame.extend_from_slice(&syncsafe(data.len() as u32));
    frame.extend_from_slice(&[0, 0]);
    frame.extend(data);
    frame
}

/// Complete ID3v2.3 tag with some trailing padding
pub fn id3v23_tag(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut body = frames.concat();
    body.extend_from_slice(&[0; 16]);
    let mut tag = b"ID3\x03\x00\x00".to_vec();
    tag.extend_from_slice(&syncsafe(body.len() as u32));
    tag.extend(body);
    tag
}

/// ID3v2.4 tag with a footer, as appended at the end of a file
pub fn id3v24_tag_with_footer(frames: &[Vec<u8>]) -> Vec<u8> {
    let body = frames.concat();
    let size = syncsafe(body.len() as u32);
    let mut tag = b"ID3\x04\x00\x10".to_vec();
    tag.extend_from_slice(&size);
    tag.extend(body);
    tag.extend_from_slice(b"3DI\x04\x00\x10");
    tag.extend_from_slice(&size);
    tag
}

/// 128-byte ID3v1.1 trailer
pub fn id3v1_trailer(title: &str, artist: &str, album: &str, year: &str, track: u8) -> Vec<u8> {
    fn field(text: &str, len: usize) -> Vec<u8> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(len, 0);
        bytes
    }

    let mut tag = b"TAG".to_vec();
    tag.extend(field(title, 30));
    tag.extend(field(artist, 30));
    tag.extend(field(album, 30));
    tag.extend(field(year, 4));
    tag.extend(field("", 28));
    tag.push(0);
    tag.push(track);
    tag.push(0xff); // genre
    tag
}
