//! ID3 tag decoding
//!
//! Handles ID3v2.2, 2.3 and 2.4 text frames and the 128-byte ID3v1 trailer.
//! Only the handful of fields the index stores are extracted.

use ftpscout_core::AudioTags;
use thiserror::Error;

/// Size of an ID3v2 header or footer
pub const HEADER_LEN: u64 = 10;

/// Size of an ID3v1 trailer
pub const V1_LEN: u64 = 128;

/// Largest ID3v2 tag we are willing to download
pub const MAX_TAG_LEN: u64 = 1 << 20;

#[derive(Error, Debug)]
pub enum TagError {
    #[error("no ID3v2 header")]
    NotATag,

    #[error("unsupported ID3 version 2.{0}")]
    Version(u8),

    #[error("tag truncated: header announces {announced} bytes, got {available}")]
    Truncated { announced: usize, available: usize },

    #[error("tag of {announced} bytes does not fit in {available} bytes")]
    Oversized { announced: u64, available: u64 },
}

/// Parsed ID3v2 header or footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    pub major: u8,
    pub flags: u8,
    /// Length of the tag body, excluding header and footer
    pub size: u32,
}

impl TagHeader {
    pub fn has_footer(&self) -> bool {
        self.major == 4 && self.flags & 0x10 != 0
    }

    /// Bytes the whole tag occupies in the file
    pub fn total_len(&self) -> u64 {
        let footer = if self.has_footer() { HEADER_LEN } else { 0 };
        HEADER_LEN + self.size as u64 + footer
    }
}

/// Reject a tag of `len` bytes that cannot lie within `available` bytes of
/// file or exceeds [`MAX_TAG_LEN`]
pub fn check_tag_len(len: u64, available: u64) -> Result<(), TagError> {
    if len > available || len > MAX_TAG_LEN {
        return Err(TagError::Oversized {
            announced: len,
            available,
        });
    }
    Ok(())
}

fn syncsafe(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0, |acc, b| (acc << 7) | (b & 0x7f) as u32)
}

fn be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | *b as u32)
}

fn parse_marker(bytes: &[u8], magic: &[u8; 3]) -> Option<TagHeader> {
    if bytes.len() < HEADER_LEN as usize || &bytes[..3] != magic {
        return None;
    }
    let (major, minor, flags) = (bytes[3], bytes[4], bytes[5]);
    if major == 0xff || minor == 0xff || bytes[6..10].iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    Some(TagHeader {
        major,
        flags,
        size: syncsafe(&bytes[6..10]),
    })
}

/// `ID3` header at the start of `bytes`
pub fn parse_header(bytes: &[u8]) -> Option<TagHeader> {
    parse_marker(bytes, b"ID3")
}

/// `3DI` footer at the start of `bytes`
pub fn parse_footer(bytes: &[u8]) -> Option<TagHeader> {
    parse_marker(bytes, b"3DI")
}

/// Undo unsynchronisation: every `FF 00` becomes `FF`
fn resync(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut prev = 0u8;
    for &b in data {
        if !(prev == 0xff && b == 0x00) {
            out.push(b);
        }
        prev = b;
    }
    out
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf16(bytes: &[u8], big_endian: bool) -> String {
    let units = bytes.chunks_exact(2).map(|pair| {
        if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Decode a text frame payload; the first byte selects the encoding
fn decode_text(data: &[u8]) -> Option<String> {
    let (&encoding, text) = data.split_first()?;
    let decoded = match encoding {
        0 => latin1(text),
        1 => match text {
            [0xfe, 0xff, rest @ ..] => utf16(rest, true),
            [0xff, 0xfe, rest @ ..] => utf16(rest, false),
            _ => utf16(text, false),
        },
        2 => utf16(text, true),
        3 => String::from_utf8_lossy(text).into_owned(),
        _ => return None,
    };
    // v2.4 separates multiple values with NUL; keep the first
    clean(decoded.split('\0').next().unwrap_or_default())
}

fn clean(text: &str) -> Option<String> {
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!text.is_empty()).then(|| text.to_string())
}

fn store(tags: &mut AudioTags, id: &[u8], value: String) {
    let slot = match id {
        b"TALB" | b"TAL" => &mut tags.album,
        b"TPE1" | b"TP1" => &mut tags.artist,
        b"TIT2" | b"TT2" => &mut tags.title,
        b"TYER" | b"TYE" => &mut tags.year,
        b"TRCK" | b"TRK" => &mut tags.track,
        b"TDRC" => {
            let year: String = value.chars().take(4).collect();
            if year.len() == 4 && tags.year.is_none() {
                tags.year = Some(year);
            }
            return;
        }
        _ => return,
    };
    if slot.is_none() {
        *slot = Some(value);
    }
}

/// Decode a complete ID3v2 tag, header first
pub fn parse_v2(tag: &[u8]) -> Result<AudioTags, TagError> {
    let header = parse_header(tag).ok_or(TagError::NotATag)?;
    if !(2..=4).contains(&header.major) {
        return Err(TagError::Version(header.major));
    }

    let start = HEADER_LEN as usize;
    let end = start + header.size as usize;
    if tag.len() < end {
        return Err(TagError::Truncated {
            announced: end,
            available: tag.len(),
        });
    }

    let mut body = if header.major < 4 && header.flags & 0x80 != 0 {
        resync(&tag[start..end])
    } else {
        tag[start..end].to_vec()
    };

    if header.flags & 0x40 != 0 {
        let skip = match header.major {
            // v2.2 used this bit for compression, which nobody implemented
            2 => return Ok(AudioTags::default()),
            3 => body.get(..4).map(|b| be(b) as usize + 4),
            _ => body.get(..4).map(|b| syncsafe(b) as usize),
        };
        let skip = skip.unwrap_or(body.len()).min(body.len());
        body.drain(..skip);
    }

    let (id_len, frame_header_len) = if header.major == 2 { (3, 6) } else { (4, 10) };
    let mut tags = AudioTags::default();
    let mut pos = 0;

    while pos + frame_header_len <= body.len() {
        let frame = &body[pos..pos + frame_header_len];
        let id = &frame[..id_len];
        if id[0] == 0 {
            break; // padding
        }

        let (size, status_flags) = match header.major {
            2 => (be(&frame[3..6]), 0u8),
            3 => (be(&frame[4..8]), frame[9]),
            _ => (syncsafe(&frame[4..8]), frame[9]),
        };
        pos += frame_header_len;
        let size = size as usize;
        if pos + size > body.len() {
            break;
        }
        let mut data = &body[pos..pos + size];
        pos += size;

        let unreadable = match header.major {
            3 => status_flags & 0xc0 != 0,
            4 => status_flags & 0x0c != 0,
            _ => false,
        };
        if unreadable || !id.starts_with(b"T") {
            continue;
        }

        let resynced;
        if header.major == 4 {
            if status_flags & 0x01 != 0 {
                data = data.get(4..).unwrap_or_default();
            }
            if status_flags & 0x02 != 0 {
                resynced = resync(data);
                data = &resynced;
            }
        }

        if let Some(text) = decode_text(data) {
            store(&mut tags, id, text);
        }
    }

    Ok(tags)
}

/// Decode an ID3v1 trailer from the last 128 bytes of `bytes`
pub fn parse_v1(bytes: &[u8]) -> Option<AudioTags> {
    let start = bytes.len().checked_sub(V1_LEN as usize)?;
    let tag = &bytes[start..];
    if &tag[..3] != b"TAG" {
        return None;
    }

    let text = |range: std::ops::Range<usize>| clean(&latin1(&tag[range]));
    let comment = &tag[97..127];
    let track = (comment[28] == 0 && comment[29] != 0).then(|| comment[29].to_string());

    Some(AudioTags {
        title: text(3..33),
        artist: text(33..63),
        album: text(63..93),
        year: text(93..97),
        track,
    })
}
