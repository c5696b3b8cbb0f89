//! Directory listing parsers
//!
//! Two interchangeable line parsers: machine-readable MLSD facts, and the
//! free-text `LIST` output of older servers (Unix `ls -l` or MS-DOS style).

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};

/// What a listed name refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// "." or `type=cdir`
    CurrentDir,
    /// ".." or `type=pdir`
    ParentDir,
    /// Symlinks, devices and anything else we do not follow
    Other,
}

/// One parsed listing line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub modified: Option<NaiveDateTime>,
    /// Enterable and listable for directories, readable for files
    pub interesting: bool,
}

impl ListEntry {
    fn new(
        name: &str,
        kind: EntryKind,
        size: Option<u64>,
        modified: Option<NaiveDateTime>,
        perm: Option<&str>,
    ) -> Self {
        let kind = match name {
            "." => EntryKind::CurrentDir,
            ".." => EntryKind::ParentDir,
            _ => kind,
        };
        Self {
            name: name.to_string(),
            kind,
            size,
            modified,
            interesting: is_interesting(kind, perm),
        }
    }
}

/// Decide whether an entry is worth following, from MLSD-style permission
/// letters. Servers that do not report permissions get the benefit of the
/// doubt.
fn is_interesting(kind: EntryKind, perm: Option<&str>) -> bool {
    let has = |letters: &[char]| {
        perm.map_or(true, |p| {
            let p = p.to_ascii_lowercase();
            letters.iter().all(|l| p.contains(*l))
        })
    };

    match kind {
        EntryKind::Dir => has(&['e', 'l']),
        EntryKind::File => has(&['r']),
        EntryKind::CurrentDir | EntryKind::ParentDir | EntryKind::Other => false,
    }
}

/// Turns one line of listing output into an entry
pub trait ListingParser: Send + Sync {
    /// `now` supplies the year for listings that omit it
    fn parse_line(&self, line: &str, now: NaiveDateTime) -> Option<ListEntry>;
}

/// Which listing command a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    Mlsd,
    Legacy,
}

impl ListingFormat {
    pub fn command(&self) -> &'static str {
        match self {
            ListingFormat::Mlsd => "MLSD",
            ListingFormat::Legacy => "LIST",
        }
    }

    pub fn parser(&self) -> &'static dyn ListingParser {
        match self {
            ListingFormat::Mlsd => &MlsdParser,
            ListingFormat::Legacy => &LegacyParser,
        }
    }
}

/// Parser for RFC 3659 `MLSD` lines: `type=file;size=77;modify=20150920172522;perm=r; name`
pub struct MlsdParser;

impl ListingParser for MlsdParser {
    fn parse_line(&self, line: &str, _now: NaiveDateTime) -> Option<ListEntry> {
        let (facts, name) = line.split_once(' ')?;
        if name.is_empty() {
            return None;
        }

        let mut kind = EntryKind::Other;
        let mut size = None;
        let mut modified = None;
        let mut perm = None;

        for fact in facts.split(';').filter(|f| !f.is_empty()) {
            let Some((key, value)) = fact.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "type" => {
                    kind = match value.to_ascii_lowercase().as_str() {
                        "file" => EntryKind::File,
                        "dir" => EntryKind::Dir,
                        "cdir" => EntryKind::CurrentDir,
                        "pdir" => EntryKind::ParentDir,
                        _ => EntryKind::Other,
                    }
                }
                "size" => size = value.parse().ok(),
                "modify" => modified = parse_mlsd_time(value),
                "perm" => perm = Some(value),
                _ => {}
            }
        }

        Some(ListEntry::new(name, kind, size, modified, perm))
    }
}

/// `YYYYMMDDHHMMSS[.sss]`
fn parse_mlsd_time(value: &str) -> Option<NaiveDateTime> {
    let whole = value.split('.').next()?;
    NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()
}

/// Parser for free-text `LIST` output
pub struct LegacyParser;

impl ListingParser for LegacyParser {
    fn parse_line(&self, line: &str, now: NaiveDateTime) -> Option<ListEntry> {
        let line = line.trim_end_matches(['\r', '\n']);
        parse_unix_line(line, now).or_else(|| parse_dos_line(line))
    }
}

/// Split a line into whitespace-separated tokens with their byte ranges
fn tokens(line: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = None;
    for (idx, ch) in line.char_indices() {
        match (ch.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, idx));
                start = None;
            }
            (false, None) => start = Some(idx),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, line.len()));
    }
    out
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = token.to_ascii_lowercase();
    MONTHS.iter().position(|m| *m == lower).map(|i| i as u32 + 1)
}

/// `drwxr-xr-x   8 ftp      ftp          4096 Mar  5 01:07 divers`
///
/// The group column is optional, so the date columns are located by their
/// shape rather than by position.
fn parse_unix_line(line: &str, now: NaiveDateTime) -> Option<ListEntry> {
    let toks = tokens(line);
    if toks.len() < 5 {
        return None;
    }
    let text = |i: usize| &line[toks[i].0..toks[i].1];

    let mode = text(0);
    if mode.len() < 10 {
        return None;
    }
    let kind = match mode.as_bytes()[0] {
        b'd' => EntryKind::Dir,
        b'-' => EntryKind::File,
        _ => EntryKind::Other,
    };

    // month, day, time-or-year, then the name
    let month_idx = (2..toks.len() - 3).find(|&i| {
        let stamp = text(i + 2);
        month_number(text(i)).is_some()
            && text(i - 1).parse::<u64>().is_ok()
            && text(i + 1).parse::<u32>().is_ok_and(|d| (1..=31).contains(&d))
            && (stamp.contains(':') || (stamp.len() == 4 && stamp.parse::<i32>().is_ok()))
    })?;
    let size: u64 = text(month_idx - 1).parse().ok()?;
    let month = month_number(text(month_idx))?;
    let day: u32 = text(month_idx + 1).parse().ok()?;
    let modified = parse_unix_date(month, day, text(month_idx + 2), now);

    let mut name = line[toks[month_idx + 3].0..].trim_end();
    if kind == EntryKind::Other && mode.starts_with('l') {
        // "link -> target"
        if let Some((link, _)) = name.split_once(" -> ") {
            name = link;
        }
    }

    // world permission bits stand in for what an anonymous user may do
    let bits = mode.as_bytes();
    let mut perm = String::new();
    if bits[7] == b'r' {
        perm.push_str(if kind == EntryKind::Dir { "l" } else { "r" });
    }
    if bits[9] == b'x' || bits[9] == b't' {
        perm.push('e');
    }

    Some(ListEntry::new(name, kind, Some(size), modified, Some(&perm)))
}

/// `Mar  5 01:07` (current year implied) or `Jul 11  2006`
fn parse_unix_date(month: u32, day: u32, time_or_year: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let date = NaiveDate::from_ymd_opt(now.year(), month, day)?;
        let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
        Some(date.and_time(time))
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
    }
}

/// `03-07-21  03:28PM                 6386 testB.txt` or `... <DIR> divers`
fn parse_dos_line(line: &str) -> Option<ListEntry> {
    let toks = tokens(line);
    if toks.len() < 4 {
        return None;
    }
    let text = |i: usize| &line[toks[i].0..toks[i].1];

    let date = text(0);
    let date = if date.len() == 10 {
        NaiveDate::parse_from_str(date, "%m-%d-%Y").ok()?
    } else {
        NaiveDate::parse_from_str(date, "%m-%d-%y").ok()?
    };
    let time = NaiveTime::parse_from_str(&text(1).to_ascii_uppercase(), "%I:%M%p").ok()?;

    let (kind, size) = if text(2).eq_ignore_ascii_case("<DIR>") {
        (EntryKind::Dir, None)
    } else {
        (EntryKind::File, Some(text(2).parse().ok()?))
    };
    let name = line[toks[3].0..].trim_end();

    Some(ListEntry::new(name, kind, size, Some(date.and_time(time)), None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0)
    }

    #[test]
    fn test_mlsd_file() {
        let entry = MlsdParser
            .parse_line("type=file;size=77;modify=20150920172522.123;perm=adfr; notes 2015.txt", now())
            .unwrap();
        assert_eq!(entry.name, "notes 2015.txt");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.size, Some(77));
        assert_eq!(
            entry.modified,
            NaiveDate::from_ymd_opt(2015, 9, 20).unwrap().and_hms_opt(17, 25, 22)
        );
        assert!(entry.interesting);
    }

    #[test]
    fn test_mlsd_markers_and_permissions() {
        let cdir = MlsdParser.parse_line("type=cdir;perm=el; .", now()).unwrap();
        assert_eq!(cdir.kind, EntryKind::CurrentDir);
        assert!(!cdir.interesting);

        let pdir = MlsdParser.parse_line("Type=pdir;Perm=el; /pub", now()).unwrap();
        assert_eq!(pdir.kind, EntryKind::ParentDir);
        assert!(!pdir.interesting);

        let listable = MlsdParser.parse_line("type=dir;perm=el; music", now()).unwrap();
        assert!(listable.interesting);

        let locked = MlsdParser.parse_line("type=dir;perm=e; private", now()).unwrap();
        assert!(!locked.interesting);

        let unreadable = MlsdParser.parse_line("type=file;size=1;perm=w; upload.bin", now()).unwrap();
        assert!(!unreadable.interesting);

        let link = MlsdParser.parse_line("type=OS.unix=slink:/etc;perm=r; etc", now()).unwrap();
        assert_eq!(link.kind, EntryKind::Other);
        assert!(!link.interesting);
    }

    #[test]
    fn test_unix_permissions() {
        let cases = [
            ("----------", false),
            ("-------r--", true),
            ("d---------", false),
            ("d------r--", false),
            ("d--------x", false),
            ("d------r-x", true),
            ("lrwxrwxrwx", false),
        ];
        for (mode, expected) in cases {
            let line = format!("{}   1 ftp      ftp          4096 Mar  7 15:28 name", mode);
            let entry = LegacyParser.parse_line(&line, now()).unwrap();
            assert_eq!(entry.interesting, expected, "mode {}", mode);
        }
    }

    #[test]
    fn test_unix_dates() {
        let recent = LegacyParser
            .parse_line("-rw-r--r--   1 ftp      ftp          6334 Mar  7 15:28 testC.txt", now())
            .unwrap();
        assert_eq!(recent.modified, at(2024, 3, 7, 15, 28));
        assert_eq!(recent.size, Some(6334));
        assert_eq!(recent.name, "testC.txt");

        let old = LegacyParser
            .parse_line("drwxr-xr-x   2 ftp      ftp          4096 Jul 11  2006 hdb", now())
            .unwrap();
        assert_eq!(old.modified, at(2006, 7, 11, 0, 0));
        assert_eq!(old.kind, EntryKind::Dir);
    }

    #[test]
    fn test_unix_without_group_and_spaces_in_name() {
        let entry = LegacyParser
            .parse_line("-rw-r--r--   1 ftp  512 Jan 10 19:50 my  song.mp3", now())
            .unwrap();
        assert_eq!(entry.name, "my  song.mp3");
        assert_eq!(entry.size, Some(512));
        assert_eq!(entry.modified, at(2024, 1, 10, 19, 50));
    }

    #[test]
    fn test_unix_symlink_and_junk() {
        let link = LegacyParser
            .parse_line("lrwxrwxrwx   1 ftp ftp 7 Jan 10 19:50 latest -> v1.2", now())
            .unwrap();
        assert_eq!(link.name, "latest");
        assert_eq!(link.kind, EntryKind::Other);

        assert!(LegacyParser.parse_line("total 12", now()).is_none());
        assert!(LegacyParser.parse_line("", now()).is_none());
    }

    #[test]
    fn test_dos_lines() {
        let dir = LegacyParser
            .parse_line("03-05-21  01:07PM       <DIR>          divers", now())
            .unwrap();
        assert_eq!(dir.kind, EntryKind::Dir);
        assert!(dir.interesting);
        assert_eq!(dir.modified, at(2021, 3, 5, 13, 7));

        let file = LegacyParser
            .parse_line("03-07-2021  03:28AM                 6386 test B.txt", now())
            .unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, Some(6386));
        assert_eq!(file.name, "test B.txt");
        assert_eq!(file.modified, at(2021, 3, 7, 3, 28));
    }
}
