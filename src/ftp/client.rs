//! Minimal anonymous FTP client
//!
//! Just enough of RFC 959/3659 to walk directory trees and read byte ranges:
//! login, capability probe, passive data connections, `CWD`, `MLSD`/`LIST`,
//! `REST` + `RETR`. Every network wait is bounded by a timeout.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::FtpError;
use super::listing::{ListEntry, ListingFormat};

/// Run an I/O future under a deadline
async fn with_timeout<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, FtpError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(FtpError::Timeout(what)),
    }
}

/// A complete (possibly multi-line) server reply
#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// 1xx: more replies follow once the transfer is over
    fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    fn into_error(self, command: &str) -> FtpError {
        // keep only the verb; arguments can be long paths
        let verb = command.split(' ').next().unwrap_or(command);
        FtpError::Reply {
            command: verb.to_string(),
            code: self.code,
            message: self.text(),
        }
    }
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if digits.bytes().all(|b| b.is_ascii_digit()) {
        digits.parse().ok()
    } else {
        None
    }
}

/// Port announced in a 227 reply: `Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
fn parse_pasv_port(text: &str) -> Option<u16> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let numbers: Vec<u16> = text[start..]
        .split(|c: char| !(c.is_ascii_digit() || c == ','))
        .next()?
        .split(',')
        .map(|n| n.parse().ok())
        .collect::<Option<Vec<u16>>>()?;
    if numbers.len() != 6 || numbers[4] > 255 || numbers[5] > 255 {
        return None;
    }
    Some(numbers[4] * 256 + numbers[5])
}

#[derive(Debug, Default)]
struct Features {
    mlsd: bool,
    utf8: bool,
}

/// One logged-in control connection
pub struct FtpClient {
    control: BufReader<TcpStream>,
    peer: IpAddr,
    io_timeout: Duration,
    format: ListingFormat,
    cwd: Option<String>,
}

impl FtpClient {
    /// Connect, log in anonymously and probe the server's capabilities
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self, FtpError> {
        let stream = with_timeout(connect_timeout, "connect", TcpStream::connect(addr)).await?;
        let peer = stream.peer_addr()?.ip();

        let mut client = Self {
            control: BufReader::new(stream),
            peer,
            io_timeout,
            format: ListingFormat::Legacy,
            cwd: None,
        };

        let greeting = client.read_reply().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error("connect"));
        }

        client.login().await?;

        let features = client.features().await?;
        if features.utf8 {
            client.command("OPTS UTF8 ON").await?;
        }
        client.expect("TYPE I", &[200]).await?;
        if features.mlsd {
            client.format = ListingFormat::Mlsd;
        }

        debug!(%addr, format = ?client.format, "FTP session ready");
        Ok(client)
    }

    async fn login(&mut self) -> Result<(), FtpError> {
        let reply = self.expect("USER anonymous", &[230, 331]).await?;
        if reply.code == 331 {
            self.expect("PASS anonymous@", &[230, 202]).await?;
        }
        Ok(())
    }

    async fn features(&mut self) -> Result<Features, FtpError> {
        let reply = self.command("FEAT").await?;
        let mut features = Features::default();
        if reply.code != 211 {
            return Ok(features);
        }

        for line in &reply.lines {
            let line = line.trim().to_ascii_uppercase();
            if line.starts_with("MLST") || line.starts_with("MLSD") {
                features.mlsd = true;
            } else if line.starts_with("UTF8") {
                features.utf8 = true;
            }
        }
        Ok(features)
    }

    async fn read_line(&mut self) -> Result<String, FtpError> {
        let mut raw = Vec::new();
        let n = with_timeout(self.io_timeout, "reply", self.control.read_until(b'\n', &mut raw)).await?;
        if n == 0 {
            return Err(FtpError::Closed);
        }
        let line = String::from_utf8_lossy(&raw);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply, FtpError> {
        let first = self.read_line().await?;
        let code = reply_code(&first).ok_or_else(|| FtpError::Malformed(first.clone()))?;
        let mut lines = vec![first[3..].trim_start_matches(['-', ' ']).to_string()];

        if first.as_bytes().get(3) == Some(&b'-') {
            let last = format!("{} ", code);
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&last) || line == code.to_string() {
                    lines.push(line[3..].trim_start().to_string());
                    break;
                }
                lines.push(line);
            }
        }

        trace!(code, "reply");
        Ok(Reply { code, lines })
    }

    async fn send(&mut self, command: &str) -> Result<(), FtpError> {
        if command.contains(['\r', '\n']) {
            return Err(FtpError::Malformed(format!("refusing to send {:?}", command)));
        }
        let line = format!("{}\r\n", command);
        with_timeout(self.io_timeout, "command", self.control.get_mut().write_all(line.as_bytes())).await
    }

    async fn command(&mut self, command: &str) -> Result<Reply, FtpError> {
        self.send(command).await?;
        self.read_reply().await
    }

    async fn expect(&mut self, command: &str, accept: &[u16]) -> Result<Reply, FtpError> {
        let reply = self.command(command).await?;
        if accept.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply.into_error(command))
        }
    }

    async fn open_passive(&mut self) -> Result<TcpStream, FtpError> {
        let reply = self.expect("PASV", &[227]).await?;
        let port = parse_pasv_port(&reply.text()).ok_or_else(|| FtpError::Malformed(reply.text()))?;
        // the announced host is often a private address behind NAT, the
        // control peer is what we can actually reach
        with_timeout(self.io_timeout, "data connect", TcpStream::connect((self.peer, port))).await
    }

    async fn change_dir(&mut self, path: &str) -> Result<(), FtpError> {
        if self.cwd.as_deref() == Some(path) {
            return Ok(());
        }
        self.cwd = None;
        self.expect(&format!("CWD {}", path), &[200, 250]).await?;
        self.cwd = Some(path.to_string());
        Ok(())
    }

    /// List the entries of a directory.
    ///
    /// Uses `MLSD` when the server advertised it; a server that advertises
    /// but then refuses it is switched to `LIST` for the rest of the session.
    pub async fn list(&mut self, path: &str) -> Result<Vec<ListEntry>, FtpError> {
        self.change_dir(path).await?;

        let lines = match self.read_listing(self.format).await {
            Err(e)
                if self.format == ListingFormat::Mlsd
                    && matches!(e.code(), Some(500 | 501 | 502 | 504)) =>
            {
                warn!(error = %e, "MLSD refused, falling back to LIST");
                self.format = ListingFormat::Legacy;
                self.read_listing(ListingFormat::Legacy).await?
            }
            other => other?,
        };

        let now = Utc::now().naive_utc();
        let parser = self.format.parser();
        Ok(lines
            .iter()
            .filter_map(|line| parser.parse_line(line, now))
            .collect())
    }

    async fn read_listing(&mut self, format: ListingFormat) -> Result<Vec<String>, FtpError> {
        let mut data = self.open_passive().await?;
        let command = format.command();
        let reply = self.expect(command, &[125, 150, 226, 250]).await?;

        let mut raw = Vec::new();
        with_timeout(self.io_timeout, "listing", data.read_to_end(&mut raw)).await?;
        drop(data);

        if reply.is_preliminary() {
            self.expect_final(command, &[226, 250]).await?;
        }

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn expect_final(&mut self, command: &str, accept: &[u16]) -> Result<Reply, FtpError> {
        let reply = self.read_reply().await?;
        if accept.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply.into_error(command))
        }
    }

    /// Read at most `len` bytes of `path` starting at `offset`, then hang up
    /// the data connection.
    pub async fn retrieve_range(&mut self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, FtpError> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let data = self.open_passive().await?;
        if offset > 0 {
            self.expect(&format!("REST {}", offset), &[350]).await?;
        }
        let reply = self.expect(&format!("RETR {}", path), &[125, 150, 226, 250]).await?;

        let mut buf = Vec::new();
        let mut limited = data.take(len);
        with_timeout(self.io_timeout, "transfer", limited.read_to_end(&mut buf)).await?;
        drop(limited);

        if reply.is_preliminary() {
            // closing early usually earns a 426 instead of a 226, both are fine
            let done = self.read_reply().await?;
            trace!(code = done.code, path, "transfer closed");
        }

        Ok(buf)
    }

    pub async fn quit(&mut self) {
        if let Err(e) = self.command("QUIT").await {
            trace!(error = %e, "QUIT failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::EntryKind;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    struct FakeServer {
        advertise_mlsd: bool,
        mlsd_works: bool,
        /// directory -> (MLSD lines, LIST lines)
        dirs: HashMap<&'static str, (Vec<&'static str>, Vec<&'static str>)>,
        files: HashMap<&'static str, Vec<u8>>,
    }

    impl FakeServer {
        fn new(advertise_mlsd: bool, mlsd_works: bool) -> Self {
            let mut dirs = HashMap::new();
            dirs.insert(
                "/",
                (
                    vec![
                        "type=cdir;perm=el; .",
                        "type=dir;perm=el;modify=20200101000000; music",
                        "type=file;size=10;perm=r;modify=20200102030405; readme.txt",
                    ],
                    vec![
                        "drwxr-xr-x   2 ftp      ftp          4096 Jan  1  2020 music",
                        "-rw-r--r--   1 ftp      ftp            10 Jan  2  2020 readme.txt",
                    ],
                ),
            );
            dirs.insert("/music", (Vec::new(), Vec::new()));

            let mut files = HashMap::new();
            files.insert("/music/song.mp3", b"0123456789".to_vec());

            Self {
                advertise_mlsd,
                mlsd_works,
                dirs,
                files,
            }
        }
    }

    async fn serve(listener: TcpListener, server: Arc<FakeServer>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"220-Welcome to the test server\r\n220 Ready\r\n")
            .await
            .unwrap();

        let mut passive: Option<TcpListener> = None;
        let mut rest = 0usize;
        let mut cwd = "/".to_string();

        while let Ok(Some(line)) = lines.next_line().await {
            let (verb, arg) = match line.split_once(' ') {
                Some((v, a)) => (v.to_string(), a.to_string()),
                None => (line.clone(), String::new()),
            };

            let reply: String = match verb.as_str() {
                "USER" => "331 Send password\r\n".into(),
                "PASS" => "230 Logged in\r\n".into(),
                "FEAT" if server.advertise_mlsd => {
                    "211-Features:\r\n MLST type*;size*;modify*;perm*;\r\n UTF8\r\n211 End\r\n".into()
                }
                "FEAT" => "211-Features:\r\n UTF8\r\n211 End\r\n".into(),
                "OPTS" | "TYPE" => "200 OK\r\n".into(),
                "CWD" if server.dirs.contains_key(arg.as_str()) => {
                    cwd = arg.clone();
                    "250 OK\r\n".into()
                }
                "CWD" => "550 No such directory\r\n".into(),
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    passive = Some(listener);
                    format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                        port / 256,
                        port % 256
                    )
                }
                "REST" => {
                    rest = arg.parse().unwrap();
                    "350 Restarting\r\n".into()
                }
                "MLSD" if !server.mlsd_works => "500 Unknown command\r\n".into(),
                "MLSD" | "LIST" => {
                    write.write_all(b"150 Here comes the listing\r\n").await.unwrap();
                    let (mut data, _) = passive.take().unwrap().accept().await.unwrap();
                    let (mlsd, list) = &server.dirs[cwd.as_str()];
                    let body = if verb == "MLSD" { mlsd } else { list };
                    for entry in body {
                        data.write_all(format!("{}\r\n", entry).as_bytes()).await.unwrap();
                    }
                    drop(data);
                    "226 Done\r\n".into()
                }
                "RETR" => match server.files.get(arg.as_str()) {
                    Some(content) => {
                        write.write_all(b"150 Opening data connection\r\n").await.unwrap();
                        let (mut data, _) = passive.take().unwrap().accept().await.unwrap();
                        let _ = data.write_all(&content[rest..]).await;
                        drop(data);
                        rest = 0;
                        "226 Transfer complete\r\n".into()
                    }
                    None => "550 No such file\r\n".into(),
                },
                "QUIT" => {
                    let _ = write.write_all(b"221 Bye\r\n").await;
                    break;
                }
                _ => "502 Not implemented\r\n".into(),
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    async fn spawn(server: FakeServer) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(server)));
        addr
    }

    async fn connect(addr: SocketAddr) -> FtpClient {
        FtpClient::connect(addr, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[test]
    fn test_parse_pasv_port() {
        assert_eq!(parse_pasv_port("Entering Passive Mode (10,0,0,1,195,80)."), Some(50000));
        assert_eq!(parse_pasv_port("=127,0,0,1,0,21"), Some(21));
        assert_eq!(parse_pasv_port("Entering Passive Mode"), None);
        assert_eq!(parse_pasv_port("(1,2,3,4,5)"), None);
    }

    #[tokio::test]
    async fn test_mlsd_listing() {
        let addr = spawn(FakeServer::new(true, true)).await;
        let mut client = connect(addr).await;
        assert_eq!(client.format, ListingFormat::Mlsd);

        let entries = client.list("/").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::CurrentDir);
        assert_eq!(entries[1].name, "music");
        assert!(entries[1].interesting);
        assert_eq!(entries[2].size, Some(10));

        client.quit().await;
    }

    #[tokio::test]
    async fn test_falls_back_to_list_when_mlsd_refused() {
        let addr = spawn(FakeServer::new(true, false)).await;
        let mut client = connect(addr).await;

        let entries = client.list("/").await.unwrap();
        assert_eq!(client.format, ListingFormat::Legacy);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["music", "readme.txt"]);

        client.quit().await;
    }

    #[tokio::test]
    async fn test_legacy_server_uses_list() {
        let addr = spawn(FakeServer::new(false, false)).await;
        let mut client = connect(addr).await;
        assert_eq!(client.format, ListingFormat::Legacy);
        assert_eq!(client.list("/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_is_permanent() {
        let addr = spawn(FakeServer::new(true, true)).await;
        let mut client = connect(addr).await;

        let err = client.list("/nope").await.unwrap_err();
        assert_eq!(err.code(), Some(550));
        assert!(err.is_permanent());

        // the session is still usable
        assert!(client.list("/music").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_range() {
        let addr = spawn(FakeServer::new(true, true)).await;
        let mut client = connect(addr).await;

        let middle = client.retrieve_range("/music/song.mp3", 2, 4).await.unwrap();
        assert_eq!(middle, b"2345");

        let head = client.retrieve_range("/music/song.mp3", 0, 3).await.unwrap();
        assert_eq!(head, b"012");

        // asking for more than there is returns what exists
        let tail = client.retrieve_range("/music/song.mp3", 8, 10).await.unwrap();
        assert_eq!(tail, b"89");
    }
}
