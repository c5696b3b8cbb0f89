//! Remote file-transfer access
//!
//! The crawler and the metadata extractor only see the [`Connector`] and
//! [`RemoteSession`] traits; [`FtpConnector`] is the real implementation on
//! top of [`client::FtpClient`].

pub mod client;
pub mod listing;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use client::FtpClient;
pub use listing::{EntryKind, ListEntry};

/// Errors talking to a remote server
#[derive(Error, Debug)]
pub enum FtpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("unexpected reply to {command}: {code} {message}")]
    Reply {
        command: String,
        code: u16,
        message: String,
    },

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("connection closed by server")]
    Closed,
}

impl FtpError {
    /// Reply code, when the server answered at all
    pub fn code(&self) -> Option<u16> {
        match self {
            FtpError::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// 5xx replies: the request was refused, retrying it will not help
    pub fn is_permanent(&self) -> bool {
        self.code().is_some_and(|code| (500..600).contains(&code))
    }
}

/// An open, logged-in session with one server
#[async_trait]
pub trait RemoteSession: Send {
    /// List the entries of the directory at `path`
    async fn list_dir(&mut self, path: &str) -> Result<Vec<ListEntry>, FtpError>;

    /// Read at most `len` bytes of the file at `path`, starting at `offset`
    async fn fetch_range(&mut self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, FtpError>;

    /// Say goodbye; errors are irrelevant at this point
    async fn close(&mut self);
}

/// Opens sessions to servers
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: Ipv4Addr) -> Result<Box<dyn RemoteSession>, FtpError>;
}

/// Anonymous FTP sessions over TCP
#[derive(Debug, Clone)]
pub struct FtpConnector {
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl FtpConnector {
    pub fn new(port: u16, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl Connector for FtpConnector {
    async fn connect(&self, addr: Ipv4Addr) -> Result<Box<dyn RemoteSession>, FtpError> {
        let target = SocketAddr::from((addr, self.port));
        let client = FtpClient::connect(target, self.connect_timeout, self.io_timeout).await?;
        Ok(Box::new(client))
    }
}

#[async_trait]
impl RemoteSession for FtpClient {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<ListEntry>, FtpError> {
        self.list(path).await
    }

    async fn fetch_range(&mut self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>, FtpError> {
        self.retrieve_range(path, offset, len).await
    }

    async fn close(&mut self) {
        self.quit().await;
    }
}
