//! Subnet scanning through nmap

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Source of candidate addresses for one discovery round
#[async_trait]
pub trait HostScanner: Send + Sync {
    async fn scan(&self) -> Result<Vec<Ipv4Addr>>;
}

/// Runs `nmap` in grepable-output mode and collects hosts with the port open
#[derive(Debug, Clone)]
pub struct NmapScanner {
    binary: String,
    subnet: String,
    port: u16,
    use_sudo: bool,
    timeout: Duration,
}

impl NmapScanner {
    pub fn new(binary: &str, subnet: &str, port: u16, use_sudo: bool, timeout: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            subnet: subnet.to_string(),
            port,
            use_sudo,
            timeout,
        }
    }

    /// A privileged SYN scan is faster and quieter; without root nmap can
    /// only do full connect scans.
    fn args(&self) -> Vec<String> {
        let scan_type = if self.use_sudo { "-sS" } else { "-sT" };
        vec![
            "-n".to_string(),
            scan_type.to_string(),
            format!("-p{}", self.port),
            "-T4".to_string(),
            "-oG".to_string(),
            "-".to_string(),
            self.subnet.clone(),
        ]
    }

    fn command(&self) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(&self.binary);
            cmd
        } else {
            Command::new(&self.binary)
        };
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl HostScanner for NmapScanner {
    async fn scan(&self) -> Result<Vec<Ipv4Addr>> {
        debug!(subnet = %self.subnet, "Running nmap");
        let output = tokio::time::timeout(self.timeout, self.command().output())
            .await
            .map_err(|_| anyhow!("nmap did not finish within {:?}", self.timeout))?
            .with_context(|| format!("Failed to run {}", self.binary))?;

        if !output.status.success() {
            bail!(
                "nmap exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_grepable(&String::from_utf8_lossy(&output.stdout), self.port))
    }
}

/// Hosts from `nmap -oG` output that report `port` open, e.g.
/// `Host: 192.168.1.5 ()	Ports: 21/open/tcp//ftp///`
pub fn parse_grepable(output: &str, port: u16) -> Vec<Ipv4Addr> {
    let open = format!("{}/open/", port);
    let mut hosts = Vec::new();

    for line in output.lines() {
        let Some(rest) = line.strip_prefix("Host:") else {
            continue;
        };
        let Some((_, ports)) = rest.split_once("Ports:") else {
            continue;
        };
        if !ports.split(',').any(|p| p.trim().starts_with(&open)) {
            continue;
        }
        if let Some(Ok(address)) = rest.split_whitespace().next().map(str::parse::<Ipv4Addr>) {
            if !hosts.contains(&address) {
                hosts.push(address);
            }
        }
    }

    hosts
}
