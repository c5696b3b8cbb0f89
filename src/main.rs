//! ftpscout - LAN FTP discovery and file search
//!
//! Finds anonymous FTP servers on the local network, crawls them and keeps an
//! incrementally updated full-text index of their files.

mod config;
mod coordinator;
mod crawler;
mod dedup;
mod discovery;
mod ftp;
mod index;
mod metadata;
mod registry;
mod signals;
#[cfg(test)]
mod testing;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::coordinator::{Coordinator, UpdateOutcome, UpdatePolicy};
use crate::discovery::{
    Blacklist, DedupFilter, Discovery, FilterPipeline, LivenessFilter, NmapScanner, PatternFilter,
};
use crate::ftp::FtpConnector;
use crate::index::SearchIndex;
use crate::registry::{ServerRegistry, SqliteRegistry};

/// ftpscout - LAN FTP discovery and file search
#[derive(Parser)]
#[command(name = "ftpscout")]
#[command(author = "Misha")]
#[command(version)]
#[command(about = "Discovers anonymous FTP servers on the LAN and indexes their files", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery and indexing until interrupted
    Daemon,

    /// Update one server now
    Scan {
        address: Ipv4Addr,

        /// Ignore the minimum update interval
        #[arg(short, long)]
        force: bool,
    },

    /// Search indexed files
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        max_results: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List known servers
    Servers,

    /// Forget a server and its indexed files
    Remove { address: Ipv4Addr },

    /// Show current configuration
    Config,
}

/// Open storage handles shared by every command
struct Engine {
    registry: Arc<SqliteRegistry>,
    index: Arc<SearchIndex>,
    coordinator: Arc<Coordinator>,
}

impl Engine {
    fn open(config: &Config, policy: UpdatePolicy, cancel: CancellationToken) -> Result<Self> {
        let registry = Arc::new(SqliteRegistry::open(&config.registry_path())?);
        let index = Arc::new(
            SearchIndex::open(&config.index_path())
                .with_context(|| format!("Failed to open index: {:?}", config.index_path()))?,
        );
        let connector = Arc::new(FtpConnector::new(
            config.ftp.port,
            config.ftp.connect_timeout(),
            config.ftp.io_timeout(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            index.clone(),
            connector,
            policy,
            cancel,
        ));

        Ok(Self {
            registry,
            index,
            coordinator,
        })
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.service.log_level);

    match cli.command {
        Commands::Daemon => {
            info!("Starting ftpscout daemon...");
            run_daemon(config).await?;
        }

        Commands::Scan { address, force } => {
            scan_server(&config, address, force).await?;
        }

        Commands::Search {
            query,
            max_results,
            json,
        } => {
            search_files(&config, &query, max_results, json)?;
        }

        Commands::Servers => {
            list_servers(&config)?;
        }

        Commands::Remove { address } => {
            remove_server(&config, address)?;
        }

        Commands::Config => {
            show_config(&config)?;
        }
    }

    Ok(())
}

fn build_pipeline(config: &Config, registry: Arc<dyn ServerRegistry>) -> Result<FilterPipeline> {
    let discovery = &config.discovery;
    let mut pipeline = FilterPipeline::new().with(Blacklist::new(discovery.blacklist.iter().copied()));
    if let Some(pattern) = discovery.address_pattern()? {
        pipeline = pipeline.with(PatternFilter::new(pattern));
    }
    Ok(pipeline
        .with(DedupFilter::new(Duration::from_secs(discovery.drop_duplicate_timeout_secs)))
        .with(LivenessFilter::new(
            registry,
            config.ftp.port,
            Duration::from_millis(discovery.probe_timeout_ms),
        )))
}

/// Run discovery and the update loop until SIGINT/SIGTERM
async fn run_daemon(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    signals::cancel_on_shutdown(cancel.clone())?;

    let engine = Engine::open(&config, UpdatePolicy::from(&config.indexer), cancel.clone())?;
    let stats = engine.index.stats()?;
    info!(
        "Index loaded: {} documents from {} servers",
        stats.documents, stats.servers
    );

    let scan_interval = Duration::from_secs(config.discovery.scan_interval_secs.max(1));
    let subnet = config.discovery.subnet()?;
    let scanner = NmapScanner::new(
        &config.discovery.nmap_binary,
        &subnet.to_string(),
        config.ftp.port,
        config.discovery.use_sudo,
        Duration::from_secs(config.discovery.scan_timeout_secs),
    );
    let pipeline = build_pipeline(&config, engine.registry.clone())?;
    let discovery = Discovery::new(Box::new(scanner), pipeline, scan_interval);

    let (tx, rx) = mpsc::channel(config.discovery.queue_capacity.max(1));
    let discovery_task = tokio::spawn(discovery.run(tx, cancel.clone()));
    let coordinator_task = tokio::spawn(engine.coordinator.clone().run(rx, cancel.clone(), scan_interval));

    let (discovery_result, coordinator_result) = tokio::join!(discovery_task, coordinator_task);
    discovery_result.context("Discovery task panicked")?;
    coordinator_result.context("Coordinator task panicked")?;

    info!("ftpscout stopped");
    Ok(())
}

/// Run one update cycle for a single server
async fn scan_server(config: &Config, address: Ipv4Addr, force: bool) -> Result<()> {
    let mut policy = UpdatePolicy::from(&config.indexer);
    if force {
        policy.min_interval = TimeDelta::zero();
    }

    let cancel = CancellationToken::new();
    signals::cancel_on_shutdown(cancel.clone())?;
    let engine = Engine::open(config, policy, cancel)?;

    match engine.coordinator.update_server(address).await? {
        UpdateOutcome::Updated {
            files,
            bytes,
            added,
            removed,
        } => {
            println!("{}: {} files, {} bytes ({} added, {} removed)", address, files, bytes, added, removed);
        }
        UpdateOutcome::NotDue => println!("{}: scanned recently, use --force to rescan", address),
        UpdateOutcome::Unreachable => println!("{}: unreachable", address),
        UpdateOutcome::TooDeep => println!("{}: directory tree too deep, nothing indexed", address),
        UpdateOutcome::Cancelled => println!("{}: cancelled", address),
        UpdateOutcome::Empty => println!("{}: no files found, index left unchanged", address),
    }

    Ok(())
}

/// Search the local index
fn search_files(config: &Config, query: &str, max_results: usize, json: bool) -> Result<()> {
    let index = SearchIndex::open(&config.index_path())?;
    let results = index.search(query, max_results)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let registry = SqliteRegistry::open(&config.registry_path())?;
    let servers = registry.list()?;

    println!("Found {} files (showing up to {}):", results.total_found, max_results);
    println!();

    for file in &results.files {
        let host = servers
            .iter()
            .find(|s| s.id == file.server_id)
            .map(|s| s.address.to_string())
            .unwrap_or_else(|| format!("server#{}", file.server_id));
        println!("  ftp://{}{} ({} bytes)", host, file.path, file.size);

        let tags = &file.tags;
        if !tags.is_empty() {
            let parts: Vec<&str> = [&tags.artist, &tags.album, &tags.title, &tags.year]
                .into_iter()
                .filter_map(|t| t.as_deref())
                .collect();
            println!("      {}", parts.join(" / "));
        }
    }

    println!();
    println!("Query time: {}ms", results.query_time_ms);

    Ok(())
}

/// Print the server registry
fn list_servers(config: &Config) -> Result<()> {
    let registry = SqliteRegistry::open(&config.registry_path())?;
    let servers = registry.list()?;

    println!("{:<16} {:>10} {:>16}  {:<20} {:<20}", "ADDRESS", "FILES", "BYTES", "LAST SEEN", "LAST SCANNED");
    for server in &servers {
        let scanned = if server.last_scanned == ftpscout_core::ServerRecord::never() {
            "never".to_string()
        } else {
            server.last_scanned.format("%Y-%m-%d %H:%M").to_string()
        };
        println!(
            "{:<16} {:>10} {:>16}  {:<20} {:<20}",
            server.address.to_string(),
            server.file_count,
            server.total_size,
            server.last_seen.format("%Y-%m-%d %H:%M").to_string(),
            scanned
        );
    }
    println!();
    println!("{} servers", servers.len());

    Ok(())
}

/// Delete a server from the registry and its documents from the index
fn remove_server(config: &Config, address: Ipv4Addr) -> Result<()> {
    let engine = Engine::open(config, UpdatePolicy::from(&config.indexer), CancellationToken::new())?;
    if engine.coordinator.remove_server(address)? {
        println!("Removed {}", address);
    } else {
        println!("Unknown server: {}", address);
    }
    Ok(())
}

/// Show the effective configuration
fn show_config(config: &Config) -> Result<()> {
    println!("# {}", config.config_path.display());
    println!("# index:    {}", config.index_path().display());
    println!("# registry: {}", config.registry_path().display());
    println!();
    print!("{}", toml::to_string_pretty(config).context("Failed to serialize config")?);
    Ok(())
}
