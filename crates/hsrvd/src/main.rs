//! hsrv Daemon (hsrvd)
//!
//! Loads a file of MD5 digests into memory and answers membership queries
//! over TCP.
//!
//! # Usage
//!
//! ```bash
//! # Serve the default hash set on port 9120
//! hsrvd
//!
//! # Alternate hash set and port
//! hsrvd -f /var/lib/hsrv/hashes.txt -p 7000
//!
//! # Check a hash file without serving it
//! hsrvd -f hashes.txt --dry-run
//!
//! # Turn a vendor listing into a loadable hash file
//! hsrvd --convert NSRLFile.txt > hashes.txt
//!
//! # With configuration file
//! hsrvd --config /etc/hsrv/hsrv.toml
//! ```

mod config;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use hsrv_core::{normalize_listing, Corpus};
use hsrv_transport::{Metrics, MetricsServer, TcpServer};

use crate::config::{FileConfig, Settings};

const BUG_REPORT_URL: &str = "https://github.com/hsrv/hsrv/issues";

/// hsrv Daemon - MD5 hash-set membership server
#[derive(Parser, Debug)]
#[command(name = "hsrvd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File of digests to serve, one per line
    #[arg(short, long, env = "HSRV_FILE", value_name = "FILE")]
    file: Option<PathBuf>,

    /// TCP port to listen on [default: 9120]
    #[arg(short, long, env = "HSRV_PORT", value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "HSRV_BIND")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "HSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, env = "HSRV_LOG_LEVEL")]
    log_level: Option<String>,

    /// Seconds a client may stay silent before being dropped [default: 15]
    #[arg(long, env = "HSRV_TIMEOUT")]
    timeout: Option<u64>,

    /// Answer STATUS requests
    #[arg(long)]
    status: bool,

    /// Only speak protocol generation 1
    #[arg(long)]
    old_protocol_only: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "HSRV_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Load and validate the hash file, then exit
    #[arg(long)]
    dry_run: bool,

    /// Show where to file bug reports
    #[arg(long)]
    bug_report: bool,

    /// Write the digests found in LISTING to stdout as a hash file, then exit
    #[arg(long, value_name = "LISTING", conflicts_with = "dry_run")]
    convert: Option<PathBuf>,
}

impl Args {
    /// Flags given on the command line, in config-file shape
    fn overrides(&self) -> FileConfig {
        FileConfig {
            file: self.file.clone(),
            port: self.port,
            bind: self.bind.clone(),
            log_level: self.log_level.clone(),
            timeout: self.timeout,
            status: self.status.then_some(true),
            old_protocol_only: self.old_protocol_only.then_some(true),
            metrics_port: self.metrics_port,
            max_line_bytes: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.bug_report {
        println!("File bugs online at: {}", BUG_REPORT_URL);
        return Ok(());
    }

    let file_config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::from(file_config.merge(args.overrides()));

    // Initialize logging
    let level = match settings.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(listing) = &args.convert {
        return convert(listing);
    }

    print_banner();

    let corpus = load_corpus(settings.file.clone()).await?;

    if args.dry_run {
        info!(hashes = corpus.len(), "Dry run: hash file is valid, exiting");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", settings.bind, settings.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", settings.bind, settings.port))?;

    let mut server = TcpServer::new(corpus.clone(), addr, settings.server);

    if let Some(port) = settings.metrics_port {
        let metrics = Arc::new(Metrics::new()?);
        metrics.set_corpus_size(corpus.len());
        server = server.with_metrics(metrics.clone());

        let metrics_addr: SocketAddr = format!("{}:{}", settings.bind, port).parse()?;
        let metrics_server = MetricsServer::new(metrics, metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    info!(
        port = settings.port,
        bind = %settings.bind,
        hashes = corpus.len(),
        timeout_secs = settings.server.idle_timeout.as_secs(),
        status = settings.server.status_enabled,
        old_protocol_only = settings.server.old_protocol_only,
        "Starting hsrv daemon"
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Listening");

    // Serve until the shutdown signal
    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                anyhow::bail!("TCP server error: {}", e);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
        }
    }

    Ok(())
}

/// Build the corpus off the async runtime. Any corruption is fatal.
async fn load_corpus(path: PathBuf) -> Result<Arc<Corpus>> {
    info!(path = %path.display(), "Loading hashes");

    let shown = path.display().to_string();
    let loaded = tokio::task::spawn_blocking(move || Corpus::load(&path))
        .await
        .context("Hash loader panicked")?;

    match loaded {
        Ok(corpus) => {
            info!(hashes = corpus.len(), "Hashes loaded");
            Ok(Arc::new(corpus))
        }
        Err(e) => {
            error!(path = %shown, error = %e, "Couldn't load hash file");
            Err(e).with_context(|| format!("Failed to load hashes from {}", shown))
        }
    }
}

fn convert(listing: &Path) -> Result<()> {
    let input = File::open(listing)
        .with_context(|| format!("Failed to open listing {}", listing.display()))?;
    let stdout = std::io::stdout();
    let written = normalize_listing(BufReader::new(input), BufWriter::new(stdout.lock()))
        .with_context(|| format!("Failed to convert {}", listing.display()))?;
    info!(hashes = written, listing = %listing.display(), "Listing converted");
    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╦ ╦╔═╗╦═╗╦  ╦
  ╠═╣╚═╗╠╦╝╚╗╔╝
  ╩ ╩╚═╝╩╚═ ╚╝
  MD5 hash-set membership server
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
