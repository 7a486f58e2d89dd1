//! Peerstore node binary
//!
//! Usage:
//!   peerstore --listen 127.0.0.1:4000 --root data/4000 --bootstrap 127.0.0.1:3000
//!   peerstore --config node.toml --put hello.txt=./hello.txt

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use peerstore::config::{Config, TransformKind};
use peerstore::{build_tcp_server, FileServer};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "peerstore")]
#[command(about = "Peer-to-peer content-addressed file store", long_about = None)]
struct Args {
    /// Configuration file (TOML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (e.g., 127.0.0.1:3000)
    #[arg(short, long)]
    listen: Option<String>,

    /// Storage root directory
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Bootstrap peer address (repeatable)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Key to path transform
    #[arg(long, value_parser = parse_transform)]
    transform: Option<TransformKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Store and replicate a file once running, as KEY=FILE (repeatable)
    #[arg(long, value_parser = parse_put)]
    put: Vec<(String, PathBuf)>,

    /// Delay before --put uploads, so bootstrap peers can connect
    #[arg(long, default_value_t = 1000)]
    put_delay_ms: u64,
}

fn parse_transform(s: &str) -> Result<TransformKind, String> {
    match s {
        "sha1" => Ok(TransformKind::Sha1),
        "plain" => Ok(TransformKind::Plain),
        other => Err(format!("unknown transform '{}', expected sha1 or plain", other)),
    }
}

fn parse_put(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((key, path)) if !key.is_empty() && !path.is_empty() => {
            Ok((key.to_string(), PathBuf::from(path)))
        }
        _ => Err(format!("expected KEY=FILE, got '{}'", s)),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => match &args.listen {
            Some(listen) => Config::new(listen.clone()),
            None => bail!("either --config or --listen is required"),
        },
    };

    if let Some(listen) = &args.listen {
        config.node.listen_addr = listen.clone();
    }
    if let Some(root) = &args.root {
        config.node.storage_root = root.clone();
    }
    if !args.bootstrap.is_empty() {
        config.node.bootstrap = args.bootstrap.clone();
    }
    if let Some(transform) = args.transform {
        config.node.path_transform = transform;
    }
    if let Some(level) = &args.log_level {
        config.node.log_level = level.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn upload(server: &FileServer, key: &str, path: &Path) -> Result<usize> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    server
        .store_data(key, &mut file)
        .with_context(|| format!("failed to store {}", key))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging; RUST_LOG takes precedence over the configured level
    env_logger::Builder::from_env(Env::default().default_filter_or(&config.node.log_level))
        .init();

    log::info!("Peerstore v{}", env!("CARGO_PKG_VERSION"));
    log::info!("  Listen address: {}", config.node.listen_addr);
    log::info!("  Storage root: {}", config.node.storage_root.display());
    log::info!("  Bootstrap nodes: {:?}", config.node.bootstrap);

    let server = Arc::new(build_tcp_server(&config));

    if !args.put.is_empty() {
        let server = Arc::clone(&server);
        let uploads = args.put.clone();
        let delay = Duration::from_millis(args.put_delay_ms);
        thread::spawn(move || {
            thread::sleep(delay);
            for (key, path) in &uploads {
                match upload(&server, key, path) {
                    Ok(peers) => log::info!("Stored {} and replicated to {} peers", key, peers),
                    Err(e) => log::error!("{:#}", e),
                }
            }
        });
    }

    server.start().context("file server failed to start")?;
    Ok(())
}
