//! File transfer server entry point

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use blockxfer::cache::DEFAULT_CACHE_CAPACITY;
use blockxfer::cipher::{KeyPair, DEFAULT_PRIVATE_KEY, DEFAULT_PUBLIC_KEY};
use blockxfer::server::{Server, ServerConfig, DEFAULT_MAX_FILE_SIZE, DEFAULT_PORT};
use blockxfer::{DigestScope, IntegrityPolicy};

const MB: u64 = 1024 * 1024;

/// Sizes travel as u32, so nothing larger than 4 GiB can be transferred
const MAX_SIZE_MB: u64 = 4096;

/// Serve PUT and GET requests from a local directory
///
/// File payloads are encrypted block by block with the RSA key pair;
/// headers are not encrypted and peers are not authenticated.
#[derive(Parser)]
#[command(name = "blockxfer-server")]
#[command(version)]
#[command(about = "Block-encrypted file transfer server", long_about = None)]
struct Cli {
    /// Port on which to listen for connections
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of entries in the file cache (0 disables caching)
    #[arg(short = 'l', long = "cache", default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache: usize,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Storage directory for files
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Maximum file size in MB
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_FILE_SIZE / MB,
        value_parser = clap::value_parser!(u64).range(1..=MAX_SIZE_MB)
    )]
    max_size: u64,

    /// Refuse uploads whose digest does not match (default: accept with a warning)
    #[arg(long)]
    strict_integrity: bool,

    /// Which bytes the transfer digest covers
    #[arg(long, value_enum, default_value_t = DigestScope::Plaintext)]
    digest_over: DigestScope,

    /// Path to the public key (PEM)
    #[arg(long, default_value = DEFAULT_PUBLIC_KEY)]
    public_key: PathBuf,

    /// Path to the private key (PEM)
    #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
    private_key: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("🚀 Starting file transfer server...");

    let keys = KeyPair::load(&cli.public_key, &cli.private_key)?;

    let integrity_policy = if cli.strict_integrity {
        IntegrityPolicy::Reject
    } else {
        IntegrityPolicy::Warn
    };

    let config = ServerConfig {
        bind_addr: SocketAddr::new(cli.bind, cli.port),
        storage_dir: cli.root,
        cache_capacity: cli.cache,
        keys: Arc::new(keys),
        digest_scope: cli.digest_over,
        integrity_policy,
        max_file_size: cli.max_size * MB,
    };

    let server = Server::bind(config).await?;
    server.run().await
}
