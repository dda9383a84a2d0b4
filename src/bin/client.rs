//! File transfer client entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use blockxfer::cipher::{KeyPair, DEFAULT_PRIVATE_KEY, DEFAULT_PUBLIC_KEY};
use blockxfer::client::{format_size, Client, ClientConfig};
use blockxfer::server::DEFAULT_PORT;
use blockxfer::DigestScope;

/// Perform a PUT or a GET against a file server
#[derive(Parser)]
#[command(name = "blockxfer-client")]
#[command(version)]
#[command(about = "Block-encrypted file transfer client", long_about = None)]
#[command(group(ArgGroup::new("request").required(true).args(["put", "get"])))]
struct Cli {
    /// Server info (IP or hostname)
    #[arg(short = 's', long = "server", default_value = "localhost")]
    server: String,

    /// Port on which to contact the server
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// PUT the file at this path
    #[arg(short = 'P', long)]
    put: Option<PathBuf>,

    /// Remote name for a PUT (defaults to the local file name)
    #[arg(short = 'n', long, requires = "put")]
    name: Option<String>,

    /// GET the file with this name
    #[arg(short = 'G', long)]
    get: Option<String>,

    /// For GETs, name to use when saving the file locally
    #[arg(short = 'S', long, requires = "get")]
    save_as: Option<PathBuf>,

    /// Which bytes the transfer digest covers (must match the server)
    #[arg(long, value_enum, default_value_t = DigestScope::Plaintext)]
    digest_over: DigestScope,

    /// Path to the public key (PEM)
    #[arg(long, default_value = DEFAULT_PUBLIC_KEY)]
    public_key: PathBuf,

    /// Path to the private key (PEM)
    #[arg(long, default_value = DEFAULT_PRIVATE_KEY)]
    private_key: PathBuf,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,

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

    let keys = KeyPair::load(&cli.public_key, &cli.private_key)?;

    let config = ClientConfig {
        server_host: cli.server,
        port: cli.port,
        keys: Arc::new(keys),
        digest_scope: cli.digest_over,
        show_progress: !cli.no_progress,
    };

    let client = Client::new(config);
    let mut session = client.connect().await?;

    if let Some(path) = cli.put {
        let remote_name = match cli.name {
            Some(name) => name,
            None => path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .with_context(|| format!("Cannot derive a remote name from {:?}", path))?,
        };

        let receipt = session.put(&path, &remote_name).await?;
        info!(
            "Stored {} on server ({})",
            receipt.filename,
            format_size(receipt.size as u64)
        );
    } else if let Some(remote) = cli.get {
        let save_as = cli.save_as.unwrap_or_else(|| PathBuf::from(&remote));
        let receipt = session.get(&remote, &save_as).await?;
        info!(
            "Retrieved {} ({}, digest {})",
            receipt.filename,
            format_size(receipt.size as u64),
            receipt.digest
        );
    }

    Ok(())
}
