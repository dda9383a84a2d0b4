//! Key pair generation for the file transfer client and server

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use blockxfer::cipher::{
    KeyPair, DEFAULT_KEY_BITS, DEFAULT_PRIVATE_KEY, DEFAULT_PUBLIC_KEY, MIN_KEY_BITS,
};

/// Largest modulus the underlying RSA implementation will parse back
const MAX_KEY_BITS: u64 = 4096;

/// Generate the RSA key pair shared by client and server
#[derive(Parser)]
#[command(name = "blockxfer-keygen")]
#[command(version)]
#[command(about = "Generate public.pem and private.pem", long_about = None)]
struct Cli {
    /// Modulus size in bits
    #[arg(
        long,
        default_value_t = DEFAULT_KEY_BITS as u64,
        value_parser = clap::value_parser!(u64).range(MIN_KEY_BITS as u64..=MAX_KEY_BITS)
    )]
    bits: u64,

    /// Output directory for the key files
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Overwrite existing key files
    #[arg(short, long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let public_path = cli.out.join(DEFAULT_PUBLIC_KEY);
    let private_path = cli.out.join(DEFAULT_PRIVATE_KEY);

    if !cli.force && (public_path.exists() || private_path.exists()) {
        anyhow::bail!(
            "Key files already exist in {:?}; pass --force to overwrite",
            cli.out
        );
    }

    info!("🔐 Generating {}-bit RSA key pair...", cli.bits);

    std::fs::create_dir_all(&cli.out)?;
    let keys = KeyPair::generate(cli.bits as usize)?;
    keys.save(&public_path, &private_path)?;

    info!("✅ Key pair generated successfully!");
    info!("   Public key:  {:?}", public_path);
    info!("   Private key: {:?}", private_path);
    info!("   Copy both files to the client and the server.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_bounds() {
        let cli = Cli::try_parse_from(["blockxfer-keygen"]).unwrap();
        assert_eq!(cli.bits, DEFAULT_KEY_BITS as u64);

        assert!(Cli::try_parse_from(["blockxfer-keygen", "--bits", "80"]).is_err());
        assert!(Cli::try_parse_from(["blockxfer-keygen", "--bits", "8192"]).is_err());
        assert!(Cli::try_parse_from(["blockxfer-keygen", "--bits", "1024"]).is_ok());
    }
}
