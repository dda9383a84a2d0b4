//! File Transfer Client Module
//!
//! This module implements the requesting side of the protocol:
//! - Opens one persistent TCP connection to the server
//! - Encrypts uploads block by block and checks the server's acknowledgement
//! - Decrypts downloads and saves them only when the digest matches
//!
//! ## Exchange
//!
//! ```text
//! PUT:  Idle -> HeaderSent -> BodySent -> AwaitingResponse -> Done
//! GET:  Idle -> HeaderSent -> AwaitingHeaderResponse -> AwaitingBody -> Done
//! ```
//!
//! Any error moves the session to `Failed`, after which it refuses further
//! requests. The client has no fallback, so every error is surfaced.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::cipher::{offload, BlockCipher, KeyPair};
use crate::error::Error;
use crate::framing::FrameCodec;
use crate::integrity::{digest, DigestScope, IntegrityPolicy};
use crate::protocol::{
    check_header_filename, read_delivery, read_response, read_response_head, send_put_body,
    size_field, ExchangeState, PutRequest, RequestHeader, Response, ResponseHead,
};

/// The client never keeps content whose digest disagrees
pub const CLIENT_INTEGRITY_POLICY: IntegrityPolicy = IntegrityPolicy::Reject;

/// Client configuration
pub struct ClientConfig {
    /// Server hostname or IP address
    pub server_host: String,
    /// Server port
    pub port: u16,
    /// Key pair used for every transfer
    pub keys: Arc<KeyPair>,
    /// Bytes covered by transfer digests; must match the server
    pub digest_scope: DigestScope,
    /// Draw progress bars for encryption and decryption
    pub show_progress: bool,
}

/// File transfer client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and return a connected session
    pub async fn connect(&self) -> Result<ClientSession> {
        let addr = format!("{}:{}", self.config.server_host, self.config.port);
        info!("🔗 Connecting to {}...", addr);

        let stream = TcpStream::connect((self.config.server_host.as_str(), self.config.port))
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;

        debug!("TCP connection established");

        let (reader, writer) = stream.into_split();
        Ok(ClientSession {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            cipher: BlockCipher::new(self.config.keys.clone()),
            digest_scope: self.config.digest_scope,
            show_progress: self.config.show_progress,
            state: ExchangeState::Idle,
        })
    }
}

/// Outcome of a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub filename: String,
    pub size: u32,
    pub digest: String,
}

/// Connected client session
pub struct ClientSession {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    cipher: BlockCipher,
    digest_scope: DigestScope,
    show_progress: bool,
    state: ExchangeState,
}

impl ClientSession {
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Upload a local file under `remote_name`
    pub async fn put(&mut self, local_path: &Path, remote_name: &str) -> Result<Receipt> {
        let metadata = fs::metadata(local_path)
            .await
            .with_context(|| format!("Failed to read metadata for {:?}", local_path))?;

        if metadata.is_dir() {
            anyhow::bail!("Cannot upload a directory: {:?}", local_path);
        }

        let content = fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {:?}", local_path))?;

        self.put_bytes(remote_name, content).await
    }

    /// Download `remote_name` and save it to `save_as`.
    ///
    /// Nothing is written unless the content verified; the file appears under
    /// its final name only once fully written.
    pub async fn get(&mut self, remote_name: &str, save_as: &Path) -> Result<Receipt> {
        let (content, receipt) = self.get_bytes(remote_name).await?;

        save_atomically(save_as, &content)
            .await
            .with_context(|| format!("Failed to save {:?}", save_as))?;

        info!("💾 Saved {} to {:?}", receipt.filename, save_as);
        Ok(receipt)
    }

    /// Upload `content` under `remote_name`
    pub async fn put_bytes(&mut self, remote_name: &str, content: Vec<u8>) -> Result<Receipt> {
        check_header_filename(remote_name)?;
        check_upload_size(&self.cipher, content.len())?;
        self.begin()?;
        let result = self.put_exchange(remote_name, content).await;
        self.finish(result)
    }

    /// Download `remote_name` into memory
    pub async fn get_bytes(&mut self, remote_name: &str) -> Result<(Vec<u8>, Receipt)> {
        check_header_filename(remote_name)?;
        self.begin()?;
        let result = self.get_exchange(remote_name).await;
        self.finish(result)
    }

    fn begin(&mut self) -> Result<()> {
        // Done returns to Idle; Failed refuses to
        if self.state.is_terminal() {
            self.state.advance(ExchangeState::Idle)?;
        }
        if self.state != ExchangeState::Idle {
            return Err(Error::InvalidState(format!(
                "cannot start a request in state {:?}",
                self.state
            ))
            .into());
        }
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = ExchangeState::Failed;
        }
        result
    }

    async fn put_exchange(&mut self, remote_name: &str, content: Vec<u8>) -> Result<Receipt> {
        let plaintext_size = size_field(content.len())?;

        info!("📤 Encrypting {} ({} bytes)...", remote_name, plaintext_size);
        let progress = self.progress_bar(content.len() as u64, "Encrypting");
        let cipher = self.cipher.clone();
        let pb = progress.clone();
        let (content, ciphertext) = offload(move || {
            let ciphertext = cipher.encrypt_with(&content, |n| pb.inc(n as u64))?;
            Ok((content, ciphertext))
        })
        .await?;
        progress.finish_and_clear();

        let put = PutRequest {
            filename: remote_name.to_string(),
            plaintext_size,
            digest: digest(self.digest_scope.select(&content, &ciphertext)),
            ciphertext,
        };

        FrameCodec::send_frame(&mut self.writer, &put.header()?.encode())
            .await
            .context("Failed to send PUT header")?;
        self.state.advance(ExchangeState::HeaderSent)?;

        send_put_body(&mut self.writer, &put)
            .await
            .context("Failed to send PUT body")?;
        self.state.advance(ExchangeState::BodySent)?;
        self.state.advance(ExchangeState::AwaitingResponse)?;

        let response = read_response(&mut self.reader)
            .await
            .context("Failed to read PUT response")?;

        match response {
            Response::Ok(ack) => {
                if ack.filename != put.filename.replace('\\', "/") {
                    return Err(Error::UnexpectedToken(format!(
                        "acknowledged {:?}, sent {:?}",
                        ack.filename, put.filename
                    ))
                    .into());
                }
                let sent = self.digest_scope.select(&content, &put.ciphertext);
                CLIENT_INTEGRITY_POLICY
                    .enforce(&format!("PUT {}", remote_name), &ack.digest, sent)
                    .context("Server stored different content")?;
                self.state.advance(ExchangeState::Done)?;

                info!(
                    "✅ Upload complete: {} ({} bytes, digest: {})",
                    ack.filename, ack.size, ack.digest
                );
                Ok(Receipt {
                    filename: ack.filename,
                    size: ack.size,
                    digest: ack.digest,
                })
            }
            Response::Error(message) => Err(Error::Rejected(message).into()),
        }
    }

    async fn get_exchange(&mut self, remote_name: &str) -> Result<(Vec<u8>, Receipt)> {
        let header = RequestHeader::Get {
            filename: remote_name.to_string(),
        };
        FrameCodec::send_frame(&mut self.writer, &header.encode())
            .await
            .context("Failed to send GET header")?;
        self.state.advance(ExchangeState::HeaderSent)?;
        self.state.advance(ExchangeState::AwaitingHeaderResponse)?;

        let (filename, size) = match read_response_head(&mut self.reader)
            .await
            .context("Failed to read GET response")?
        {
            ResponseHead::Ok { filename, size } => (filename, size),
            ResponseHead::Error(message) => return Err(Error::Rejected(message).into()),
        };

        if filename != remote_name.replace('\\', "/") {
            return Err(Error::UnexpectedToken(format!(
                "requested {:?}, server sent {:?}",
                remote_name, filename
            ))
            .into());
        }
        self.state.advance(ExchangeState::AwaitingBody)?;

        let delivery = read_delivery(&mut self.reader, filename, size)
            .await
            .context("Failed to read GET body")?;
        info!(
            "📥 Download ready: {} bytes, digest: {}",
            delivery.size, delivery.digest
        );

        let progress = self.progress_bar(size as u64, "Decrypting");
        let cipher = self.cipher.clone();
        let pb = progress.clone();
        let ciphertext = delivery.payload;
        let (content, ciphertext) = offload(move || {
            let content = cipher.decrypt_with(&ciphertext, size as usize, |n| pb.inc(n as u64))?;
            Ok((content, ciphertext))
        })
        .await?;
        progress.finish_and_clear();

        let received = self.digest_scope.select(&content, &ciphertext);
        CLIENT_INTEGRITY_POLICY
            .enforce(&format!("GET {}", remote_name), &delivery.digest, received)
            .context("Downloaded content failed verification, not saved")?;
        self.state.advance(ExchangeState::Done)?;

        info!("✅ Download complete: {} bytes, digest verified", size);
        Ok((
            content,
            Receipt {
                filename: delivery.filename,
                size,
                digest: delivery.digest,
            },
        ))
    }

    fn progress_bar(&self, total: u64, message: &'static str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = create_progress_bar(total);
        pb.set_message(message);
        pb
    }
}

/// Refuse an upload whose sizes cannot be expressed on the wire, before anything is sent
fn check_upload_size(cipher: &BlockCipher, plaintext_len: usize) -> Result<(), Error> {
    size_field(plaintext_len)?;
    FrameCodec::check_len(cipher.ciphertext_len(plaintext_len) as u64)
}

async fn save_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    let temp_path = parent.join(format!(".{}.part", name.to_string_lossy()));

    let result = write_then_rename(&temp_path, path, content).await;
    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

async fn write_then_rename(temp_path: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    fs::rename(temp_path, path).await
}

/// Create progress bar for block encryption and decryption
fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
