//! File Transfer Server Module
//!
//! This module implements the storage side of the protocol:
//! - Accepts TCP connections and serves each one on its own task
//! - Decrypts uploads block by block and commits them atomically to disk
//! - Serves downloads through the LRU file cache, encrypted per request
//! - Converts every per-request failure into an `ERR` response
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Accept Loop                           │
//! │  - One task per connection (bounded by a semaphore)      │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Connection Handler                       │
//! │  - Frame codec / header parsing                          │
//! │  - Filename validation (prevent traversal)               │
//! │  - Block cipher + digest policy                          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//! ┌─────────────────────────────────────────────────────────┐
//! │                    File Cache                            │
//! │  - LRU over the storage root                             │
//! │  - Per-filename read/write exclusion                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Only file payloads are encrypted. Headers, filenames and digests are sent
//! in the clear and peers are not authenticated.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::FileCache;
use crate::cipher::{offload, BlockCipher, KeyPair};
use crate::error::{Error, ErrorClass};
use crate::framing::MAX_FRAME_SIZE;
use crate::integrity::{digest, DigestScope, IntegrityPolicy};
use crate::protocol::{
    read_request, validate_filename, write_response, Delivery, PutRequest, Request, Response,
};

/// Maximum concurrent connections
const MAX_CONNECTIONS: usize = 100;

/// Default port
pub const DEFAULT_PORT: u16 = 9000;

/// Default maximum upload size (64 MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory to store files
    pub storage_dir: PathBuf,
    /// Number of files kept in the cache (0 disables it)
    pub cache_capacity: usize,
    /// Key pair used for every transfer
    pub keys: Arc<KeyPair>,
    /// Bytes covered by transfer digests
    pub digest_scope: DigestScope,
    /// What to do when an upload's digest disagrees
    pub integrity_policy: IntegrityPolicy,
    /// Maximum file size in bytes
    pub max_file_size: u64,
}

/// State shared by every connection
struct Shared {
    cache: FileCache,
    cipher: BlockCipher,
    digest_scope: DigestScope,
    integrity_policy: IntegrityPolicy,
    max_file_size: u64,
}

/// File transfer server bound to a listening socket
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Prepare the storage directory and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        setup_storage_directory(&config.storage_dir).await?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

        let cache = FileCache::new(&config.storage_dir, config.cache_capacity);
        info!(
            "📁 Storage directory: {:?}, cache capacity: {}",
            config.storage_dir,
            cache.capacity()
        );

        let shared = Shared {
            cache,
            cipher: BlockCipher::new(config.keys),
            digest_scope: config.digest_scope,
            integrity_policy: config.integrity_policy,
            max_file_size: config.max_file_size,
        };

        Ok(Self {
            listener,
            shared: Arc::new(shared),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!("🔒 File transfer server listening on {}", self.local_addr()?);

        loop {
            let (tcp_stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    continue;
                }
            };

            let shared = self.shared.clone();

            tokio::spawn(async move {
                let _permit = permit;

                match handle_connection(tcp_stream, peer_addr, shared).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {}", peer_addr, e),
                }
            });
        }
    }
}

async fn setup_storage_directory(storage_dir: &std::path::Path) -> Result<()> {
    if !storage_dir.exists() {
        fs::create_dir_all(storage_dir)
            .await
            .with_context(|| format!("Failed to create storage directory: {:?}", storage_dir))?;
        info!("Created storage directory: {:?}", storage_dir);
    }
    Ok(())
}

async fn handle_connection(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Error> {
    info!("📥 New connection from {}", peer_addr);

    let (reader, writer) = tcp_stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    serve_requests(&mut reader, &mut writer, peer_addr, &shared).await
}

/// Serve requests on one connection until the client leaves or the stream breaks.
///
/// Per-request failures become `ERR` responses; the loop only ends early when
/// the error leaves the stream unusable.
async fn serve_requests<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer_addr: SocketAddr,
    shared: &Shared,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let request = match read_request(reader).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!("Client {} disconnected", peer_addr);
                return Ok(());
            }
            Err(e) if e.class() == ErrorClass::ProtocolViolation => {
                warn!("Protocol violation from {}: {}", peer_addr, e);
                write_response(writer, &Response::Error(e.to_string())).await?;
                return Err(e);
            }
            // Transport failures leave nothing to answer on
            Err(e) => return Err(e),
        };

        debug!("Request from {}: {} {}", peer_addr, verb(&request), request.filename());

        match process_request(request, shared).await {
            Ok(delivery) => write_response(writer, &Response::Ok(delivery)).await?,
            Err(e) => {
                warn!("Request from {} failed: {}", peer_addr, e);
                write_response(writer, &Response::Error(e.to_string())).await?;
                if e.is_fatal_to_connection() {
                    return Err(e);
                }
            }
        }
    }
}

fn verb(request: &Request) -> &'static str {
    match request {
        Request::Put(_) => "PUT",
        Request::Get { .. } => "GET",
    }
}

async fn process_request(request: Request, shared: &Shared) -> Result<Delivery, Error> {
    match request {
        Request::Put(put) => handle_put(put, shared).await,
        Request::Get { filename } => handle_get(&filename, shared).await,
    }
}

/// Decrypt, check and commit an upload
async fn handle_put(put: PutRequest, shared: &Shared) -> Result<Delivery, Error> {
    let filename = validate_filename(&put.filename)?;

    if put.plaintext_size as u64 > shared.max_file_size {
        return Err(Error::Storage(format!(
            "file too large: {} bytes (max: {})",
            put.plaintext_size, shared.max_file_size
        )));
    }

    let expected_len = shared.cipher.ciphertext_len(put.plaintext_size as usize);
    if put.ciphertext.len() != expected_len {
        return Err(Error::Crypto(format!(
            "{} plaintext bytes encrypt to {} bytes under this key, got {}",
            put.plaintext_size,
            expected_len,
            put.ciphertext.len()
        )));
    }

    let cipher = shared.cipher.clone();
    let plaintext_size = put.plaintext_size as usize;
    let ciphertext = put.ciphertext;
    let (plaintext, ciphertext) = offload(move || {
        let plaintext = cipher.decrypt(&ciphertext, plaintext_size)?;
        Ok((plaintext, ciphertext))
    })
    .await?;

    let covered = shared.digest_scope.select(&plaintext, &ciphertext);
    shared
        .integrity_policy
        .enforce(&format!("PUT {}", filename), &put.digest, covered)?;
    let actual = digest(covered);

    shared.cache.store(&filename, &plaintext).await?;

    info!(
        "✅ File received: {} ({} bytes, digest: {})",
        filename, put.plaintext_size, actual
    );

    Ok(Delivery {
        filename,
        size: put.plaintext_size,
        digest: actual,
        payload: Vec::new(),
    })
}

/// Fetch through the cache and encrypt for the wire
async fn handle_get(filename: &str, shared: &Shared) -> Result<Delivery, Error> {
    let filename = validate_filename(filename)?;

    let entry = shared.cache.lookup(&filename).await?;
    let stats = shared.cache.stats();
    debug!(
        "Cache stats: {} hits, {} misses, {} entries",
        stats.hits, stats.misses, stats.len
    );

    check_outgoing_size(&shared.cipher, entry.size as u64, shared.max_file_size)?;

    let cipher = shared.cipher.clone();
    let content = entry.content.clone();
    let ciphertext = offload(move || cipher.encrypt(&content)).await?;

    let content_digest = digest(shared.digest_scope.select(&entry.content, &ciphertext));

    info!("📤 Sending file: {} ({} bytes)", filename, entry.size);

    Ok(Delivery {
        filename,
        size: entry.size,
        digest: content_digest,
        payload: ciphertext,
    })
}

/// Refuse a download before any of it is encrypted or sent
fn check_outgoing_size(
    cipher: &BlockCipher,
    plaintext_size: u64,
    max_file_size: u64,
) -> Result<(), Error> {
    if plaintext_size > max_file_size {
        return Err(Error::Storage(format!(
            "file too large: {} bytes (max: {})",
            plaintext_size, max_file_size
        )));
    }

    let ciphertext_len = cipher.ciphertext_len(plaintext_size as usize) as u64;
    if ciphertext_len > MAX_FRAME_SIZE {
        return Err(Error::Storage(format!(
            "file too large to send: {} bytes encrypt to {} (max frame: {})",
            plaintext_size, ciphertext_len, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::test_keys;
    use crate::framing::FrameCodec;
    use crate::integrity;
    use crate::protocol::{read_response, write_request, RequestHeader};
    use tempfile::TempDir;

    fn shared(policy: IntegrityPolicy) -> (TempDir, Shared) {
        let dir = tempfile::tempdir().unwrap();
        let shared = Shared {
            cache: FileCache::new(dir.path(), 4),
            cipher: BlockCipher::new(test_keys()),
            digest_scope: DigestScope::Plaintext,
            integrity_policy: policy,
            max_file_size: 1024 * 1024,
        };
        (dir, shared)
    }

    fn put_request(shared: &Shared, filename: &str, content: &[u8], digest: String) -> Request {
        Request::Put(PutRequest {
            filename: filename.into(),
            plaintext_size: content.len() as u32,
            digest,
            ciphertext: shared.cipher.encrypt(content).unwrap(),
        })
    }

    /// Run `serve_requests` against a scripted client and return the raw replies
    async fn exchange(shared: Shared, wire: Vec<u8>) -> (Result<(), Error>, Vec<u8>) {
        let mut reader = wire.as_slice();
        let mut replies = Vec::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = serve_requests(&mut reader, &mut replies, peer, &shared).await;
        (result, replies)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (dir, shared) = shared(IntegrityPolicy::Reject);
        let content = b"hello over the wire".to_vec();

        let mut wire = Vec::new();
        let put = put_request(&shared, "greeting.txt", &content, integrity::digest(&content));
        write_request(&mut wire, &put).await.unwrap();
        write_request(
            &mut wire,
            &Request::Get {
                filename: "greeting.txt".into(),
            },
        )
        .await
        .unwrap();

        let cipher = shared.cipher.clone();
        let (result, replies) = exchange(shared, wire).await;
        assert!(result.is_ok());
        assert_eq!(std::fs::read(dir.path().join("greeting.txt")).unwrap(), content);

        let mut replies = replies.as_slice();
        match read_response(&mut replies).await.unwrap() {
            Response::Ok(ack) => {
                assert_eq!(ack.size as usize, content.len());
                assert_eq!(ack.digest, integrity::digest(&content));
                assert!(ack.payload.is_empty());
            }
            other => panic!("unexpected response: {:?}", other),
        }
        match read_response(&mut replies).await.unwrap() {
            Response::Ok(delivery) => {
                assert_eq!(delivery.filename, "greeting.txt");
                let plain = cipher
                    .decrypt(&delivery.payload, delivery.size as usize)
                    .unwrap();
                assert_eq!(plain, content);
                assert_eq!(delivery.digest, integrity::digest(&plain));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_traversal_rejected_and_connection_kept() {
        let (_dir, shared) = shared(IntegrityPolicy::Warn);
        let mut wire = Vec::new();
        for name in ["../secret", "/etc/passwd", "missing.txt"] {
            write_request(
                &mut wire,
                &Request::Get {
                    filename: name.into(),
                },
            )
            .await
            .unwrap();
        }

        let (result, replies) = exchange(shared, wire).await;
        assert!(result.is_ok());

        let mut replies = replies.as_slice();
        for _ in 0..3 {
            assert!(matches!(
                read_response(&mut replies).await.unwrap(),
                Response::Error(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_digest_mismatch_policy() {
        let content = b"payload".to_vec();
        let wrong = integrity::digest(b"something else");

        let (dir, lenient) = shared(IntegrityPolicy::Warn);
        let mut wire = Vec::new();
        write_request(&mut wire, &put_request(&lenient, "a", &content, wrong.clone()))
            .await
            .unwrap();
        let (_, replies) = exchange(lenient, wire).await;
        match read_response(&mut replies.as_slice()).await.unwrap() {
            // Accepted, but the acknowledgement carries the real digest
            Response::Ok(ack) => assert_eq!(ack.digest, integrity::digest(&content)),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(dir.path().join("a").exists());

        let (dir, strict) = shared(IntegrityPolicy::Reject);
        let mut wire = Vec::new();
        write_request(&mut wire, &put_request(&strict, "a", &content, wrong))
            .await
            .unwrap();
        let (_, replies) = exchange(strict, wire).await;
        assert!(matches!(
            read_response(&mut replies.as_slice()).await.unwrap(),
            Response::Error(_)
        ));
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_malformed_header_closes_connection() {
        let (_dir, shared) = shared(IntegrityPolicy::Warn);
        let mut wire = Vec::new();
        FrameCodec::send_frame(&mut wire, b"PUT\nfile").await.unwrap();

        let (result, replies) = exchange(shared, wire).await;
        assert!(matches!(result, Err(Error::MalformedHeader(_))));
        match read_response(&mut replies.as_slice()).await.unwrap() {
            Response::Error(message) => assert!(message.contains("missing")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ciphertext_size_must_match_plaintext_size() {
        let (_dir, shared) = shared(IntegrityPolicy::Warn);
        let mut wire = Vec::new();
        let header = RequestHeader::Put {
            filename: "x".into(),
            ciphertext_size: 3,
            plaintext_size: 1,
        };
        FrameCodec::send_frame(&mut wire, &header.encode()).await.unwrap();
        FrameCodec::send_frame(&mut wire, integrity::digest(b"x").as_bytes())
            .await
            .unwrap();
        FrameCodec::send_frame(&mut wire, &[1, 2, 3]).await.unwrap();

        let (result, replies) = exchange(shared, wire).await;
        assert!(result.is_ok());
        assert!(matches!(
            read_response(&mut replies.as_slice()).await.unwrap(),
            Response::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_upload_size_limit() {
        let (_dir, mut shared) = shared(IntegrityPolicy::Warn);
        shared.max_file_size = 4;
        let content = b"too long".to_vec();
        let mut wire = Vec::new();
        write_request(
            &mut wire,
            &put_request(&shared, "big", &content, integrity::digest(&content)),
        )
        .await
        .unwrap();

        let (_, replies) = exchange(shared, wire).await;
        match read_response(&mut replies.as_slice()).await.unwrap() {
            Response::Error(message) => assert!(message.contains("too large")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_download_answers_with_error() {
        let (dir, mut shared) = shared(IntegrityPolicy::Warn);
        shared.max_file_size = 4;
        std::fs::write(dir.path().join("big"), b"too long").unwrap();
        std::fs::write(dir.path().join("small"), b"ok").unwrap();

        let mut wire = Vec::new();
        for name in ["big", "small"] {
            write_request(&mut wire, &Request::Get { filename: name.into() })
                .await
                .unwrap();
        }

        let (result, replies) = exchange(shared, wire).await;
        assert!(result.is_ok());

        let mut replies = replies.as_slice();
        match read_response(&mut replies).await.unwrap() {
            Response::Error(message) => assert!(message.contains("too large")),
            other => panic!("unexpected response: {:?}", other),
        }
        match read_response(&mut replies).await.unwrap() {
            Response::Ok(delivery) => assert_eq!(delivery.filename, "small"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_download_must_fit_one_frame() {
        let cipher = BlockCipher::new(test_keys());
        let largest = MAX_FRAME_SIZE / cipher.cipher_block_size() as u64
            * cipher.block_size() as u64;

        assert!(check_outgoing_size(&cipher, largest, u64::MAX).is_ok());
        assert!(matches!(
            check_outgoing_size(&cipher, largest + 1, u64::MAX),
            Err(Error::Storage(_))
        ));
        assert!(matches!(
            check_outgoing_size(&cipher, 10, 9),
            Err(Error::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_ends_connection() {
        let (dir, shared) = shared(IntegrityPolicy::Warn);
        let mut wire = Vec::new();
        let header = RequestHeader::Put {
            filename: "partial".into(),
            ciphertext_size: 128,
            plaintext_size: 10,
        };
        FrameCodec::send_frame(&mut wire, &header.encode()).await.unwrap();
        FrameCodec::send_frame(&mut wire, integrity::digest(b"x").as_bytes())
            .await
            .unwrap();
        // Length prefix promises 128 bytes, the peer hangs up after 3
        wire.extend_from_slice(&[0, 0, 0, 128, 1, 2, 3]);

        let (result, replies) = exchange(shared, wire).await;
        assert!(matches!(result, Err(Error::TruncatedFrame { .. })));
        assert!(replies.is_empty());
        assert!(!dir.path().join("partial").exists());
    }
}
