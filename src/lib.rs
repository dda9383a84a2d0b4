//! Block-encrypted File Transfer
//!
//! A PUT/GET file transfer protocol over a single persistent TCP connection.
//!
//! ## Features
//! - Length-prefixed framing with big-endian lengths
//! - Block-wise RSA encryption of file payloads
//! - MD5 digests with an explicit mismatch policy per side
//! - Server-side LRU cache of recently served files
//! - Path validation on every filename the server receives
//!
//! ## Usage
//!
//! ```bash
//! # Generate public.pem / private.pem
//! blockxfer-keygen
//!
//! # Start server on port 9000 with a 10-file cache
//! blockxfer-server -p 9000 -l 10
//!
//! # Upload a file
//! blockxfer-client -s localhost -p 9000 -P notes.txt
//!
//! # Download a file
//! blockxfer-client -s localhost -p 9000 -G notes.txt -S local_copy.txt
//! ```

pub mod cache;
pub mod cipher;
pub mod client;
pub mod error;
pub mod framing;
pub mod integrity;
pub mod protocol;
pub mod server;

pub use cache::FileCache;
pub use cipher::{BlockCipher, KeyPair};
pub use client::{Client, ClientConfig, ClientSession, Receipt};
pub use error::{Error, ErrorClass};
pub use framing::FrameCodec;
pub use integrity::{DigestScope, IntegrityPolicy};
pub use protocol::{Request, Response};
pub use server::{Server, ServerConfig};
