//! Key Pair and Block Cipher Module
//!
//! Payloads are encrypted with RSA one block at a time:
//!
//! ```text
//! plaintext  |<--- B --->|<--- B --->| ... |<- tail ->|
//!                  |           |                 |
//!               encrypt     encrypt           encrypt
//!                  |           |                 |
//! ciphertext |<--- K --->|<--- K --->| ... |<--- K -->|
//! ```
//!
//! `K` is the modulus length in bytes and `B = K - 11`, the largest input
//! PKCS#1 v1.5 accepts. Blocks are concatenated without delimiters, so the
//! decoder rebuilds the block boundaries from the declared plaintext length,
//! never from the ciphertext itself.
//!
//! The key pair is loaded once at startup and shared read-only.

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::error::{Error, Result};

/// Well-known public key location
pub const DEFAULT_PUBLIC_KEY: &str = "public.pem";

/// Well-known private key location
pub const DEFAULT_PRIVATE_KEY: &str = "private.pem";

/// Default modulus size for generated keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Smallest modulus accepted for generated or loaded keys
pub const MIN_KEY_BITS: usize = 512;

/// Bytes of each block consumed by PKCS#1 v1.5 padding
const PKCS1_OVERHEAD: usize = 11;

/// RSA key pair shared by both ends of a transfer
pub struct KeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("modulus_bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Load a key pair from PEM files.
    ///
    /// The public key may be SPKI (`BEGIN PUBLIC KEY`) or PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`); the private key may be PKCS#8 or PKCS#1.
    pub fn load(public_path: &Path, private_path: &Path) -> AnyResult<Self> {
        let public_pem = fs::read_to_string(public_path)
            .with_context(|| format!("Failed to read public key {:?}", public_path))?;
        let private_pem = fs::read_to_string(private_path)
            .with_context(|| format!("Failed to read private key {:?}", private_path))?;

        let public = RsaPublicKey::from_public_key_pem(&public_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&public_pem))
            .with_context(|| format!("Invalid public key in {:?}", public_path))?;
        let private = RsaPrivateKey::from_pkcs8_pem(&private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&private_pem))
            .with_context(|| format!("Invalid private key in {:?}", private_path))?;

        check_modulus(public.size() * 8)
            .with_context(|| format!("Unusable key pair in {:?}", public_path))?;

        if private.to_public_key() != public {
            anyhow::bail!(
                "Public key {:?} does not belong to private key {:?}",
                public_path,
                private_path
            );
        }

        info!(
            "🔑 Loaded {}-bit key pair from {:?} / {:?}",
            public.size() * 8,
            public_path,
            private_path
        );

        Ok(Self { public, private })
    }

    /// Generate a fresh key pair
    pub fn generate(bits: usize) -> AnyResult<Self> {
        check_modulus(bits)?;
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .with_context(|| format!("Failed to generate {}-bit RSA key", bits))?;
        let public = private.to_public_key();
        Ok(Self { public, private })
    }

    /// Write the key pair as PEM files.
    ///
    /// The private key gets owner-only permissions on Unix.
    pub fn save(&self, public_path: &Path, private_path: &Path) -> AnyResult<()> {
        let public_pem = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .context("Failed to encode public key")?;
        let private_pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .context("Failed to encode private key")?;

        fs::write(public_path, public_pem.as_bytes())
            .with_context(|| format!("Failed to write {:?}", public_path))?;
        fs::write(private_path, private_pem.as_bytes())
            .with_context(|| format!("Failed to write {:?}", private_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        Ok(())
    }

    /// Modulus length in bytes
    pub fn modulus_len(&self) -> usize {
        self.public.size()
    }
}

/// Every block must have room for plaintext after the padding
fn check_modulus(bits: usize) -> AnyResult<()> {
    if bits < MIN_KEY_BITS {
        anyhow::bail!(
            "{}-bit RSA modulus is too small (minimum {} bits)",
            bits,
            MIN_KEY_BITS
        );
    }
    Ok(())
}

/// Block boundaries for a plaintext of a given length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: usize,
    pub full_blocks: usize,
    pub tail_len: usize,
}

impl BlockLayout {
    pub fn new(plaintext_len: usize, block_size: usize) -> Self {
        Self {
            block_size,
            full_blocks: plaintext_len / block_size,
            tail_len: plaintext_len % block_size,
        }
    }

    /// Number of encryption calls, counting a short trailing block
    pub fn block_count(&self) -> usize {
        self.full_blocks + usize::from(self.tail_len > 0)
    }

    /// Plaintext byte range of each block, in order
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        let full = (0..self.full_blocks).map(|i| i * self.block_size..(i + 1) * self.block_size);
        let tail = (self.tail_len > 0).then(|| {
            let start = self.full_blocks * self.block_size;
            start..start + self.tail_len
        });
        full.chain(tail)
    }
}

/// Block-wise RSA codec
#[derive(Clone)]
pub struct BlockCipher {
    keys: Arc<KeyPair>,
}

impl BlockCipher {
    pub fn new(keys: Arc<KeyPair>) -> Self {
        Self { keys }
    }

    /// Plaintext bytes per block
    pub fn block_size(&self) -> usize {
        self.keys.modulus_len() - PKCS1_OVERHEAD
    }

    /// Ciphertext bytes per block
    pub fn cipher_block_size(&self) -> usize {
        self.keys.modulus_len()
    }

    pub fn layout(&self, plaintext_len: usize) -> BlockLayout {
        BlockLayout::new(plaintext_len, self.block_size())
    }

    /// Ciphertext length produced for a plaintext of `plaintext_len` bytes
    pub fn ciphertext_len(&self, plaintext_len: usize) -> usize {
        self.layout(plaintext_len).block_count() * self.cipher_block_size()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with(plaintext, |_| {})
    }

    /// Encrypt, calling `on_block` with the plaintext length of each finished block
    pub fn encrypt_with<F>(&self, plaintext: &[u8], mut on_block: F) -> Result<Vec<u8>>
    where
        F: FnMut(usize),
    {
        let layout = self.layout(plaintext.len());
        let k = self.cipher_block_size();
        let mut ciphertext = Vec::with_capacity(layout.block_count() * k);
        let mut rng = OsRng;

        for (index, range) in layout.ranges().enumerate() {
            let len = range.len();
            let block = self
                .keys
                .public
                .encrypt(&mut rng, Pkcs1v15Encrypt, &plaintext[range])
                .map_err(|e| Error::Crypto(format!("encrypting block {}: {}", index, e)))?;
            if block.len() != k {
                return Err(Error::Crypto(format!(
                    "block {} encrypted to {} bytes, expected {}",
                    index,
                    block.len(),
                    k
                )));
            }
            ciphertext.extend_from_slice(&block);
            on_block(len);
        }

        Ok(ciphertext)
    }

    pub fn decrypt(&self, ciphertext: &[u8], plaintext_len: usize) -> Result<Vec<u8>> {
        self.decrypt_with(ciphertext, plaintext_len, |_| {})
    }

    /// Decrypt using the block boundaries implied by `plaintext_len`
    pub fn decrypt_with<F>(
        &self,
        ciphertext: &[u8],
        plaintext_len: usize,
        mut on_block: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(usize),
    {
        let layout = self.layout(plaintext_len);
        let k = self.cipher_block_size();
        let expected = layout.block_count() * k;
        if ciphertext.len() != expected {
            return Err(Error::Crypto(format!(
                "ciphertext is {} bytes, expected {} for {} plaintext bytes",
                ciphertext.len(),
                expected,
                plaintext_len
            )));
        }

        let mut plaintext = Vec::with_capacity(plaintext_len);
        for (index, (range, block)) in layout.ranges().zip(ciphertext.chunks(k)).enumerate() {
            let decrypted = self
                .keys
                .private
                .decrypt(Pkcs1v15Encrypt, block)
                .map_err(|e| Error::Crypto(format!("decrypting block {}: {}", index, e)))?;
            if decrypted.len() != range.len() {
                return Err(Error::Crypto(format!(
                    "block {} decrypted to {} bytes, expected {}",
                    index,
                    decrypted.len(),
                    range.len()
                )));
            }
            plaintext.extend_from_slice(&decrypted);
            on_block(range.len());
        }

        Ok(plaintext)
    }
}

/// Run cipher work on the blocking pool so RSA never stalls the reactor
pub(crate) async fn offload<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Crypto(format!("cipher task failed: {}", e)))?
}

#[cfg(test)]
pub(crate) fn test_keys() -> Arc<KeyPair> {
    use std::sync::OnceLock;

    static KEYS: OnceLock<Arc<KeyPair>> = OnceLock::new();
    KEYS.get_or_init(|| Arc::new(KeyPair::generate(1024).unwrap()))
        .clone()
}
