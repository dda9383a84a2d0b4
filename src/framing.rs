//! Length-prefixed framing over a byte stream.
//!
//! Wire format:
//! ```text
//! +-----------------+------------------+
//! | Length(4, BE)   | Payload(Length)  |
//! +-----------------+------------------+
//! ```
//!
//! A frame is atomic: the receiver either gets the whole payload or the
//! connection is treated as failed. Reads and writes loop until the requested
//! byte count is satisfied, so nothing assumes a message arrives in one call.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum frame payload (256 MB) - prevents memory exhaustion
pub const MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

pub struct FrameCodec;

impl FrameCodec {
    /// Write one frame and flush it
    pub async fn send_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        Self::check_len(payload.len() as u64)?;
        let len = payload.len() as u32;

        write_full(writer, &len.to_be_bytes()).await?;
        write_full(writer, payload).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly before the
    /// next length prefix began.
    pub async fn recv_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match read_full(reader, &mut prefix).await? {
            0 => return Ok(None),
            n if n < LENGTH_PREFIX_SIZE => {
                return Err(Error::TruncatedFrame {
                    expected: LENGTH_PREFIX_SIZE,
                    received: n,
                })
            }
            _ => {}
        }

        let len = u32::from_be_bytes(prefix) as u64;
        Self::check_len(len)?;

        let mut payload = vec![0u8; len as usize];
        let received = read_full(reader, &mut payload).await?;
        if received < payload.len() {
            return Err(Error::TruncatedFrame {
                expected: payload.len(),
                received,
            });
        }

        Ok(Some(payload))
    }

    /// Refuse a payload length no frame can carry
    pub fn check_len(len: u64) -> Result<()> {
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len, MAX_FRAME_SIZE));
        }
        Ok(())
    }

    /// Read one frame where the exchange requires one to follow
    pub async fn recv_required<R>(reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        Self::recv_frame(reader).await?.ok_or(Error::PeerClosed)
    }
}

/// Fill `buf` unless end-of-stream comes first; returns the byte count read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

async fn write_full<W>(writer: &mut W, mut buf: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !buf.is_empty() {
        match writer.write(buf).await {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
