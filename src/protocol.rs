//! Wire format shared by both ends of a transfer.
//!
//! ```text
//! REQUEST (collector -> supplier): [0x01][8 bytes LE: block index]
//! DATA    (supplier -> collector): [0x02][8 bytes LE: block index]
//!                                  [N bytes: encrypted payload]
//!                                  [16 bytes: MD5 of the plaintext]
//! STOP    (either direction):      [0x03]
//! ```
//!
//! N is fixed by the local transfer plan (the final block carries the
//! remainder), so nothing on the wire ever dictates a buffer size. Every
//! read is exact-size; a short read is a transport failure, not a frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Frame type IDs (numeric values are load-bearing for interop)
pub mod tag {
    pub const REQUEST: u8 = 1;
    pub const DATA: u8 = 2;
    pub const STOP: u8 = 3;
}

/// MD5 digest length carried after each data payload.
pub const HASH_LEN: usize = 16;

/// Default block size (64 MiB) when none is configured.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Writes a request for one block.
pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, index: u64) -> io::Result<()> {
    let mut frame = [0u8; 9];
    frame[0] = tag::REQUEST;
    frame[1..].copy_from_slice(&index.to_le_bytes());
    writer.write_all(&frame).await
}

/// Writes a stop frame (shutdown signal or its acknowledgement).
pub async fn write_stop<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[tag::STOP]).await
}

/// Writes a data frame: header, encrypted payload, plaintext digest.
pub async fn write_data<W: AsyncWrite + Unpin>(
    writer: &mut W,
    index: u64,
    payload: &[u8],
    digest: &[u8; HASH_LEN],
) -> io::Result<()> {
    let mut header = [0u8; 9];
    header[0] = tag::DATA;
    header[1..].copy_from_slice(&index.to_le_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.write_all(digest).await
}

/// Reads a single tag byte; the supplier's wait-for-work read.
pub async fn read_tag<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u8> {
    reader.read_u8().await
}

/// Reads the block index that follows a request tag.
pub async fn read_block_index<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    reader.read_u64_le().await
}

/// Reads a full 9-byte frame header: tag plus block index. The collector
/// reads responses this way since only data frames are legal here; the
/// caller decides what a foreign tag means.
pub async fn read_frame_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u8, u64)> {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header).await?;
    let mut index = [0u8; 8];
    index.copy_from_slice(&header[1..]);
    Ok((header[0], u64::from_le_bytes(index)))
}

/// Reads the digest trailer of a data frame.
pub async fn read_digest<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<[u8; HASH_LEN]> {
    let mut digest = [0u8; HASH_LEN];
    reader.read_exact(&mut digest).await?;
    Ok(digest)
}
