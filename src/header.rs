//! On-disk layout of the coffer image.
//!
//! The image begins with a fixed 48-byte header region:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ 0..8    block count N          (u64 LE)     │
//! │ 8..16   root folder start block (u64 LE)    │
//! │ 16..48  cipher parameters (4 × u64 LE IVs)  │
//! │ 48..    volume bitmap, ⌈N/8⌉ bytes          │
//! ├─────────────────────────────────────────────┤
//! │ HDR..   N blocks of BLOCK_SIZE bytes each   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! `HDR` is `48 + ⌈N/8⌉` rounded up to the next multiple of [`BLOCK_SIZE`].
//! The cipher-parameter record is the only region stored in the clear; it
//! bootstraps key derivation, so it cannot itself be enciphered. Everything
//! else in the image passes through the positional cipher.

use crate::error::{CofferError, Result};
use crate::stream::ImageStream;
use rand::Rng;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Size of one on-disk block in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Per-block metadata: 4-byte `bytes_written` plus 8-byte `next` index.
pub const BLOCK_META: usize = 12;

/// Payload capacity of one block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - BLOCK_META;

/// Length of the fixed header region preceding the bitmap.
pub const HEADER_FIXED: u64 = 48;

/// Image offset of the clear cipher-parameter record.
pub const PARAMS_OFFSET: u64 = 16;

/// Length of the volume bitmap for a given block count.
pub fn bitmap_len(blocks: u64) -> u64 {
    blocks / 8 + u64::from(blocks % 8 != 0)
}

/// Image offset at which the block region starts.
///
/// Saturating arithmetic throughout the layout helpers: a block count read
/// with the wrong key is arbitrary garbage, and these sizes feed the
/// image-length cross-check that rejects it.
pub fn blocks_offset(blocks: u64) -> u64 {
    let end = HEADER_FIXED + bitmap_len(blocks);
    let b = BLOCK_SIZE as u64;
    end.saturating_add(b - 1) / b * b
}

/// Image offset of block `index`.
pub fn block_offset(index: u64, blocks: u64) -> u64 {
    blocks_offset(blocks) + index * BLOCK_SIZE as u64
}

/// Total length of an image holding `blocks` blocks.
pub fn image_len(blocks: u64) -> u64 {
    blocks_offset(blocks).saturating_add(blocks.saturating_mul(BLOCK_SIZE as u64))
}

/// The cipher-parameter record stored in the clear at [`PARAMS_OFFSET`].
///
/// Four random 64-bit IVs, generated once at format time. `iv[0] ∥ iv[1]`
/// is the key-derivation salt; the first 12 bytes of `iv[2] ∥ iv[3]` form
/// the stream-cipher nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub iv: [u64; 4],
}

impl CipherParams {
    pub const LEN: usize = 32;

    /// Generate a fresh random record.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        CipherParams {
            iv: [rng.gen(), rng.gen(), rng.gen(), rng.gen()],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        for (i, iv) in self.iv.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&iv.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(CofferError::InvalidHeader(format!(
                "cipher parameter record too short: {} bytes",
                bytes.len()
            )));
        }
        let mut iv = [0u64; 4];
        for (i, word) in iv.iter_mut().enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(raw);
        }
        Ok(CipherParams { iv })
    }

    /// 16-byte key-derivation salt.
    pub fn salt(&self) -> [u8; 16] {
        let mut salt = [0u8; 16];
        salt[..8].copy_from_slice(&self.iv[0].to_le_bytes());
        salt[8..].copy_from_slice(&self.iv[1].to_le_bytes());
        salt
    }

    /// 12-byte stream-cipher nonce.
    pub fn nonce(&self) -> [u8; 12] {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&self.iv[2].to_le_bytes());
        raw[8..].copy_from_slice(&self.iv[3].to_le_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&raw[..12]);
        nonce
    }
}

/// The enciphered header fields: block count and root start block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total number of blocks in the image.
    pub blocks: u64,

    /// Start block of the root folder. Reserved at format time so the
    /// directory layer always has an anchor; the core never walks it.
    pub root_block: u64,
}

impl Header {
    /// Read the header fields through the ciphered stream.
    pub fn read(stream: &mut ImageStream) -> Result<Self> {
        stream.seek_g(SeekFrom::Start(0))?;
        let blocks = stream.read_u64()?;
        let root_block = stream.read_u64()?;
        let header = Header { blocks, root_block };
        header.validate()?;
        Ok(header)
    }

    /// Write the header fields through the ciphered stream.
    pub fn write(&self, stream: &mut ImageStream) -> Result<()> {
        self.validate()?;
        stream.seek_p(SeekFrom::Start(0))?;
        stream.write_u64(self.blocks)?;
        stream.write_u64(self.root_block)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocks == 0 {
            return Err(CofferError::InvalidHeader(
                "image has zero blocks".to_string(),
            ));
        }
        if self.root_block >= self.blocks {
            return Err(CofferError::InvalidHeader(format!(
                "root block {} exceeds block count {}",
                self.root_block, self.blocks
            )));
        }
        Ok(())
    }
}

/// Read the clear cipher-parameter record from an image file.
///
/// This is the one read that bypasses the ciphered stream: the record is
/// needed before any key material exists.
pub fn read_params<P: AsRef<Path>>(path: P) -> Result<CipherParams> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(PARAMS_OFFSET))?;
    let mut raw = [0u8; CipherParams::LEN];
    file.read_exact(&mut raw)?;
    CipherParams::from_bytes(&raw)
}

/// Write the clear cipher-parameter record into an image file.
pub fn write_params(file: &mut File, params: &CipherParams) -> Result<()> {
    file.seek(SeekFrom::Start(PARAMS_OFFSET))?;
    file.write_all(&params.to_bytes())?;
    Ok(())
}
