//! A single block of a file chain.
//!
//! Each block is `bytes_written (u32 LE) ∥ next (u64 LE) ∥ payload`. The
//! `next` field of the last block in a chain points at the block itself;
//! that self-loop is the chain terminator, so no index needs reserving as
//! a null sentinel.
//!
//! Two write paths, and the distinction matters: [`FileBlock::write`] is
//! the append path — it grows `bytes_written` and re-terminates the chain
//! when the write is short or offset — while [`FileBlock::overwrite`]
//! patches payload in place and touches neither the count nor `next`, so
//! an overwrite in the middle of a chain can never sever it.

use crate::coreio::SharedCoreIo;
use crate::error::{CofferError, Result};
use crate::header::{block_offset, BLOCK_META, BLOCK_PAYLOAD};
use std::io::SeekFrom;

pub struct FileBlock {
    io: SharedCoreIo,
    index: u64,
    offset: u64,
    bytes_written: u32,
    initial_bytes_written: u32,
    next: u64,
}

impl FileBlock {
    /// Allocate-and-write constructor: writes a fresh header
    /// (`bytes_written = 0`, `next` as given) and marks the block in the
    /// volume bitmap. The payload is left as-is; callers must respect
    /// `bytes_written`.
    pub fn create(io: &SharedCoreIo, index: u64, next: u64) -> Result<Self> {
        let offset = block_offset(index, io.blocks());
        {
            let mut stream = io.stream();
            stream.seek_p(SeekFrom::Start(offset))?;
            stream.write_u32(0)?;
            stream.write_u64(next)?;
            io.bitmap().mark_used(&mut stream, index)?;
        }
        Ok(FileBlock {
            io: io.clone(),
            index,
            offset,
            bytes_written: 0,
            initial_bytes_written: 0,
            next,
        })
    }

    /// Read constructor: loads the header of an existing block.
    pub fn open(io: &SharedCoreIo, index: u64) -> Result<Self> {
        if index >= io.blocks() {
            return Err(CofferError::BadChain(index));
        }
        let offset = block_offset(index, io.blocks());
        let (bytes_written, next) = {
            let mut stream = io.stream();
            stream.seek_g(SeekFrom::Start(offset))?;
            (stream.read_u32()?, stream.read_u64()?)
        };
        if bytes_written as usize > BLOCK_PAYLOAD {
            return Err(CofferError::BadChain(index));
        }
        Ok(FileBlock {
            io: io.clone(),
            index,
            offset,
            bytes_written,
            initial_bytes_written: bytes_written,
            next,
        })
    }

    /// Read payload bytes starting at `extra_offset` within the block.
    pub fn read(&self, buf: &mut [u8], extra_offset: u64) -> Result<()> {
        let n = buf.len() as u64;
        if extra_offset + n > self.bytes_written as u64 {
            return Err(CofferError::OutOfBounds {
                pos: extra_offset + n,
                limit: self.bytes_written as u64,
            });
        }
        let mut stream = self.io.stream();
        stream.seek_g(SeekFrom::Start(self.offset + BLOCK_META as u64 + extra_offset))?;
        stream.read(buf)
    }

    /// Append-path write: payload bytes land at `extra_offset`,
    /// `bytes_written` grows to cover them, and if the write is short of
    /// the payload capacity or starts past zero the block re-terminates
    /// the chain (`next` ← own index). A later append overwrites `next`
    /// again when a successor is allocated.
    pub fn write(&mut self, buf: &[u8], extra_offset: u64) -> Result<()> {
        let n = buf.len() as u64;
        if extra_offset + n > BLOCK_PAYLOAD as u64 {
            return Err(CofferError::OutOfBounds {
                pos: extra_offset + n,
                limit: BLOCK_PAYLOAD as u64,
            });
        }
        let mut stream = self.io.stream();
        stream.seek_p(SeekFrom::Start(self.offset + BLOCK_META as u64 + extra_offset))?;
        stream.write(buf)?;

        // commit the cached header fields only once their disk writes land
        let grown = self.bytes_written.max((extra_offset + n) as u32);
        stream.seek_p(SeekFrom::Start(self.offset))?;
        stream.write_u32(grown)?;
        self.bytes_written = grown;

        if n < BLOCK_PAYLOAD as u64 || extra_offset > 0 {
            stream.write_u64(self.index)?;
            self.next = self.index;
        }
        Ok(())
    }

    /// In-place overwrite of already-written payload. Neither
    /// `bytes_written` nor `next` changes; only append grows the count.
    pub fn overwrite(&self, buf: &[u8], extra_offset: u64) -> Result<()> {
        let n = buf.len() as u64;
        if extra_offset + n > self.bytes_written as u64 {
            return Err(CofferError::OutOfBounds {
                pos: extra_offset + n,
                limit: self.bytes_written as u64,
            });
        }
        let mut stream = self.io.stream();
        stream.seek_p(SeekFrom::Start(self.offset + BLOCK_META as u64 + extra_offset))?;
        stream.write(buf)
    }

    /// Point this block at its successor (or itself, to terminate).
    pub fn set_next(&mut self, next: u64) -> Result<()> {
        let mut stream = self.io.stream();
        stream.seek_p(SeekFrom::Start(self.offset + 4))?;
        stream.write_u64(next)?;
        self.next = next;
        Ok(())
    }

    /// Shrink (or grow, during chain repair) the valid-byte count.
    pub fn set_bytes_written(&mut self, bytes: u32) -> Result<()> {
        let mut stream = self.io.stream();
        stream.seek_p(SeekFrom::Start(self.offset))?;
        stream.write_u32(bytes)?;
        self.bytes_written = bytes;
        Ok(())
    }

    /// Set this block's bit in the volume bitmap.
    pub fn register_with_bitmap(&self) -> Result<()> {
        let mut stream = self.io.stream();
        self.io.bitmap().mark_used(&mut stream, self.index)
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Number of valid payload bytes.
    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    /// The valid-byte count as it was when the block was opened.
    pub fn initial_bytes_written(&self) -> u32 {
        self.initial_bytes_written
    }

    /// Image byte offset of the block start.
    pub fn block_offset(&self) -> u64 {
        self.offset
    }

    /// True if this block terminates its chain.
    pub fn is_terminal(&self) -> bool {
        self.next == self.index
    }
}
