//! The file entry: a seekable byte stream over a chain of blocks.
//!
//! An entry owns nothing on disk; it is a cursor over a chain whose blocks
//! it caches in memory as it opens them. Opening an existing entry walks
//! the whole chain (with cycle detection) to recover the file size; from
//! then on the byte position is the only cursor state, and the block
//! ordinal and intra-block offset are derived from it on demand.
//!
//! Writing has two sub-modes chosen by comparing the position with the
//! file size. At the end of the file a write appends: it fills the tail
//! block, allocating and linking a fresh block from the volume bitmap each
//! time the tail fills. Before the end it overwrites in place without
//! growing any block's valid-byte count, and switches to appending the
//! moment it crosses the old size.

use crate::block::FileBlock;
use crate::coreio::SharedCoreIo;
use crate::error::{CofferError, Result};
use crate::header::BLOCK_PAYLOAD;
use std::collections::HashSet;
use std::io::SeekFrom;

/// How an entry is opened. Writes are rejected under `Read`; reads are
/// legal in every mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenDisposition {
    /// Read-only; the position starts at 0.
    Read,
    /// Append at the end; the position starts at the file size.
    Append,
    /// Replace content: the position starts at 0, writes overwrite in
    /// place, and flushing truncates the file to the current position.
    AppendOverwrite,
    /// Allocate a fresh chain; the entry starts empty.
    CreateNew,
}

impl OpenDisposition {
    fn writable(self) -> bool {
        !matches!(self, OpenDisposition::Read)
    }
}

/// Callback invoked with the new file size whenever it changes, so the
/// parent directory's metadata cache can follow along.
pub type SizeCallback = Box<dyn FnMut(u64)>;

pub struct FileEntry {
    io: SharedCoreIo,
    name: String,
    file_size: u64,
    blocks: Vec<FileBlock>,
    start_block: u64,
    disposition: OpenDisposition,
    pos: u64,
    size_callback: Option<SizeCallback>,
}

impl FileEntry {
    /// Create a new entry with a freshly allocated chain.
    pub fn create(io: &SharedCoreIo, name: &str) -> Result<Self> {
        let start = {
            let mut stream = io.stream();
            io.bitmap().first_free(&mut stream)?
        };
        let block = FileBlock::create(io, start, start)?;
        Ok(FileEntry {
            io: io.clone(),
            name: name.to_string(),
            file_size: 0,
            blocks: vec![block],
            start_block: start,
            disposition: OpenDisposition::CreateNew,
            pos: 0,
            size_callback: None,
        })
    }

    /// Open an existing entry at its start block. `CreateNew` ignores
    /// `start_block` and allocates a fresh chain instead.
    pub fn open(
        io: &SharedCoreIo,
        name: &str,
        start_block: u64,
        disposition: OpenDisposition,
    ) -> Result<Self> {
        if matches!(disposition, OpenDisposition::CreateNew) {
            return Self::create(io, name);
        }
        let (blocks, file_size) = walk_chain(io, start_block)?;
        let pos = match disposition {
            OpenDisposition::Append => file_size,
            _ => 0,
        };
        Ok(FileEntry {
            io: io.clone(),
            name: name.to_string(),
            file_size,
            blocks,
            start_block,
            disposition,
            pos,
            size_callback: None,
        })
    }

    pub fn filename(&self) -> &str {
        &self.name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn start_block_index(&self) -> u64 {
        self.start_block
    }

    pub fn set_size_callback(&mut self, callback: SizeCallback) {
        self.size_callback = Some(callback);
    }

    /// Read up to `buf.len()` bytes at the current position, crossing
    /// block boundaries as needed. Returns the number of bytes read,
    /// which is short only at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let wanted = (buf.len() as u64).min(self.file_size - self.pos) as usize;
        let mut done = 0;
        while done < wanted {
            let ordinal = (self.pos / BLOCK_PAYLOAD as u64) as usize;
            let offset = self.pos % BLOCK_PAYLOAD as u64;
            let block = &self.blocks[ordinal];
            let available = block.bytes_written() as u64 - offset;
            let chunk = ((wanted - done) as u64).min(available) as usize;
            block.read(&mut buf[done..done + chunk], offset)?;
            self.pos += chunk as u64;
            done += chunk;
        }
        Ok(wanted)
    }

    /// Write `buf` at the current position. Appends past the end of the
    /// chain, overwrites in place before it, and switches from the latter
    /// to the former at the boundary. Returns `buf.len()`.
    ///
    /// A failure partway (out of space, host I/O) leaves the chunks that
    /// already committed in place; the size callback still fires for
    /// whatever growth actually happened before the error.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.disposition.writable() {
            return Err(CofferError::ReadOnly);
        }
        let size_before = self.file_size;
        let result = self.write_chunks(buf);
        if self.file_size != size_before {
            self.notify_size();
        }
        result?;
        Ok(buf.len())
    }

    fn write_chunks(&mut self, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = if self.pos == self.file_size {
                self.append_chunk(&buf[done..])?
            } else {
                self.overwrite_chunk(&buf[done..])?
            };
            done += chunk;
        }
        Ok(())
    }

    fn append_chunk(&mut self, buf: &[u8]) -> Result<usize> {
        let tail_full = self
            .blocks
            .last()
            .map_or(true, |b| b.bytes_written() as usize == BLOCK_PAYLOAD);
        if tail_full {
            self.push_new_block()?;
        }
        let tail = self.blocks.len() - 1;
        let used = self.blocks[tail].bytes_written() as u64;
        let space = BLOCK_PAYLOAD as u64 - used;
        let chunk = (buf.len() as u64).min(space) as usize;
        self.blocks[tail].write(&buf[..chunk], used)?;
        self.pos += chunk as u64;
        self.file_size += chunk as u64;
        Ok(chunk)
    }

    fn overwrite_chunk(&mut self, buf: &[u8]) -> Result<usize> {
        let ordinal = (self.pos / BLOCK_PAYLOAD as u64) as usize;
        let offset = self.pos % BLOCK_PAYLOAD as u64;
        let block = &self.blocks[ordinal];
        let in_place = block.bytes_written() as u64 - offset;
        let chunk = (buf.len() as u64).min(in_place) as usize;
        block.overwrite(&buf[..chunk], offset)?;
        self.pos += chunk as u64;
        Ok(chunk)
    }

    /// Allocate the next block of the chain and link the old tail to it.
    fn push_new_block(&mut self) -> Result<()> {
        let index = {
            let mut stream = self.io.stream();
            self.io.bitmap().first_free(&mut stream)?
        };
        let block = FileBlock::create(&self.io, index, index)?;
        match self.blocks.last_mut() {
            Some(tail) => tail.set_next(index)?,
            None => self.start_block = index,
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Seek to an absolute or relative position in `[0, file_size]`.
    /// Seeking to exactly the file size is legal and positions at the end.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.file_size as i64 + delta,
        };
        if target < 0 || target as u64 > self.file_size {
            return Err(CofferError::OutOfBounds {
                pos: target.max(0) as u64,
                limit: self.file_size,
            });
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Shrink the file to `new_size`. The block holding the new last byte
    /// becomes the tail (self-terminated, count adjusted); every later
    /// block is freed in the bitmap and dropped from the cache. A chain is
    /// never empty, so truncating to zero keeps the start block with a
    /// zero count.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if !self.disposition.writable() {
            return Err(CofferError::ReadOnly);
        }
        if new_size > self.file_size {
            return Err(CofferError::OutOfBounds {
                pos: new_size,
                limit: self.file_size,
            });
        }
        if new_size == self.file_size {
            return Ok(());
        }
        let keep = if new_size == 0 {
            1
        } else {
            ((new_size - 1) / BLOCK_PAYLOAD as u64 + 1) as usize
        };
        let tail_bytes = (new_size - (keep as u64 - 1) * BLOCK_PAYLOAD as u64) as u32;

        // Terminate the kept prefix on disk before any bit is cleared, so
        // an error at any point never leaves a freed block inside a live
        // chain. The failure mode left over is a leak: a block still
        // marked used that nothing references.
        let tail = keep - 1;
        self.blocks[tail].set_bytes_written(tail_bytes)?;
        let tail_index = self.blocks[tail].index();
        self.blocks[tail].set_next(tail_index)?;

        let doomed = self.blocks.split_off(keep);
        self.file_size = new_size;
        if self.pos > new_size {
            self.pos = new_size;
        }
        let result = self.release_bits(&doomed);
        self.notify_size();
        result
    }

    /// Release every block of the chain back to the bitmap. The chain
    /// metadata on disk is left as-is; the blocks are simply free and
    /// will be overwritten on reuse.
    ///
    /// The entry disowns its blocks before their bits are cleared: if
    /// freeing fails partway, the unfreed blocks stay marked (a leak the
    /// allocator will never hand out) rather than being claimed by a
    /// chain and free at the same time.
    pub fn unlink(&mut self) -> Result<()> {
        let doomed = std::mem::take(&mut self.blocks);
        self.file_size = 0;
        self.pos = 0;
        let result = self.release_bits(&doomed);
        self.notify_size();
        result
    }

    /// Flush the ciphered stream to the host. For `AppendOverwrite`
    /// entries this first truncates to the current position, which is
    /// what makes that disposition replace content rather than splice it.
    pub fn flush(&mut self) -> Result<()> {
        if matches!(self.disposition, OpenDisposition::AppendOverwrite) && self.pos < self.file_size
        {
            self.truncate(self.pos)?;
        }
        self.io.stream().flush()
    }

    /// Clear the bitmap bits of blocks the entry no longer claims. The
    /// caller has already dropped them from the in-memory chain.
    fn release_bits(&self, doomed: &[FileBlock]) -> Result<()> {
        let bitmap = self.io.bitmap();
        let mut stream = self.io.stream();
        for block in doomed {
            bitmap.mark_free(&mut stream, block.index())?;
        }
        Ok(())
    }

    fn notify_size(&mut self) {
        if let Some(callback) = self.size_callback.as_mut() {
            callback(self.file_size);
        }
    }
}

/// Walk a chain from its start block, collecting blocks and summing their
/// valid-byte counts. The walk is bounded by the image's block count and
/// refuses to revisit a block, so a corrupt `next` graph surfaces as
/// `BadChain` instead of a hang.
fn walk_chain(io: &SharedCoreIo, start: u64) -> Result<(Vec<FileBlock>, u64)> {
    let total = io.blocks();
    let mut blocks = Vec::new();
    let mut visited = HashSet::new();
    let mut size = 0u64;
    let mut index = start;
    loop {
        if blocks.len() as u64 >= total || !visited.insert(index) {
            return Err(CofferError::BadChain(index));
        }
        let block = FileBlock::open(io, index)?;
        size += block.bytes_written() as u64;
        let next = block.next_index();
        let terminal = block.is_terminal();
        blocks.push(block);
        if terminal {
            break;
        }
        index = next;
    }
    Ok((blocks, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherVariant;
    use crate::coreio::CoreIo;
    use crate::format::format_image;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn scratch_io(blocks: u64) -> (TempDir, SharedCoreIo) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.img");
        format_image(&path, blocks, "pw", CipherVariant::None).unwrap();
        let io = CoreIo::open(&path, "pw", CipherVariant::None).unwrap();
        (dir, io)
    }

    #[test]
    fn test_create_starts_empty_on_first_free_block() {
        let (_dir, io) = scratch_io(64);
        let entry = FileEntry::create(&io, "a.txt").unwrap();
        assert_eq!(entry.file_size(), 0);
        assert_eq!(entry.start_block_index(), 1);
        assert_eq!(entry.tell(), 0);
        assert_eq!(entry.filename(), "a.txt");
    }

    #[test]
    fn test_small_write_read_back() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"twelve bytes").unwrap();
        assert_eq!(entry.file_size(), 12);

        entry.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(entry.read(&mut buf).unwrap(), 12);
        assert_eq!(&buf, b"twelve bytes");
    }

    #[test]
    fn test_read_stops_at_end() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"abc").unwrap();
        entry.seek(SeekFrom::Start(1)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(entry.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn test_write_rejected_when_read_only() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"data").unwrap();
        entry.flush().unwrap();
        let start = entry.start_block_index();
        drop(entry);

        let mut entry = FileEntry::open(&io, "a.txt", start, OpenDisposition::Read).unwrap();
        assert!(matches!(entry.write(b"x"), Err(CofferError::ReadOnly)));
        assert!(matches!(entry.truncate(0), Err(CofferError::ReadOnly)));
    }

    #[test]
    fn test_seek_bounds() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"0123456789").unwrap();

        assert_eq!(entry.seek(SeekFrom::Start(10)).unwrap(), 10);
        assert_eq!(entry.seek(SeekFrom::End(-3)).unwrap(), 7);
        assert_eq!(entry.seek(SeekFrom::Current(2)).unwrap(), 9);
        assert!(matches!(
            entry.seek(SeekFrom::Start(11)),
            Err(CofferError::OutOfBounds { .. })
        ));
        assert!(matches!(
            entry.seek(SeekFrom::End(-11)),
            Err(CofferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_multi_block_write_allocates_chain() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        let data = vec![7u8; BLOCK_PAYLOAD * 2 + 10];
        entry.write(&data).unwrap();
        assert_eq!(entry.file_size(), data.len() as u64);

        entry.seek(SeekFrom::Start(0)).unwrap();
        let mut back = vec![0u8; data.len()];
        entry.read(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_overwrite_in_place_keeps_size() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"hello world").unwrap();
        entry.seek(SeekFrom::Start(6)).unwrap();
        entry.write(b"coffer").unwrap();
        assert_eq!(entry.file_size(), 12);

        entry.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 12];
        entry.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello coffer");
    }

    #[test]
    fn test_overwrite_crossing_into_append() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"aaaa").unwrap();
        entry.seek(SeekFrom::Start(2)).unwrap();
        entry.write(b"bbbb").unwrap();
        assert_eq!(entry.file_size(), 6);

        entry.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 6];
        entry.read(&mut buf).unwrap();
        assert_eq!(&buf, b"aabbbb");
    }

    #[test]
    fn test_truncate_frees_tail_blocks() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(&vec![1u8; BLOCK_PAYLOAD * 2 + 50]).unwrap();
        let used_before = {
            let mut stream = io.stream();
            io.bitmap().count_used(&mut stream).unwrap()
        };
        assert_eq!(used_before, 4); // root + 3 chain blocks

        entry.truncate(BLOCK_PAYLOAD as u64 + 1).unwrap();
        assert_eq!(entry.file_size(), BLOCK_PAYLOAD as u64 + 1);
        let used_after = {
            let mut stream = io.stream();
            io.bitmap().count_used(&mut stream).unwrap()
        };
        assert_eq!(used_after, 3); // root + 2 chain blocks

        entry.seek(SeekFrom::Start(0)).unwrap();
        let mut back = vec![0u8; BLOCK_PAYLOAD + 1];
        assert_eq!(entry.read(&mut back).unwrap(), BLOCK_PAYLOAD + 1);
        assert!(back.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_truncate_to_zero_keeps_start_block() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"some data").unwrap();
        entry.truncate(0).unwrap();
        assert_eq!(entry.file_size(), 0);
        assert_eq!(entry.start_block_index(), 1);

        let mut stream = io.stream();
        assert!(io.bitmap().is_in_use(&mut stream, 1).unwrap());
    }

    #[test]
    fn test_truncate_past_size_rejected() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"abc").unwrap();
        assert!(matches!(
            entry.truncate(4),
            Err(CofferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_size_callback_fires_on_changes() {
        let (_dir, io) = scratch_io(64);
        let seen = Arc::new(AtomicU64::new(u64::MAX));
        let sink = seen.clone();

        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.set_size_callback(Box::new(move |size| {
            sink.store(size, Ordering::SeqCst);
        }));

        entry.write(b"0123456789").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        entry.truncate(4).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);

        entry.unlink().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pure_overwrite_does_not_fire_callback() {
        let (_dir, io) = scratch_io(64);
        let fired = Arc::new(AtomicU64::new(0));
        let sink = fired.clone();

        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"0123456789").unwrap();
        entry.set_size_callback(Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        entry.seek(SeekFrom::Start(0)).unwrap();
        entry.write(b"xxxx").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_append_overwrite_truncates_on_flush() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(b"a rather long original body").unwrap();
        entry.flush().unwrap();
        let start = entry.start_block_index();
        drop(entry);

        let mut entry =
            FileEntry::open(&io, "a.txt", start, OpenDisposition::AppendOverwrite).unwrap();
        assert_eq!(entry.tell(), 0);
        entry.write(b"short").unwrap();
        entry.flush().unwrap();
        assert_eq!(entry.file_size(), 5);
        drop(entry);

        let mut entry = FileEntry::open(&io, "a.txt", start, OpenDisposition::Read).unwrap();
        assert_eq!(entry.file_size(), 5);
        let mut buf = [0u8; 5];
        entry.read(&mut buf).unwrap();
        assert_eq!(&buf, b"short");
    }

    #[test]
    fn test_bad_chain_detected() {
        let (_dir, io) = scratch_io(64);
        let mut entry = FileEntry::create(&io, "a.txt").unwrap();
        entry.write(&vec![0u8; BLOCK_PAYLOAD + 10]).unwrap();
        entry.flush().unwrap();

        // Corrupt the chain: point the second block back at the first.
        let start = entry.start_block_index();
        entry.blocks[1].set_next(start).unwrap();
        drop(entry);

        match FileEntry::open(&io, "a.txt", start, OpenDisposition::Read) {
            Err(CofferError::BadChain(at)) => assert_eq!(at, start),
            other => panic!("expected BadChain, got {:?}", other.map(|e| e.file_size())),
        }
    }
}
