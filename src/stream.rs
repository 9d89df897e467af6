//! The ciphered container image stream.
//!
//! One long-lived handle on the host image file, with independent read and
//! write cursors. Every read deciphers and every write enciphers at the
//! absolute image offset of the bytes involved, so no layer above this one
//! ever sees ciphertext. A failed host operation poisons the cursor it was
//! using (it becomes `-1`); [`ImageStream::clear`] resets poisoned cursors.

use crate::cipher::ByteTransformer;
use crate::error::{CofferError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct ImageStream {
    file: File,
    transformer: Box<dyn ByteTransformer>,
    gpos: i64,
    ppos: i64,
}

fn poisoned() -> CofferError {
    CofferError::Io(std::io::Error::other("image stream cursor poisoned"))
}

impl ImageStream {
    /// Open the image and initialise the transformer (this is where the
    /// key derivation runs).
    pub fn open<P: AsRef<Path>>(path: P, mut transformer: Box<dyn ByteTransformer>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        transformer.init()?;
        Ok(ImageStream {
            file,
            transformer,
            gpos: 0,
            ppos: 0,
        })
    }

    /// Read `buf.len()` bytes at the read cursor, deciphering in place.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.gpos < 0 {
            return Err(poisoned());
        }
        let start = self.gpos as u64;
        let mut raw = vec![0u8; buf.len()];
        let result = self
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| self.file.read_exact(&mut raw));
        if let Err(e) = result {
            self.gpos = -1;
            return Err(e.into());
        }
        self.gpos += buf.len() as i64;
        self.transformer.decrypt(&raw, buf, start);
        Ok(())
    }

    /// Write `buf` at the write cursor, enciphering at its image offset.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.ppos < 0 {
            return Err(poisoned());
        }
        let start = self.ppos as u64;
        let mut enciphered = vec![0u8; buf.len()];
        self.transformer.encrypt(buf, &mut enciphered, start);
        let result = self
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| self.file.write_all(&enciphered));
        if let Err(e) = result {
            self.ppos = -1;
            return Err(e.into());
        }
        self.ppos += buf.len() as i64;
        Ok(())
    }

    /// Move the read cursor. A poisoned cursor refuses to move until
    /// [`ImageStream::clear`] resets it.
    pub fn seek_g(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.gpos < 0 {
            return Err(poisoned());
        }
        match self.resolve(pos, self.gpos) {
            Ok(target) => {
                self.gpos = target;
                Ok(target as u64)
            }
            Err(e) => {
                self.gpos = -1;
                Err(e)
            }
        }
    }

    /// Move the write cursor. A poisoned cursor refuses to move until
    /// [`ImageStream::clear`] resets it.
    pub fn seek_p(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.ppos < 0 {
            return Err(poisoned());
        }
        match self.resolve(pos, self.ppos) {
            Ok(target) => {
                self.ppos = target;
                Ok(target as u64)
            }
            Err(e) => {
                self.ppos = -1;
                Err(e)
            }
        }
    }

    fn resolve(&self, pos: SeekFrom, current: i64) -> Result<i64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => current + d,
            SeekFrom::End(d) => {
                let len = match self.file.metadata() {
                    Ok(meta) => meta.len() as i64,
                    Err(e) => return Err(e.into()),
                };
                len + d
            }
        };
        if target < 0 {
            return Err(CofferError::OutOfBounds {
                pos: 0,
                limit: u64::MAX,
            });
        }
        Ok(target)
    }

    pub fn tell_g(&self) -> i64 {
        self.gpos
    }

    pub fn tell_p(&self) -> i64 {
        self.ppos
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    /// Flush and sync the host file. Idempotent; after a successful return
    /// everything written so far is durable on a well-behaved host.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// True if either cursor has been poisoned by a failed host operation.
    pub fn bad(&self) -> bool {
        self.gpos < 0 || self.ppos < 0
    }

    /// Reset poisoned cursors to the start of the image.
    pub fn clear(&mut self) {
        if self.gpos < 0 {
            self.gpos = 0;
        }
        if self.ppos < 0 {
            self.ppos = 0;
        }
    }
}
