//! Coffer — an encrypted single-file container.
//!
//! A coffer image is one opaque file on the host that holds a grid of
//! fixed 512-byte blocks. Logical files thread their bytes across chains
//! of blocks; a volume bitmap in the image header tracks which blocks are
//! live; and every byte of the image is enciphered as a function of its
//! absolute offset, so random seeks decrypt exactly the range they need.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header                                       │
//! │   0..8    block count            (u64 LE)    │
//! │   8..16   root folder start block(u64 LE)    │
//! │   16..48  cipher IVs, stored clear           │
//! │   48..    volume bitmap, one bit per block   │
//! ├──────────────────────────────────────────────┤
//! │ Block region (aligned to 512)                │
//! │   each block:                                │
//! │     bytes_written (u32 LE)                   │
//! │     next block index (u64 LE)                │
//! │     payload (500 bytes)                      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A chain's last block points `next` at itself; that self-loop is the
//! terminator, so no block index is reserved as a null value.
//!
//! ## Example
//!
//! ```no_run
//! use coffer::{format_image, CipherVariant, CoreIo, FileEntry, OpenDisposition};
//! use std::io::SeekFrom;
//!
//! # fn main() -> coffer::Result<()> {
//! format_image("vault.img", 2048, "correct horse", CipherVariant::ChaCha20)?;
//! let io = CoreIo::open("vault.img", "correct horse", CipherVariant::ChaCha20)?;
//!
//! let mut entry = FileEntry::create(&io, "notes.txt")?;
//! entry.write(b"nobody reads this but me")?;
//! entry.flush()?;
//!
//! let start = entry.start_block_index();
//! let mut entry = FileEntry::open(&io, "notes.txt", start, OpenDisposition::Read)?;
//! entry.seek(SeekFrom::Start(7))?;
//! # Ok(())
//! # }
//! ```
//!
//! The directory layer (names, folders, FUSE mount) lives above this
//! crate; it consumes the file-entry surface and stores its own metadata
//! in chains of the same kind.

pub mod bitmap;
pub mod block;
pub mod cipher;
pub mod coreio;
pub mod error;
pub mod file;
pub mod format;
pub mod header;
pub mod stream;

pub use bitmap::VolumeBitmap;
pub use block::FileBlock;
pub use cipher::{ByteTransformer, CipherProgress, CipherVariant, EncryptionProps};
pub use coreio::{CoreIo, SharedCoreIo};
pub use error::{CofferError, Result};
pub use file::{FileEntry, OpenDisposition, SizeCallback};
pub use format::format_image;
pub use header::{CipherParams, Header, BLOCK_PAYLOAD, BLOCK_SIZE};
pub use stream::ImageStream;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
