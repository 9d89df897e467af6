//! The shared core-IO handle.
//!
//! One `CoreIo` per open image: path, block count, key material, and the
//! single ciphered stream every entry and bitmap update goes through. The
//! handle is shared by `Arc` among all entries opened from it; the stream
//! sits behind a mutex because callers serialise themselves (the container
//! has no internal concurrency), and the mutex makes that rule enforceable
//! rather than advisory.

use crate::bitmap::VolumeBitmap;
use crate::cipher::{build_transformer, CipherVariant, EncryptionProps};
use crate::error::Result;
use crate::header::{self, Header};
use crate::stream::ImageStream;
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub type SharedCoreIo = Arc<CoreIo>;

pub struct CoreIo {
    path: PathBuf,
    blocks: u64,
    props: EncryptionProps,
    stream: Mutex<ImageStream>,
}

impl CoreIo {
    /// Open an existing image with a passphrase.
    pub fn open<P: AsRef<Path>>(
        path: P,
        password: &str,
        variant: CipherVariant,
    ) -> Result<SharedCoreIo> {
        let params = header::read_params(&path)?;
        Self::open_with(path, EncryptionProps::new(password, params, variant))
    }

    /// Open an existing image with fully specified encryption properties
    /// (used when the caller wants a progress callback attached).
    pub fn open_with<P: AsRef<Path>>(path: P, props: EncryptionProps) -> Result<SharedCoreIo> {
        let path = path.as_ref().to_path_buf();
        let transformer = build_transformer(&props);
        let mut stream = ImageStream::open(&path, transformer)?;
        let header = Header::read(&mut stream)?;
        let host_len = std::fs::metadata(&path)?.len();
        if header::image_len(header.blocks) != host_len {
            // A wrong key deciphers the block count to garbage; the length
            // cross-check catches that as well as truncated images.
            return Err(crate::error::CofferError::InvalidHeader(format!(
                "block count {} implies {} bytes, image is {}",
                header.blocks,
                header::image_len(header.blocks),
                host_len
            )));
        }
        debug!(blocks = header.blocks, "opened coffer image");
        Ok(Arc::new(CoreIo {
            path,
            blocks: header.blocks,
            props,
            stream: Mutex::new(stream),
        }))
    }

    /// Lock and return the shared image stream.
    pub fn stream(&self) -> MutexGuard<'_, ImageStream> {
        self.stream.lock()
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn props(&self) -> &EncryptionProps {
        &self.props
    }

    /// A bitmap view sized to this image.
    pub fn bitmap(&self) -> VolumeBitmap {
        VolumeBitmap::new(self.blocks)
    }
}
