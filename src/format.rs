//! Image formatting.
//!
//! Lays down a fresh coffer image: clear cipher parameters, enciphered
//! header fields, a bitmap with block 0 reserved for the root folder, and
//! an enciphered-zero block region. Block 0 gets a fresh self-terminated
//! header so the directory layer finds an empty chain at the root pointer;
//! reserving it is also why the first user file lands on block 1.

use crate::cipher::{build_transformer, CipherVariant, EncryptionProps};
use crate::error::{CofferError, Result};
use crate::header::{
    self, blocks_offset, image_len, CipherParams, Header, BLOCK_SIZE, HEADER_FIXED,
};
use crate::stream::ImageStream;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::Path;
use tracing::debug;

/// Create (or truncate) the file at `path` and format it as a coffer
/// image of `blocks` blocks keyed by `password`.
pub fn format_image<P: AsRef<Path>>(
    path: P,
    blocks: u64,
    password: &str,
    variant: CipherVariant,
) -> Result<()> {
    if blocks == 0 {
        return Err(CofferError::InvalidHeader(
            "cannot format an image with zero blocks".to_string(),
        ));
    }
    let params = CipherParams::generate();

    {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(image_len(blocks))?;
        header::write_params(&mut file, &params)?;
        file.sync_all()?;
    }

    let props = EncryptionProps::new(password, params, variant);
    let mut stream = ImageStream::open(&path, build_transformer(&props))?;

    Header { blocks, root_block: 0 }.write(&mut stream)?;

    // Bitmap: everything free except block 0, reserved for the root folder.
    let mut map = vec![0u8; header::bitmap_len(blocks) as usize];
    map[0] = 1;
    stream.seek_p(SeekFrom::Start(HEADER_FIXED))?;
    stream.write(&map)?;

    // Enciphered-zero fill so every byte of the block region is valid
    // ciphertext for its offset.
    let zeros = [0u8; BLOCK_SIZE];
    stream.seek_p(SeekFrom::Start(blocks_offset(blocks)))?;
    for _ in 0..blocks {
        stream.write(&zeros)?;
    }

    // Root folder start block: empty, self-terminated.
    stream.seek_p(SeekFrom::Start(header::block_offset(0, blocks)))?;
    stream.write_u32(0)?;
    stream.write_u64(0)?;

    stream.flush()?;
    debug!(blocks, ?variant, "formatted coffer image");
    Ok(())
}
