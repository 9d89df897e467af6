//! Positional byte transformers.
//!
//! Every byte written to the image is enciphered as a function of its
//! absolute image offset, so an arbitrary sub-range can be deciphered
//! without reading its neighbours. The [`ChaCha20Transformer`] gets this
//! by seeking the keystream to the target offset before applying it; the
//! [`NullTransformer`] is the identity, used for plaintext images and in
//! tests where crypto would only add noise.

use crate::error::{CofferError, Result};
use crate::header::CipherParams;
use argon2::Argon2;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use std::sync::Arc;

/// Progress callback invoked with a running byte count during long
/// transforms. Advisory only; it cannot abort the operation.
pub type CipherProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Which transformer an image is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherVariant {
    /// Pass-through; bytes land on disk as-is.
    None,
    /// ChaCha20 keyed by Argon2id over the passphrase.
    ChaCha20,
}

/// Key material and variant selection for one image.
#[derive(Clone)]
pub struct EncryptionProps {
    pub password: String,
    pub params: CipherParams,
    pub variant: CipherVariant,
    pub progress: Option<CipherProgress>,
}

impl EncryptionProps {
    pub fn new(password: &str, params: CipherParams, variant: CipherVariant) -> Self {
        EncryptionProps {
            password: password.to_string(),
            params,
            variant,
            progress: None,
        }
    }
}

/// A stateless-per-key positional cipher.
///
/// The contract: `decrypt(encrypt(x, o), o) == x` for every buffer `x` and
/// image offset `o`, with no dependence on surrounding bytes. `init` runs
/// the key derivation and is the only fallible step; `encrypt`/`decrypt`
/// are infallible once initialised.
pub trait ByteTransformer: Send {
    fn init(&mut self) -> Result<()>;

    fn encrypt(&mut self, input: &[u8], output: &mut [u8], offset: u64);

    fn decrypt(&mut self, input: &[u8], output: &mut [u8], offset: u64);

    fn register_progress(&mut self, callback: CipherProgress);
}

/// Build the transformer selected by `props`. The caller still has to
/// `init` it (the image stream does this when it opens).
pub fn build_transformer(props: &EncryptionProps) -> Box<dyn ByteTransformer> {
    match props.variant {
        CipherVariant::None => Box::new(NullTransformer::new(props.progress.clone())),
        CipherVariant::ChaCha20 => Box::new(ChaCha20Transformer::new(props)),
    }
}

/// Identity transformer.
pub struct NullTransformer {
    progress: Option<CipherProgress>,
}

impl NullTransformer {
    pub fn new(progress: Option<CipherProgress>) -> Self {
        NullTransformer { progress }
    }
}

impl ByteTransformer for NullTransformer {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn encrypt(&mut self, input: &[u8], output: &mut [u8], _offset: u64) {
        output.copy_from_slice(input);
        if let Some(cb) = &self.progress {
            cb(output.len() as u64);
        }
    }

    fn decrypt(&mut self, input: &[u8], output: &mut [u8], _offset: u64) {
        output.copy_from_slice(input);
        if let Some(cb) = &self.progress {
            cb(output.len() as u64);
        }
    }

    fn register_progress(&mut self, callback: CipherProgress) {
        self.progress = Some(callback);
    }
}

/// Keystream chunk between progress reports.
const PROGRESS_CHUNK: usize = 64 * 1024;

/// ChaCha20 keyed by Argon2id(passphrase, salt); the keystream is sought to
/// the absolute image offset of each transform, which is what makes the
/// cipher positional.
pub struct ChaCha20Transformer {
    password: String,
    params: CipherParams,
    progress: Option<CipherProgress>,
    cipher: Option<ChaCha20>,
}

impl ChaCha20Transformer {
    pub fn new(props: &EncryptionProps) -> Self {
        ChaCha20Transformer {
            password: props.password.clone(),
            params: props.params,
            progress: props.progress.clone(),
            cipher: None,
        }
    }

    fn apply(&mut self, input: &[u8], output: &mut [u8], offset: u64) {
        output.copy_from_slice(input);
        let cipher = self
            .cipher
            .as_mut()
            .expect("transformer used before init()");
        cipher.seek(offset);
        let mut done = 0u64;
        for chunk in output.chunks_mut(PROGRESS_CHUNK) {
            cipher.apply_keystream(chunk);
            done += chunk.len() as u64;
            if let Some(cb) = &self.progress {
                cb(done);
            }
        }
    }
}

impl ByteTransformer for ChaCha20Transformer {
    fn init(&mut self) -> Result<()> {
        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(self.password.as_bytes(), &self.params.salt(), &mut key)
            .map_err(|e| CofferError::CipherInit(e.to_string()))?;
        let nonce = self.params.nonce();
        self.cipher = Some(ChaCha20::new((&key).into(), (&nonce).into()));
        Ok(())
    }

    fn encrypt(&mut self, input: &[u8], output: &mut [u8], offset: u64) {
        self.apply(input, output, offset);
    }

    fn decrypt(&mut self, input: &[u8], output: &mut [u8], offset: u64) {
        // XOR stream cipher: decryption is the same keystream application.
        self.apply(input, output, offset);
    }

    fn register_progress(&mut self, callback: CipherProgress) {
        self.progress = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn chacha() -> ChaCha20Transformer {
        let params = CipherParams { iv: [11, 22, 33, 44] };
        let props = EncryptionProps::new("letmein", params, CipherVariant::ChaCha20);
        let mut t = ChaCha20Transformer::new(&props);
        t.init().unwrap();
        t
    }

    #[test]
    fn test_null_round_trip() {
        let mut t = NullTransformer::new(None);
        let plain = b"hello world";
        let mut enc = vec![0u8; plain.len()];
        let mut dec = vec![0u8; plain.len()];
        t.encrypt(plain, &mut enc, 99);
        assert_eq!(&enc, plain);
        t.decrypt(&enc, &mut dec, 99);
        assert_eq!(&dec, plain);
    }

    #[test]
    fn test_chacha_round_trip() {
        let mut t = chacha();
        let plain: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let mut enc = vec![0u8; plain.len()];
        let mut dec = vec![0u8; plain.len()];
        t.encrypt(&plain, &mut enc, 1234);
        assert_ne!(enc, plain);
        t.decrypt(&enc, &mut dec, 1234);
        assert_eq!(dec, plain);
    }

    #[test]
    fn test_chacha_is_positional() {
        // Decrypting a sub-range with the sub-range's own offset must match
        // the corresponding slice of the full decryption.
        let mut t = chacha();
        let plain: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();
        let mut enc = vec![0u8; plain.len()];
        t.encrypt(&plain, &mut enc, 5000);

        let mut slice = vec![0u8; 100];
        t.decrypt(&enc[300..400], &mut slice, 5000 + 300);
        assert_eq!(&slice, &plain[300..400]);
    }

    #[test]
    fn test_offset_changes_ciphertext() {
        let mut t = chacha();
        let plain = [0x5au8; 64];
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        t.encrypt(&plain, &mut a, 0);
        t.encrypt(&plain, &mut b, 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_passwords_differ() {
        let params = CipherParams { iv: [1, 2, 3, 4] };
        let mut a = ChaCha20Transformer::new(&EncryptionProps::new(
            "alpha",
            params,
            CipherVariant::ChaCha20,
        ));
        let mut b = ChaCha20Transformer::new(&EncryptionProps::new(
            "bravo",
            params,
            CipherVariant::ChaCha20,
        ));
        a.init().unwrap();
        b.init().unwrap();
        let plain = [1u8; 32];
        let (mut ca, mut cb) = ([0u8; 32], [0u8; 32]);
        a.encrypt(&plain, &mut ca, 0);
        b.encrypt(&plain, &mut cb, 0);
        assert_ne!(ca, cb);
    }

    #[test]
    fn test_progress_reported() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let mut t = chacha();
        t.register_progress(Arc::new(move |n| {
            seen.store(n, Ordering::SeqCst);
        }));
        let plain = vec![0u8; 1000];
        let mut enc = vec![0u8; 1000];
        t.encrypt(&plain, &mut enc, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }
}
