use thiserror::Error;

#[derive(Error, Debug)]
pub enum CofferError {
    #[error("out of space: no free blocks available")]
    NoSpace,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt block chain at block {0}")]
    BadChain(u64),

    #[error("position {pos} out of bounds (limit {limit})")]
    OutOfBounds { pos: u64, limit: u64 },

    #[error("entry is opened read-only")]
    ReadOnly,

    #[error("cipher initialisation failed: {0}")]
    CipherInit(String),

    #[error("invalid image header: {0}")]
    InvalidHeader(String),
}

pub type Result<T> = std::result::Result<T, CofferError>;
