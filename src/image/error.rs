use thiserror::Error as ThisError;

use crate::memory::MemoryError;

#[derive(ThisError, Debug)]
pub enum ImageError {
    #[error("cannot reserve {size:#x} byte(s) for image headers at {addr:#x}")]
    OutOfMemory { addr: u64, size: u64 },

    #[error("invalid header template: {0}")]
    InvalidTemplate(String),

    #[error("image memory error: {0}")]
    Memory(#[from] MemoryError),
}

pub type Result<T> = core::result::Result<T, ImageError>;
