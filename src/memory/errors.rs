use thiserror::Error as ThisError;
use vm_memory::{GuestMemoryError, mmap::FromRangesError};

#[derive(ThisError, Debug)]
pub enum MemoryError {
    #[error("access of {len} byte(s) at {addr:#x} is outside any mapped region")]
    Unmapped { addr: u64, len: usize },

    #[error("range {addr:#x}+{size:#x} overlaps an existing mapping")]
    Overlap { addr: u64, size: u64 },

    #[error("cannot reserve {size:#x} byte(s) at {addr:#x}")]
    OutOfMemory { addr: u64, size: u64 },

    #[error("no mapping starts at {addr:#x}")]
    NotMapped { addr: u64 },

    #[error("from ranges error: {0}")]
    FromRanges(#[from] FromRangesError),

    #[error("guest memory error: {0}")]
    Guest(#[from] GuestMemoryError),
}

pub type Result<T> = core::result::Result<T, MemoryError>;
