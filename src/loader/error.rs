use std::path::PathBuf;

use thiserror::Error as ThisError;

use crate::image::ImageError;
use crate::memory::MemoryError;
use crate::profile::TargetProfile;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("builtin module not found")]
    NotFound,

    #[error("{path} is not built for the {profile} profile")]
    ArchitectureMismatch { path: PathBuf, profile: TargetProfile },

    #[error("out of memory")]
    OutOfMemory,

    #[error("{library} does not export required symbol {symbol}")]
    MissingRequiredSymbol { library: PathBuf, symbol: &'static str },

    #[error("module {module} is importing {import}")]
    ForeignImportSource { module: String, import: String },

    #[error("failed to load shared library {0}")]
    ProcedureNotFound(PathBuf),

    #[error("invalid image format: {0}")]
    InvalidImageFormat(String),

    #[error("no loaded module at {0:#x}")]
    InvalidHandle(u64),

    #[error("module {module:#x} already has a native side that is not {path}")]
    NativeSideConflict { module: u64, path: PathBuf },

    #[error("core runtime is not loaded")]
    CoreRuntimeMissing,

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pe parse error: {0}")]
    Parsing(#[from] goblin::error::Error),
}

impl Error {
    /// Search keeps going on these.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::OutOfMemory { .. } => Error::OutOfMemory,
            ImageError::InvalidTemplate(reason) => Error::InvalidImageFormat(reason),
            ImageError::Memory(e) => Error::Memory(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
