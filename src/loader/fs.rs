//! Filesystem capability used while searching for builtins.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use super::module::FileId;

pub trait FileSystem {
    /// Whole contents of the file at `path`.
    fn open(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Device and inode of the file at `path`.
    fn stat(&self, path: &Path) -> io::Result<FileId>;

    /// At most `len` bytes from the start of the file.
    fn read_header(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        let mut bytes = self.open(path)?;
        bytes.truncate(len);
        Ok(bytes)
    }
}

impl<T: FileSystem + ?Sized> FileSystem for Arc<T> {
    fn open(&self, path: &Path) -> io::Result<Vec<u8>> {
        (**self).open(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileId> {
        (**self).stat(path)
    }

    fn read_header(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        (**self).read_header(path, len)
    }
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFileSystem;

impl FileSystem for HostFileSystem {
    fn open(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileId> {
        let meta = fs::metadata(path)?;
        Ok(FileId {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn read_header(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        use std::io::Read;

        let mut header = Vec::with_capacity(len);
        fs::File::open(path)?.take(len as u64).read_to_end(&mut header)?;
        Ok(header)
    }
}
