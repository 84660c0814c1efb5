use std::fmt;

use super::linker::LibraryHandle;

/// Handle of a loaded module: the base address of its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(u64);

impl ModuleHandle {
    pub const fn new(base: u64) -> Self {
        Self(base)
    }

    pub const fn base(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Identity of the file an image was mapped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A PE file mapped section by section.
    Native,
    /// Headers synthesized for a shared object.
    Synthesized,
}

/// Metadata handed back to callers of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub kind: ImageKind,
    pub machine: u16,
    /// Absolute entry point, zero when the image has none.
    pub entry_point: u64,
    pub size_of_image: u64,
    /// Set when the image was built for the 32-on-64 profile.
    pub is_hybrid: bool,
}

/// A builtin module as tracked by the registry.
///
/// A module is either file-backed (`identity` set) or backed by a shared
/// object (`handle` set). It may additionally carry a native side: a second
/// shared object with its own synthesized image and an init entry point.
#[derive(Debug, Clone)]
pub struct BuiltinModule {
    pub module: ModuleHandle,
    pub identity: Option<FileId>,
    pub handle: Option<LibraryHandle>,
    pub unix_handle: Option<LibraryHandle>,
    pub unix_module: Option<ModuleHandle>,
    pub unix_entry: Option<u64>,
    pub image: ImageInfo,
    /// Init routines have run.
    pub initialized: bool,
    /// Address-space regions owned by this module, released on unload.
    pub regions: Vec<u64>,
}

impl BuiltinModule {
    pub(crate) fn new(
        module: ModuleHandle,
        identity: Option<FileId>,
        handle: Option<LibraryHandle>,
        image: ImageInfo,
        regions: Vec<u64>,
    ) -> Self {
        Self {
            module,
            identity,
            handle,
            unix_handle: None,
            unix_module: None,
            unix_entry: None,
            image,
            initialized: false,
            regions,
        }
    }
}
