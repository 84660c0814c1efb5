#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pebridge::image::format::{
    self, directory, export_directory as ed, import_descriptor as id, nt, optional,
    OptionalLayout, BUILTIN_SIGNATURE,
};
use pebridge::loader::{
    DynamicLinker, Error, FileId, FileSystem, LibraryHandle, Loader, LoaderConfig,
    NT_HEADER_SYMBOL, UNIX_INIT_SYMBOL,
};
use pebridge::memory::ImageView;
use pebridge::paths::SearchPaths;
use pebridge::{AddressSpace, TargetProfile};

pub const PROFILE: TargetProfile = TargetProfile::X86_64;
pub const DLL_DIR: &str = "/lib/pebridge";

/// Offset of the header template inside its shared object mapping.
pub const TEMPLATE_OFFSET: u64 = 0x3000;
const TEMPLATE_SIZE: u64 = 0x2000;

// template-relative table layout
const EXPORTS: u64 = 0x400;
const FUNCTIONS: u64 = 0x440;
const NAMES: u64 = 0x480;
const ORDINALS: u64 = 0x4a0;
const EXPORT_DLL_NAME: u64 = 0x4c0;
const IMPORTS: u64 = 0x600;
const IMPORT_DLL_NAME: u64 = 0x640;
const LOOKUP: u64 = 0x680;
const THUNKS: u64 = 0x6c0;
const HINT_NAMES: u64 = 0x700;
const EXPORT_STRINGS: u64 = 0xa00;

/// Template-relative offset usable as a writable data slot.
pub const DATA_SLOT: u64 = 0xf00;

pub enum Import {
    Name(&'static str),
    Ordinal(u16),
}

/// A builtin shared object as the fake linker serves it.
pub struct SharedObject {
    /// Image base the template names; the synthesized module lands here.
    pub module: u64,
    pub exports: Vec<(&'static str, u64)>,
    pub imports: Option<(&'static str, Vec<Import>)>,
    /// Dynamic symbols besides the header template.
    pub symbols: Vec<(&'static str, u64)>,
    pub init: Vec<u64>,
    pub has_template: bool,
}

impl SharedObject {
    pub fn new(module: u64) -> Self {
        Self {
            module,
            exports: Vec::new(),
            imports: None,
            symbols: Vec::new(),
            init: Vec::new(),
            has_template: true,
        }
    }

    /// A native side with an init entry at `module + 0x1500`.
    pub fn native_side(module: u64) -> Self {
        let mut so = Self::new(module);
        so.symbols.push((UNIX_INIT_SYMBOL, module + 0x1500));
        so
    }

    pub fn template(&self) -> u64 {
        self.module + TEMPLATE_OFFSET
    }

    /// Sorted export names, the order the name table uses.
    pub fn sorted_exports(&self) -> Vec<(&'static str, u64)> {
        let mut exports = self.exports.clone();
        exports.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        exports
    }

    fn write(&self, space: &AddressSpace, profile: TargetProfile) {
        let template = self.template();
        space.map_fixed(template, TEMPLATE_SIZE).unwrap();
        if !self.has_template {
            return;
        }

        let layout = OptionalLayout::for_profile(profile);
        let t = ImageView::new(space, template, profile);
        let opt = nt::OPTIONAL_HEADER;
        let dirs = opt + layout.data_directory;
        let width = profile.pointer_width() as u64;

        t.write_u32(nt::SIGNATURE, format::PE_MAGIC).unwrap();
        t.write_u16(nt::FILE_HEADER, profile.machine()).unwrap();
        t.write_u16(opt + optional::MAGIC, layout.magic).unwrap();
        t.write_ptr(opt + optional::ADDRESS_OF_ENTRY_POINT, self.module + 0x1010).unwrap();
        t.write_u32(opt + optional::SECTION_ALIGNMENT, 0x1000).unwrap();
        t.write_u32(opt + optional::SIZE_OF_IMAGE, 0x3000).unwrap();
        t.write_u32(opt + layout.number_of_rva_and_sizes, 16).unwrap();
        if layout.is_64bit() {
            space.write_u64(t.addr(opt + layout.image_base), self.module).unwrap();
        } else {
            t.write_u32(opt + layout.image_base, self.module as u32).unwrap();
        }

        if !self.exports.is_empty() {
            let exports = self.sorted_exports();
            let count = exports.len() as u32;
            let entry = dirs + u64::from(directory::EXPORT) * 8;
            t.write_u32(entry, EXPORTS as u32).unwrap();
            t.write_u32(entry + 4, ed::SIZE as u32).unwrap();
            t.write_u32(EXPORTS + ed::NAME, EXPORT_DLL_NAME as u32).unwrap();
            t.write_u32(EXPORTS + ed::BASE, 1).unwrap();
            t.write_u32(EXPORTS + ed::NUMBER_OF_FUNCTIONS, count).unwrap();
            t.write_u32(EXPORTS + ed::NUMBER_OF_NAMES, count).unwrap();
            t.write_u32(EXPORTS + ed::ADDRESS_OF_FUNCTIONS, FUNCTIONS as u32).unwrap();
            t.write_u32(EXPORTS + ed::ADDRESS_OF_NAMES, NAMES as u32).unwrap();
            t.write_u32(EXPORTS + ed::ADDRESS_OF_NAME_ORDINALS, ORDINALS as u32).unwrap();
            t.write_bytes(EXPORT_DLL_NAME, b"builtin.dll\0").unwrap();
            for (i, (name, addr)) in exports.iter().enumerate() {
                let i = i as u64;
                let string = EXPORT_STRINGS + i * 0x20;
                t.write_ptr(FUNCTIONS + i * width, *addr).unwrap();
                t.write_u32(NAMES + i * 4, string as u32).unwrap();
                t.write_u16(ORDINALS + i * 2, i as u16).unwrap();
                t.write_bytes(string, &cstr(name)).unwrap();
            }
        }

        if let Some((dll, imports)) = &self.imports {
            let entry = dirs + u64::from(directory::IMPORT) * 8;
            t.write_u32(entry, IMPORTS as u32).unwrap();
            t.write_u32(entry + 4, 2 * id::SIZE as u32).unwrap();
            t.write_u32(IMPORTS + id::ORIGINAL_FIRST_THUNK, LOOKUP as u32).unwrap();
            t.write_u32(IMPORTS + id::NAME, IMPORT_DLL_NAME as u32).unwrap();
            t.write_u32(IMPORTS + id::FIRST_THUNK, THUNKS as u32).unwrap();
            t.write_bytes(IMPORT_DLL_NAME, &cstr(dll)).unwrap();
            for (i, import) in imports.iter().enumerate() {
                let i = i as u64;
                let raw = match import {
                    Import::Name(name) => {
                        let record = HINT_NAMES + i * 0x20;
                        t.write_u16(record, 0).unwrap();
                        t.write_bytes(record + 2, &cstr(name)).unwrap();
                        record
                    }
                    Import::Ordinal(ordinal) => profile.ordinal_flag() | u64::from(*ordinal),
                };
                t.write_ptr(LOOKUP + i * width, raw).unwrap();
                t.write_ptr(THUNKS + i * width, raw).unwrap();
            }
        }
    }
}

/// RVA, relative to the synthesized module, of import thunk slot `index`.
pub fn thunk_slot(profile: TargetProfile, index: u64) -> u64 {
    TEMPLATE_OFFSET + THUNKS + index * profile.pointer_width() as u64
}

fn cstr(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

struct Opened {
    path: PathBuf,
    refs: usize,
}

#[derive(Default)]
struct LinkerState {
    next: u64,
    objects: HashMap<PathBuf, SharedObject>,
    by_path: HashMap<PathBuf, LibraryHandle>,
    opened: HashMap<LibraryHandle, Opened>,
}

/// Serves [`SharedObject`]s by path, mapping their templates on open.
pub struct FakeLinker {
    space: Arc<AddressSpace>,
    profile: TargetProfile,
    state: Mutex<LinkerState>,
}

impl FakeLinker {
    pub fn new(space: Arc<AddressSpace>, profile: TargetProfile) -> Self {
        Self {
            space,
            profile,
            state: Mutex::new(LinkerState::default()),
        }
    }

    pub fn add(&self, path: impl Into<PathBuf>, object: SharedObject) {
        self.state.lock().unwrap().objects.insert(path.into(), object);
    }

    /// Open references held on `path`.
    pub fn refs(&self, path: impl AsRef<Path>) -> usize {
        let state = self.state.lock().unwrap();
        state
            .by_path
            .get(path.as_ref())
            .and_then(|handle| state.opened.get(handle))
            .map_or(0, |opened| opened.refs)
    }
}

impl DynamicLinker for FakeLinker {
    fn open(&self, path: &Path) -> pebridge::loader::Result<LibraryHandle> {
        let mut state = self.state.lock().unwrap();
        if let Some(&handle) = state.by_path.get(path) {
            if let Some(opened) = state.opened.get_mut(&handle) {
                opened.refs += 1;
            }
            return Ok(handle);
        }
        let Some(object) = state.objects.get(path) else {
            return Err(Error::Io(io::Error::from(io::ErrorKind::NotFound)));
        };
        object.write(&self.space, self.profile);

        state.next += 1;
        let handle = LibraryHandle::new(state.next);
        state.by_path.insert(path.to_path_buf(), handle);
        state.opened.insert(
            handle,
            Opened {
                path: path.to_path_buf(),
                refs: 1,
            },
        );
        Ok(handle)
    }

    fn symbol(&self, handle: LibraryHandle, name: &str) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(&state.opened.get(&handle)?.path)?;
        if name == NT_HEADER_SYMBOL {
            return object.has_template.then(|| object.template());
        }
        object
            .symbols
            .iter()
            .find(|(symbol, _)| *symbol == name)
            .map(|(_, addr)| *addr)
    }

    fn close(&self, handle: LibraryHandle) {
        let mut state = self.state.lock().unwrap();
        let Some(opened) = state.opened.get_mut(&handle) else {
            return;
        };
        opened.refs -= 1;
        if opened.refs > 0 {
            return;
        }
        if let Some(opened) = state.opened.remove(&handle) {
            state.by_path.remove(&opened.path);
            if let Some(object) = state.objects.get(&opened.path) {
                self.space.unmap(object.template()).unwrap();
            }
        }
    }

    fn init_routines(&self, handle: LibraryHandle) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .opened
            .get(&handle)
            .and_then(|opened| state.objects.get(&opened.path))
            .map(|object| object.init.clone())
            .unwrap_or_default()
    }
}

/// Files keyed by path; paths sharing an inode are hard links.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, (Vec<u8>, FileId)>>,
    next_ino: Mutex<u64>,
}

impl MemFs {
    pub fn add(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) -> FileId {
        let mut ino = self.next_ino.lock().unwrap();
        *ino += 1;
        let id = FileId { dev: 1, ino: *ino };
        self.files.lock().unwrap().insert(path.into(), (bytes, id));
        id
    }

    pub fn link(&self, from: impl AsRef<Path>, to: impl Into<PathBuf>) {
        let mut files = self.files.lock().unwrap();
        let entry = files[from.as_ref()].clone();
        files.insert(to.into(), entry);
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn stat(&self, path: &Path) -> io::Result<FileId> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(_, id)| *id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

/// First bytes of an ELF shared object of the given class, host byte order.
pub fn elf_header(class: u8) -> Vec<u8> {
    let data = if cfg!(target_endian = "big") { 2 } else { 1 };
    vec![0x7f, b'E', b'L', b'F', class, data, 1, 0]
}

pub const ELF64: u8 = 2;
pub const ELF32: u8 = 1;

/// A one-section PE32+ file. `builtin` controls the signature after the DOS
/// header.
pub fn pe_file(machine: u16, image_base: u64, builtin: bool) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x400];
    let put16 = |b: &mut Vec<u8>, at: usize, v: u16| b[at..at + 2].copy_from_slice(&v.to_le_bytes());
    let put32 = |b: &mut Vec<u8>, at: usize, v: u32| b[at..at + 4].copy_from_slice(&v.to_le_bytes());
    let put64 = |b: &mut Vec<u8>, at: usize, v: u64| b[at..at + 8].copy_from_slice(&v.to_le_bytes());

    let nt = 0x60;
    put16(&mut bytes, 0, format::DOS_MAGIC);
    put32(&mut bytes, 0x3c, nt as u32);
    if builtin {
        bytes[0x40..0x60].copy_from_slice(&BUILTIN_SIGNATURE);
    }
    put32(&mut bytes, nt, format::PE_MAGIC);

    let coff = nt + 4;
    put16(&mut bytes, coff, machine);
    put16(&mut bytes, coff + 2, 1);
    put16(&mut bytes, coff + 16, 240);
    put16(&mut bytes, coff + 18, 0x2022);

    let opt = coff + 20;
    put16(&mut bytes, opt, format::OPTIONAL_MAGIC_PE32_PLUS);
    put32(&mut bytes, opt + 4, 0x200);
    put32(&mut bytes, opt + 16, 0x1000);
    put32(&mut bytes, opt + 20, 0x1000);
    put64(&mut bytes, opt + 24, image_base);
    put32(&mut bytes, opt + 32, 0x1000);
    put32(&mut bytes, opt + 36, 0x200);
    put16(&mut bytes, opt + 48, 6);
    put32(&mut bytes, opt + 56, 0x2000);
    put32(&mut bytes, opt + 60, 0x200);
    put16(&mut bytes, opt + 68, 3);
    put32(&mut bytes, opt + 108, 16);

    let section = opt + 240;
    bytes[section..section + 5].copy_from_slice(b".text");
    put32(&mut bytes, section + 8, 0x100);
    put32(&mut bytes, section + 12, 0x1000);
    put32(&mut bytes, section + 16, 0x200);
    put32(&mut bytes, section + 20, 0x200);
    put32(&mut bytes, section + 36, 0x6000_0020);

    bytes[0x200..0x204].copy_from_slice(&[0xc3, 0x90, 0x90, 0x90]);
    bytes
}

pub type TestLoader = Loader<Arc<FakeLinker>, Arc<MemFs>>;

pub struct Fixture {
    pub space: Arc<AddressSpace>,
    pub linker: Arc<FakeLinker>,
    pub fs: Arc<MemFs>,
}

impl Fixture {
    pub fn new() -> Self {
        let space = Arc::new(AddressSpace::new());
        Self {
            linker: Arc::new(FakeLinker::new(space.clone(), PROFILE)),
            fs: Arc::new(MemFs::default()),
            space,
        }
    }

    /// Register a builtin shared object `<dir>/<name>.so`, with the ELF
    /// header the architecture check reads.
    pub fn add_shared(&self, dir: &str, name: &str, object: SharedObject) {
        let path = PathBuf::from(dir).join(format!("{name}.so"));
        self.fs.add(&path, elf_header(ELF64));
        self.linker.add(path, object);
    }

    pub fn config(&self, dirs: &[&str]) -> LoaderConfig {
        LoaderConfig::new(PROFILE, SearchPaths::with_dirs(dirs.iter().map(PathBuf::from)))
    }

    pub fn loader(&self, dirs: &[&str]) -> TestLoader {
        self.loader_with(self.config(dirs))
    }

    pub fn loader_with(&self, config: LoaderConfig) -> TestLoader {
        Loader::new(self.space.clone(), self.linker.clone(), self.fs.clone(), config)
    }
}
