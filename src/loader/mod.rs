//! Loading of builtin modules.
//!
//! A builtin is found by name in the search directories. Each candidate is
//! tried as a PE file carrying the builtin signature first, then as a shared
//! object (`<candidate>.so`) whose PE headers are synthesized from a template
//! it exports. A builtin may come with a native side, a second shared object
//! whose imports are bound against the core runtime.

pub mod arch;
pub mod error;
pub mod fs;
pub mod linker;
pub mod module;
pub mod registry;
pub mod runtime;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use goblin::pe::PE;
use log::{debug, error, trace, warn};

pub use error::{Error, Result};
pub use fs::{FileSystem, HostFileSystem};
pub use linker::{DynamicLinker, ElfLinker, LibraryHandle};
pub use module::{BuiltinModule, FileId, ImageInfo, ImageKind, ModuleHandle};
pub use registry::{Inserted, ModuleRegistry, UnixSide};
pub use runtime::{CoreRuntime, EntryPoints, SYSCALL_DISPATCHER_SLOT};

use crate::image::format::{directory, dos, nt, OptionalLayout, DATA_DIRECTORY_SIZE};
use crate::image::imports::{self, hint_name, ThunkEntry};
use crate::image::{
    build_synthetic_image, native, preferred_module_base, BuildOptions, ExportDirectory,
};
use crate::memory::{AddressSpace, ImageView, MemoryError};
use crate::paths::{unix_side_path, Origin, SearchPaths};
use crate::profile::TargetProfile;

/// Symbol of the header template exported by builtin shared objects.
pub const NT_HEADER_SYMBOL: &str = "__builtin_nt_header";
/// Init entry point of a native side.
pub const UNIX_INIT_SYMBOL: &str = "__builtin_init_unix_lib";
/// Init entry point of a native side under the 32-on-64 profile.
pub const HYBRID_UNIX_INIT_SYMBOL: &str = "__builtin_thunk_init_unix_lib";

/// Default name of the core runtime module.
pub const CORE_MODULE: &str = "ntdll.dll";

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub profile: TargetProfile,
    pub paths: SearchPaths,
    /// The only module builtins may import from.
    pub core_module: String,
    /// Stored into the core runtime's dispatcher slot when set.
    pub syscall_dispatcher: Option<u64>,
    pub build: BuildOptions,
}

impl LoaderConfig {
    pub fn new(profile: TargetProfile, paths: SearchPaths) -> Self {
        Self {
            profile,
            paths,
            core_module: CORE_MODULE.to_string(),
            syscall_dispatcher: None,
            build: BuildOptions::default(),
        }
    }

    /// Core module name without its `.dll` extension.
    pub fn core_stem(&self) -> &str {
        self.core_module
            .strip_suffix(".dll")
            .unwrap_or(&self.core_module)
    }
}

/// Outcome of a successful [`Loader::load_builtin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedBuiltin {
    pub module: ModuleHandle,
    /// Init entry of the native side, when one was attached.
    pub unix_entry: Option<u64>,
    pub image: ImageInfo,
    /// File the module was found at.
    pub path: PathBuf,
}

/// One row of an export listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: String,
    /// Biased ordinal, as importers see it.
    pub ordinal: u32,
    pub address: Option<u64>,
}

/// Process arguments handed to builtin init routines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessArgs {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

pub struct Loader<L, F> {
    space: Arc<AddressSpace>,
    linker: L,
    fs: F,
    config: LoaderConfig,
    registry: ModuleRegistry,
    core: RwLock<Option<CoreRuntime>>,
    /// Serializes searches, mapping and unloading.
    lock: Mutex<()>,
}

impl<L: DynamicLinker, F: FileSystem> Loader<L, F> {
    pub fn new(space: Arc<AddressSpace>, linker: L, fs: F, config: LoaderConfig) -> Self {
        Self {
            space,
            linker,
            fs,
            config,
            registry: ModuleRegistry::new(),
            core: RwLock::new(None),
            lock: Mutex::new(()),
        }
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn core_runtime(&self) -> Option<CoreRuntime> {
        self.core
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn view(&self, module: ModuleHandle) -> ImageView<'_> {
        ImageView::new(&self.space, module.base(), self.config.profile)
    }

    /// Find and load the builtin `name`, then try to attach its native side.
    ///
    /// Architecture mismatches in the search directories do not stop the
    /// search; they are reported only when nothing else was found.
    pub fn load_builtin(&self, name: &str) -> Result<LoadedBuiltin> {
        // names are matched bytewise, independent of any codepage
        if !name.is_ascii() {
            return Err(Error::NotFound);
        }
        let name = name.to_ascii_lowercase();
        let _guard = self.exclusive();

        let mut mismatch = None;
        let mut found = None;
        for candidate in self.config.paths.candidates(&name) {
            match self.try_builtin_file(&candidate.path) {
                Ok(loaded) => {
                    found = Some((loaded, candidate.path));
                    break;
                }
                Err(e) if e.is_not_found() => {}
                Err(e @ Error::ArchitectureMismatch { .. })
                    if candidate.origin == Origin::SearchPath =>
                {
                    trace!("{e}, continuing search");
                    mismatch = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let Some(((module, image), path)) = found else {
            warn!("cannot find builtin library for {name}");
            return Err(mismatch.unwrap_or(Error::NotFound));
        };

        let unix_entry = unix_side_path(&path, &name).and_then(|unix| {
            match self.attach_unix_side_locked(module, &unix) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    trace!("no native side for {name}: {e}");
                    None
                }
            }
        });

        debug!("loaded {name} at {module} from {}", path.display());
        Ok(LoadedBuiltin {
            module,
            unix_entry,
            image,
            path,
        })
    }

    /// Try `path` as a builtin PE file, then `path.so` as a builtin shared
    /// object.
    pub fn open_builtin_file(&self, path: &Path) -> Result<(ModuleHandle, ImageInfo)> {
        let _guard = self.exclusive();
        self.try_builtin_file(path)
    }

    fn try_builtin_file(&self, path: &Path) -> Result<(ModuleHandle, ImageInfo)> {
        match self.open_native_image(path) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }

        let mut so = OsString::from(path.as_os_str());
        so.push(".so");
        let so = PathBuf::from(so);

        let Ok(header) = self.fs.read_header(&so, arch::HEADER_LEN) else {
            return Err(Error::NotFound);
        };
        if !arch::check_library_arch(&header, self.config.profile) {
            return Err(Error::ArchitectureMismatch {
                path: so,
                profile: self.config.profile,
            });
        }
        self.open_shared_object(&so).map_err(|e| {
            error!("failed to load .so lib {}: {e}", so.display());
            Error::ProcedureNotFound(so)
        })
    }

    fn open_native_image(&self, path: &Path) -> Result<(ModuleHandle, ImageInfo)> {
        let bytes = match self.fs.open(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            // a file that exists but cannot be read ends the search
            Err(e) if self.fs.stat(path).is_ok() => return Err(e.into()),
            Err(_) => return Err(Error::NotFound),
        };

        let identity = self.fs.stat(path).ok();
        if let Some(existing) = identity.and_then(|id| self.registry.find_by_identity(id)) {
            trace!("{} is the same file as existing module {existing}", path.display());
            return self.describe(existing);
        }

        let pe = PE::parse(&bytes)
            .map_err(|e| Error::InvalidImageFormat(format!("{}: {e}", path.display())))?;
        let facts = native::inspect(&pe, &bytes);
        if !facts.is_builtin {
            warn!("{} found in the search path but not a builtin, ignoring", path.display());
            return Err(Error::NotFound);
        }
        if !self.config.profile.is_valid_machine(facts.machine) {
            trace!("{} is for arch {:#x}", path.display(), facts.machine);
            return Err(Error::ArchitectureMismatch {
                path: path.to_path_buf(),
                profile: self.config.profile,
            });
        }

        let mapped = native::map_image(&self.space, &pe, &bytes).map_err(out_of_memory)?;
        let image = ImageInfo {
            kind: ImageKind::Native,
            machine: facts.machine,
            entry_point: match facts.entry_point {
                0 => 0,
                rva => mapped.base + u64::from(rva),
            },
            size_of_image: mapped.size,
            is_hybrid: false,
        };
        let entry = BuiltinModule::new(
            ModuleHandle::new(mapped.base),
            identity,
            None,
            image.clone(),
            vec![mapped.base],
        );
        match self.registry.insert(entry) {
            Inserted::New(module) => Ok((module, image)),
            Inserted::Existing(module) => {
                let _ = self.space.unmap(mapped.base);
                self.describe(module)
            }
        }
    }

    /// Load a builtin shared object directly.
    pub fn load_shared_object(&self, path: &Path) -> Result<(ModuleHandle, ImageInfo)> {
        let _guard = self.exclusive();
        self.open_shared_object(path)
    }

    fn open_shared_object(&self, path: &Path) -> Result<(ModuleHandle, ImageInfo)> {
        let handle = self.linker.open(path).map_err(|e| {
            warn!("failed to load .so lib {}: {e}", path.display());
            Error::InvalidImageFormat(e.to_string())
        })?;

        let Some(template) = self.linker.symbol(handle, NT_HEADER_SYMBOL) else {
            warn!("{} already loaded?", path.display());
            let existing = self.registry.find_by_handle(handle);
            self.linker.close(handle);
            return match existing {
                Some(module) => self.describe(module),
                None => Err(Error::InvalidImageFormat(format!(
                    "{} has no {NT_HEADER_SYMBOL}",
                    path.display()
                ))),
            };
        };

        match self.synthesize(handle, template) {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                self.linker.close(handle);
                Err(e)
            }
        }
    }

    fn synthesize(&self, handle: LibraryHandle, template: u64) -> Result<(ModuleHandle, ImageInfo)> {
        let profile = self.config.profile;
        let module = ModuleHandle::new(preferred_module_base(&self.space, profile, template)?);
        if let Some(existing) = self.registry.find_by_module(module) {
            self.linker.close(handle);
            return Ok((existing.module, existing.image));
        }

        let image = build_synthetic_image(
            &self.space,
            profile,
            template,
            module.base(),
            self.config.build,
        )?;
        let info = ImageInfo {
            kind: ImageKind::Synthesized,
            machine: image.machine,
            entry_point: match image.entry_point {
                0 => 0,
                rva => module.base() + u64::from(rva),
            },
            size_of_image: u64::from(image.size_of_image),
            is_hybrid: profile.is_hybrid(),
        };
        let entry = BuiltinModule::new(
            module,
            None,
            Some(handle),
            info.clone(),
            vec![module.base()],
        );
        match self.registry.insert(entry) {
            Inserted::New(module) => Ok((module, info)),
            Inserted::Existing(existing) => {
                let _ = self.space.unmap(module.base());
                self.linker.close(handle);
                self.describe(existing)
            }
        }
    }

    fn describe(&self, module: ModuleHandle) -> Result<(ModuleHandle, ImageInfo)> {
        self.registry
            .find_by_module(module)
            .map(|b| (b.module, b.image))
            .ok_or(Error::InvalidHandle(module.base()))
    }

    /// Attach the shared object at `path` as the native side of `module`,
    /// returning its init entry point.
    pub fn attach_unix_side(&self, module: ModuleHandle, path: &Path) -> Result<u64> {
        let _guard = self.exclusive();
        self.attach_unix_side_locked(module, path)
    }

    fn attach_unix_side_locked(&self, module: ModuleHandle, path: &Path) -> Result<u64> {
        let handle = self.linker.open(path).map_err(|_| Error::NotFound)?;
        match self.attach_opened(module, path, handle) {
            Ok((entry, true)) => Ok(entry),
            Ok((entry, false)) => {
                // the module keeps its original reference
                self.linker.close(handle);
                Ok(entry)
            }
            Err(e) => {
                self.linker.close(handle);
                Err(e)
            }
        }
    }

    /// Returns the entry point and whether `handle` was newly attached.
    fn attach_opened(
        &self,
        module: ModuleHandle,
        path: &Path,
        handle: LibraryHandle,
    ) -> Result<(u64, bool)> {
        let profile = self.config.profile;
        let missing = |symbol| Error::MissingRequiredSymbol {
            library: path.to_path_buf(),
            symbol,
        };
        let template = self
            .linker
            .symbol(handle, NT_HEADER_SYMBOL)
            .ok_or_else(|| missing(NT_HEADER_SYMBOL))?;
        let init_symbol = if profile.is_hybrid() {
            HYBRID_UNIX_INIT_SYMBOL
        } else {
            UNIX_INIT_SYMBOL
        };
        let entry = self
            .linker
            .symbol(handle, init_symbol)
            .ok_or_else(|| missing(init_symbol))?;

        match self.registry.unix_side(module, handle) {
            UnixSide::Free => {}
            UnixSide::Attached { entry } => return Ok((entry, false)),
            UnixSide::Conflict => {
                error!(
                    "module {module} already has a native side that's not {}",
                    path.display()
                );
                return Err(Error::NativeSideConflict {
                    module: module.base(),
                    path: path.to_path_buf(),
                });
            }
            UnixSide::OwnedBy(other) => {
                error!("{} already loaded for module {other}", path.display());
                return Err(Error::InvalidImageFormat(format!(
                    "{} is the native side of {other}",
                    path.display()
                )));
            }
            UnixSide::Missing => {
                error!("builtin module not found for {}", path.display());
                return Err(Error::InvalidHandle(module.base()));
            }
        }

        let unix_module = ModuleHandle::new(preferred_module_base(&self.space, profile, template)?);
        build_synthetic_image(
            &self.space,
            profile,
            template,
            unix_module.base(),
            self.config.build,
        )?;

        let name = path.to_string_lossy();
        let attached = self
            .resolve_core_imports(&name, unix_module)
            .and_then(|()| {
                match self
                    .registry
                    .attach_unix_side(module, handle, unix_module, entry)
                {
                    UnixSide::Attached { .. } => Ok(()),
                    _ => Err(Error::NativeSideConflict {
                        module: module.base(),
                        path: path.to_path_buf(),
                    }),
                }
            });
        if let Err(e) = attached {
            let _ = self.space.unmap(unix_module.base());
            return Err(e);
        }
        Ok((entry, true))
    }

    /// Bind the import table of `module` against the core runtime.
    ///
    /// Importing from any other module fails. Symbols the core runtime does
    /// not export are logged and their slots zeroed.
    pub fn resolve_core_imports(&self, name: &str, module: ModuleHandle) -> Result<()> {
        let profile = self.config.profile;
        let view = self.view(module);
        let layout = OptionalLayout::for_profile(profile);

        let nt_rva = u64::from(view.read_u32(dos::E_LFANEW)?);
        let dir = nt_rva
            + nt::OPTIONAL_HEADER
            + layout.data_directory
            + u64::from(directory::IMPORT) * DATA_DIRECTORY_SIZE;
        let (dir_rva, dir_size) = (view.read_u32(dir)?, view.read_u32(dir + 4)?);
        if dir_rva == 0 || dir_size == 0 {
            return Ok(());
        }

        let core = self.core_runtime().ok_or(Error::CoreRuntimeMissing)?;
        let core_view = self.view(core.module);
        let core_name = self.config.core_module.as_str();
        let width = profile.pointer_width() as u64;

        let descriptors = imports::descriptors(&view, dir_rva)?;
        for descr in descriptors.iter().take_while(|d| d.first_thunk != 0) {
            let import = String::from_utf8_lossy(&view.read_cstr(u64::from(descr.name))?).into_owned();
            if import != core_name {
                error!("module {name} is importing {import}");
                return Err(Error::ForeignImportSource {
                    module: name.to_string(),
                    import,
                });
            }

            let mut lookup = u64::from(descr.lookup_table());
            let mut thunk = u64::from(descr.first_thunk);
            loop {
                let raw = view.read_ptr(lookup)?;
                if raw == 0 {
                    break;
                }
                let function = match ThunkEntry::decode(&view, raw) {
                    ThunkEntry::Ordinal(ordinal) => {
                        let found = match u32::from(ordinal).checked_sub(core.exports.base) {
                            Some(index) => core.exports.find_by_ordinal(&core_view, index)?,
                            None => None,
                        };
                        if found.is_none() {
                            error!("{name}: {core_name}.{ordinal} not found");
                        }
                        found
                    }
                    ThunkEntry::Name { rva } => {
                        let (hint, symbol) = hint_name(&view, rva)?;
                        let found = core.exports.find_by_hinted_name(&core_view, hint, &symbol)?;
                        if found.is_none() {
                            error!(
                                "{name}: {core_name}.{} not found",
                                String::from_utf8_lossy(&symbol)
                            );
                        }
                        found
                    }
                };
                view.write_ptr(thunk, function.unwrap_or(0))?;
                lookup += width;
                thunk += width;
            }

            if profile.is_hybrid() {
                self.resolve_host_imports(name, &view, &core, lookup + width, thunk + width)?;
            }
        }
        Ok(())
    }

    /// The second thunk list of a 32-on-64 image names host-side symbols,
    /// which come from the shared object backing the core runtime.
    fn resolve_host_imports(
        &self,
        name: &str,
        view: &ImageView<'_>,
        core: &CoreRuntime,
        mut lookup: u64,
        mut thunk: u64,
    ) -> Result<()> {
        let width = view.pointer_width() as u64;
        loop {
            let raw = view.read_ptr(lookup)?;
            if raw == 0 {
                return Ok(());
            }
            match ThunkEntry::decode(view, raw) {
                ThunkEntry::Ordinal(ordinal) => {
                    error!("{name}: host import by ordinal not implemented ({ordinal})");
                }
                ThunkEntry::Name { rva } => {
                    let (_, symbol) = hint_name(view, rva)?;
                    let symbol = String::from_utf8_lossy(&symbol);
                    let function = core
                        .library
                        .and_then(|library| self.linker.symbol(library, &symbol));
                    if function.is_none() {
                        trace!("{name}: {symbol} not found on the host side");
                    }
                    view.write_ptr(thunk, function.unwrap_or(0))?;
                }
            }
            lookup += width;
            thunk += width;
        }
    }

    /// Load the core runtime from the DLL directory and resolve its entry
    /// points.
    pub fn load_core_runtime(&self) -> Result<CoreRuntime> {
        let path = self.config.paths.dll_dir.join(&self.config.core_module);
        let _guard = self.exclusive();

        let (module, _) = self.try_builtin_file(&path).inspect_err(|e| {
            error!("failed to load {}: {e}", path.display());
        })?;
        let view = self.view(module);
        let exports = ExportDirectory::locate(&view)?.ok_or_else(|| {
            Error::InvalidImageFormat(format!("{} has no export directory", path.display()))
        })?;

        let entry_points = EntryPoints::resolve(self.config.profile.is_hybrid(), |name| {
            exports.find_by_name(&view, name.as_bytes())
        })?;

        if let Some(dispatcher) = self.config.syscall_dispatcher {
            match exports.find_by_name(&view, SYSCALL_DISPATCHER_SLOT.as_bytes())? {
                Some(slot) => view.write_ptr(slot - module.base(), dispatcher)?,
                None => error!("{SYSCALL_DISPATCHER_SLOT} not found"),
            }
        }

        let library = self
            .registry
            .find_by_module(module)
            .and_then(|b| b.handle.or(b.unix_handle));
        let core = CoreRuntime {
            module,
            exports,
            entry_points,
            library,
        };
        *self.core.write().unwrap_or_else(PoisonError::into_inner) = Some(core.clone());
        Ok(core)
    }

    /// Exports of a loaded module in name-table order.
    pub fn exports(&self, module: ModuleHandle) -> Result<Vec<ExportEntry>> {
        self.describe(module)?;
        let view = self.view(module);
        let Some(exports) = ExportDirectory::locate(&view)? else {
            return Ok(Vec::new());
        };
        exports
            .names(&view)?
            .into_iter()
            .map(|(name, ordinal)| -> Result<ExportEntry> {
                Ok(ExportEntry {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    ordinal: ordinal + exports.base,
                    address: exports.find_by_ordinal(&view, ordinal)?,
                })
            })
            .collect()
    }

    /// Address of the export `symbol` of a loaded module.
    pub fn find_export(&self, module: ModuleHandle, symbol: &str) -> Result<Option<u64>> {
        self.describe(module)?;
        let view = self.view(module);
        match ExportDirectory::locate(&view)? {
            Some(exports) => Ok(exports.find_by_name(&view, symbol.as_bytes())?),
            None => Ok(None),
        }
    }

    /// Run the init routines of `module` through `call`, once per module.
    pub fn init_module(
        &self,
        module: ModuleHandle,
        args: &ProcessArgs,
        mut call: impl FnMut(u64, &ProcessArgs),
    ) -> Result<()> {
        let entry = self
            .registry
            .find_by_module(module)
            .ok_or(Error::InvalidHandle(module.base()))?;
        if self.registry.mark_initialized(module) != Some(true) {
            return Ok(());
        }
        let Some(handle) = entry.handle else {
            return Ok(());
        };

        let routines = self.linker.init_routines(handle);
        trace!("{module}: {} init routines", routines.len());
        for routine in routines {
            call(routine, args);
        }
        Ok(())
    }

    /// Remove `module`, dropping its shared objects and address ranges.
    pub fn unload(&self, module: ModuleHandle) -> Result<()> {
        let _guard = self.exclusive();
        self.unload_locked(module)
    }

    fn unload_locked(&self, module: ModuleHandle) -> Result<()> {
        let entry = self
            .registry
            .remove(module)
            .ok_or(Error::InvalidHandle(module.base()))?;
        for handle in [entry.handle, entry.unix_handle].into_iter().flatten() {
            self.linker.close(handle);
        }
        for region in entry.regions {
            let _ = self.space.unmap(region);
        }

        let mut core = self.core.write().unwrap_or_else(PoisonError::into_inner);
        if core.as_ref().is_some_and(|c| c.module == module) {
            *core = None;
        }
        debug!("unloaded {module}");
        Ok(())
    }

    /// Unload every module, most recent first.
    pub fn shutdown(&self) {
        let _guard = self.exclusive();
        for module in self.registry.modules().into_iter().rev() {
            let _ = self.unload_locked(module);
        }
    }
}

fn out_of_memory(e: MemoryError) -> Error {
    match e {
        MemoryError::OutOfMemory { .. }
        | MemoryError::Overlap { .. }
        | MemoryError::FromRanges(_) => Error::OutOfMemory,
        e => e.into(),
    }
}
