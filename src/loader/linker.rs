//! Host dynamic-linking capability.
//!
//! The loader only needs four things from a shared object: a handle, symbol
//! lookup, a way to drop it again, and the list of builtin init routines.
//! [`ElfLinker`] provides them by mapping ELF shared objects into the
//! emulated address space.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use goblin::elf::{
    header::{EM_386, EM_AARCH64, EM_ARM},
    program_header::PT_LOAD,
    reloc::{
        R_386_32, R_386_GLOB_DAT, R_386_JMP_SLOT, R_386_RELATIVE, R_AARCH64_ABS64,
        R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT, R_AARCH64_RELATIVE, R_ARM_ABS32,
        R_ARM_GLOB_DAT, R_ARM_JUMP_SLOT, R_ARM_RELATIVE, R_X86_64_64, R_X86_64_GLOB_DAT,
        R_X86_64_JUMP_SLOT, R_X86_64_RELATIVE,
    },
    Elf, Reloc,
};
use log::{debug, trace};

use super::error::{Error, Result};
use crate::memory::{align_down, AddressSpace, RelocationDelta, ALLOCATION_GRANULARITY, PAGE_SIZE};

/// Dynamic tag holding the address of the builtin init array.
pub const DT_BUILTIN_INIT_ARRAY: u64 = 0x6000_9990;
/// Dynamic tag holding the size in bytes of the builtin init array.
pub const DT_BUILTIN_INIT_ARRAYSZ: u64 = 0x6000_9991;
/// Dynamic tag holding the address of the builtin init function.
pub const DT_BUILTIN_INIT_FUNC: u64 = 0x6000_9992;

/// Shared objects are placed at or above this address.
const LIBRARY_SEARCH_START: u64 = 0x7000_0000;

/// Opaque handle of an opened shared object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandle(u64);

impl LibraryHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

pub trait DynamicLinker {
    /// Open `path`, returning the same handle for repeated opens of a library
    /// that is still loaded.
    fn open(&self, path: &Path) -> Result<LibraryHandle>;

    /// Absolute address of an exported symbol.
    fn symbol(&self, handle: LibraryHandle, name: &str) -> Option<u64>;

    /// Drop one reference taken by [`DynamicLinker::open`].
    fn close(&self, handle: LibraryHandle);

    /// Builtin init routines in call order: the init function first, then
    /// every init array entry.
    fn init_routines(&self, handle: LibraryHandle) -> Vec<u64>;
}

impl<T: DynamicLinker + ?Sized> DynamicLinker for Arc<T> {
    fn open(&self, path: &Path) -> Result<LibraryHandle> {
        (**self).open(path)
    }

    fn symbol(&self, handle: LibraryHandle, name: &str) -> Option<u64> {
        (**self).symbol(handle, name)
    }

    fn close(&self, handle: LibraryHandle) {
        (**self).close(handle)
    }

    fn init_routines(&self, handle: LibraryHandle) -> Vec<u64> {
        (**self).init_routines(handle)
    }
}

struct Library {
    path: PathBuf,
    base: u64,
    refs: usize,
    symbols: HashMap<String, u64>,
    init: Vec<u64>,
}

#[derive(Default)]
struct Libraries {
    next: u64,
    by_path: HashMap<PathBuf, LibraryHandle>,
    loaded: HashMap<LibraryHandle, Library>,
}

/// Maps ELF shared objects into an [`AddressSpace`].
///
/// Segments are copied at a fresh bias, relocations against the library
/// itself are applied and `.dynsym` definitions become the symbol table.
/// Nothing is executed.
pub struct ElfLinker {
    space: Arc<AddressSpace>,
    libraries: Mutex<Libraries>,
}

impl ElfLinker {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self {
            space,
            libraries: Mutex::new(Libraries::default()),
        }
    }

    fn libraries(&self) -> MutexGuard<'_, Libraries> {
        self.libraries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of libraries currently mapped.
    pub fn loaded(&self) -> usize {
        self.libraries().loaded.len()
    }

    fn map(&self, path: &Path, data: &[u8]) -> Result<Library> {
        let elf = Elf::parse(data)?;

        let mut extent: Option<(u64, u64)> = None;
        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            let end = ph.p_vaddr.checked_add(ph.p_memsz).ok_or_else(|| {
                Error::InvalidImageFormat(format!(
                    "segment at {:#x} wraps the address space",
                    ph.p_vaddr
                ))
            })?;
            extent = Some(match extent {
                Some((lo, hi)) => (lo.min(ph.p_vaddr), hi.max(end)),
                None => (ph.p_vaddr, end),
            });
        }
        let Some((lo, hi)) = extent else {
            return Err(Error::InvalidImageFormat(format!(
                "{} has no loadable segments",
                path.display()
            )));
        };
        let lo = align_down(lo, PAGE_SIZE);
        let span = (hi - lo)
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or_else(|| {
                Error::InvalidImageFormat(format!("{} spans the address space", path.display()))
            })?;

        let base = self
            .space
            .find_free(LIBRARY_SEARCH_START, span, ALLOCATION_GRANULARITY)
            .ok_or(Error::OutOfMemory)?;
        self.space.map_fixed(base, span)?;
        // prelinked objects may sit above their new base
        let bias = RelocationDelta::between(base, lo);

        match self.populate(&elf, data, bias) {
            Ok((symbols, init)) => {
                debug!("mapped {} at {base:#x}", path.display());
                Ok(Library {
                    path: path.to_path_buf(),
                    base,
                    refs: 1,
                    symbols,
                    init,
                })
            }
            Err(e) => {
                let _ = self.space.unmap(base);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        elf: &Elf<'_>,
        data: &[u8],
        bias: RelocationDelta,
    ) -> Result<(HashMap<String, u64>, Vec<u64>)> {
        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            let file_offset = ph.p_offset as usize;
            let filesz = ph.p_filesz as usize;
            let memsz = ph.p_memsz as usize;

            // copy the initialized data from the file
            let bytes = file_offset
                .checked_add(filesz)
                .and_then(|end| data.get(file_offset..end))
                .ok_or_else(|| {
                    Error::InvalidImageFormat(format!(
                        "segment at {:#x} runs past the end of the file",
                        ph.p_vaddr
                    ))
                })?;
            let vaddr = bias.apply_u64(ph.p_vaddr);
            self.space.write(vaddr, bytes)?;

            // zero the remainder of the segment if any
            if memsz > filesz {
                self.space
                    .fill(vaddr.wrapping_add(filesz as u64), memsz - filesz, 0)?;
            }
        }

        let symbols: HashMap<String, u64> = elf
            .dynsyms
            .iter()
            .filter(|sym| sym.st_shndx != 0 && sym.st_value != 0)
            .filter_map(|sym| {
                let name = elf.dynstrtab.get_at(sym.st_name)?;
                Some((name.to_string(), bias.apply_u64(sym.st_value)))
            })
            .collect();

        let kinds = RelocKinds::for_machine(elf.header.e_machine);
        let relocs = elf.dynrelas.iter().chain(elf.dynrels.iter()).chain(elf.pltrelocs.iter());
        for reloc in relocs {
            self.relocate(elf, &kinds, &reloc, bias)?;
        }

        let init = self.read_init_tags(elf, bias)?;
        Ok((symbols, init))
    }

    fn relocate(
        &self,
        elf: &Elf<'_>,
        kinds: &RelocKinds,
        reloc: &Reloc,
        bias: RelocationDelta,
    ) -> Result<()> {
        let target = bias.apply_u64(reloc.r_offset);
        // REL entries keep their addend in place
        let addend = match reloc.r_addend {
            Some(addend) => addend as u64,
            None if elf.is_64 => self.space.read_u64(target)?,
            None => u64::from(self.space.read_u32(target)?),
        };

        let value = if reloc.r_type == kinds.relative {
            bias.apply_u64(addend)
        } else if kinds.symbolic.contains(&reloc.r_type) {
            let Some(sym) = elf.dynsyms.get(reloc.r_sym) else {
                return Ok(());
            };
            if sym.st_shndx == 0 {
                trace!(
                    "leaving unresolved reference to {} at {target:#x}",
                    elf.dynstrtab.get_at(sym.st_name).unwrap_or("?")
                );
                return Ok(());
            }
            let addend = if kinds.slot_ignores_addend(reloc.r_type) { 0 } else { addend };
            bias.apply_u64(sym.st_value).wrapping_add(addend)
        } else {
            return Ok(());
        };

        if elf.is_64 {
            self.space.write_u64(target, value)?;
        } else {
            self.space.write_u32(target, value as u32)?;
        }
        Ok(())
    }

    fn read_init_tags(&self, elf: &Elf<'_>, bias: RelocationDelta) -> Result<Vec<u64>> {
        let Some(dynamic) = &elf.dynamic else {
            return Ok(Vec::new());
        };

        let mut init_func = None;
        let mut init_array = None;
        let mut init_arraysz = 0;
        for d in &dynamic.dyns {
            match d.d_tag {
                DT_BUILTIN_INIT_ARRAY => init_array = Some(bias.apply_u64(d.d_val)),
                DT_BUILTIN_INIT_ARRAYSZ => init_arraysz = d.d_val,
                DT_BUILTIN_INIT_FUNC => init_func = Some(bias.apply_u64(d.d_val)),
                _ => {}
            }
        }

        let mut routines: Vec<u64> = init_func.into_iter().collect();
        if let Some(array) = init_array {
            let width = if elf.is_64 { 8 } else { 4 };
            for i in 0..init_arraysz / width {
                let slot = array.wrapping_add(i * width);
                let routine = if elf.is_64 {
                    self.space.read_u64(slot)?
                } else {
                    u64::from(self.space.read_u32(slot)?)
                };
                routines.push(routine);
            }
        }
        Ok(routines)
    }
}

struct RelocKinds {
    relative: u32,
    symbolic: [u32; 3],
}

impl RelocKinds {
    fn for_machine(machine: u16) -> Self {
        match machine {
            EM_386 => Self {
                relative: R_386_RELATIVE,
                symbolic: [R_386_32, R_386_GLOB_DAT, R_386_JMP_SLOT],
            },
            EM_ARM => Self {
                relative: R_ARM_RELATIVE,
                symbolic: [R_ARM_ABS32, R_ARM_GLOB_DAT, R_ARM_JUMP_SLOT],
            },
            EM_AARCH64 => Self {
                relative: R_AARCH64_RELATIVE,
                symbolic: [R_AARCH64_ABS64, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT],
            },
            _ => Self {
                relative: R_X86_64_RELATIVE,
                symbolic: [R_X86_64_64, R_X86_64_GLOB_DAT, R_X86_64_JUMP_SLOT],
            },
        }
    }

    // GLOB_DAT and JUMP_SLOT store the bare symbol address
    fn slot_ignores_addend(&self, r_type: u32) -> bool {
        r_type != self.symbolic[0]
    }
}

fn retain(libraries: &mut Libraries, key: &Path) -> Option<LibraryHandle> {
    let handle = *libraries.by_path.get(key)?;
    libraries.loaded.get_mut(&handle)?.refs += 1;
    Some(handle)
}

impl DynamicLinker for ElfLinker {
    fn open(&self, path: &Path) -> Result<LibraryHandle> {
        let key = fs::canonicalize(path)?;
        if let Some(handle) = retain(&mut self.libraries(), &key) {
            return Ok(handle);
        }

        let data = fs::read(&key)?;
        let library = self.map(&key, &data)?;

        let mut libraries = self.libraries();
        // a concurrent open of the same path won the race
        if let Some(handle) = retain(&mut libraries, &key) {
            let _ = self.space.unmap(library.base);
            return Ok(handle);
        }
        libraries.next += 1;
        let handle = LibraryHandle::new(libraries.next);
        libraries.by_path.insert(key, handle);
        libraries.loaded.insert(handle, library);
        Ok(handle)
    }

    fn symbol(&self, handle: LibraryHandle, name: &str) -> Option<u64> {
        self.libraries().loaded.get(&handle)?.symbols.get(name).copied()
    }

    fn close(&self, handle: LibraryHandle) {
        let mut libraries = self.libraries();
        let Some(lib) = libraries.loaded.get_mut(&handle) else {
            return;
        };
        lib.refs -= 1;
        if lib.refs > 0 {
            return;
        }
        if let Some(lib) = libraries.loaded.remove(&handle) {
            libraries.by_path.remove(&lib.path);
            debug!("unmapped {}", lib.path.display());
            let _ = self.space.unmap(lib.base);
        }
    }

    fn init_routines(&self, handle: LibraryHandle) -> Vec<u64> {
        self.libraries()
            .loaded
            .get(&handle)
            .map(|lib| lib.init.clone())
            .unwrap_or_default()
    }
}
