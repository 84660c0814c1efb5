//! Synthesis of PE headers for builtin modules.
//!
//! A builtin shared object carries a header-only template: an NT headers
//! block whose data directories (imports, exports, resources) describe
//! tables inside the shared object, with RVAs relative to the template
//! itself. The builder reserves a header region at the module base, writes
//! a DOS header and a copy of the template there, declares a code and a
//! data section, and rebases every RVA so that it is relative to the module
//! base instead.

use std::ops::Range;

use super::error::{ImageError, Result};
use super::fixup::{fixup_rva_dwords, fixup_rva_names, fixup_rva_ptrs};
use super::format::{
    self, directory, dos, export_directory as ed, import_descriptor as id, nt, optional,
    resource, section, OptionalLayout, BUILTIN_SIGNATURE, SYNTHETIC_NT_OFFSET,
};
use crate::memory::{
    align_up, AddressSpace, ImageView, RelocationDelta, ALLOCATION_GRANULARITY, PAGE_SIZE,
};
use crate::profile::TargetProfile;

const NUMBER_OF_SECTIONS: u16 = 2;

/// Resource trees are three levels deep in practice; anything past this is
/// treated as a corrupt (possibly cyclic) tree.
const MAX_RESOURCE_DEPTH: u32 = 16;

/// How the export function table of a template is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFunctionForm {
    /// Pointer-sized absolute addresses, as emitted by the linker into a
    /// shared object. They are converted to module-relative RVAs.
    #[default]
    AbsolutePointers,
    /// Dword RVAs relative to the template; they get the relocation delta
    /// like every other table.
    RelativeOffsets,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub export_functions: ExportFunctionForm,
}

/// Layout of a synthesized image, all offsets relative to `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticImage {
    pub base: u64,
    /// Bytes reserved for the headers at `base`.
    pub header_size: u64,
    pub code: Range<u32>,
    pub data: Range<u32>,
    pub delta: RelocationDelta,
    pub entry_point: u32,
    pub size_of_image: u32,
    pub machine: u16,
}

/// Address a module built from `template` is placed at: the template's image
/// base rounded up to the allocation granularity.
pub fn preferred_module_base(
    space: &AddressSpace,
    profile: TargetProfile,
    template: u64,
) -> Result<u64> {
    let layout = OptionalLayout::for_profile(profile);
    let view = ImageView::new(space, template, profile);
    let field = nt::OPTIONAL_HEADER + layout.image_base;
    let image_base = if layout.is_64bit() {
        space.read_u64(view.addr(field))?
    } else {
        u64::from(view.read_u32(field)?)
    };
    Ok(align_up(image_base, ALLOCATION_GRANULARITY))
}

/// Build the image headers for `template` at `module`.
///
/// On failure nothing stays mapped at `module`.
pub fn build_synthetic_image(
    space: &AddressSpace,
    profile: TargetProfile,
    template: u64,
    module: u64,
    options: BuildOptions,
) -> Result<SyntheticImage> {
    let layout = OptionalLayout::for_profile(profile);
    check_template(space, profile, template, &layout)?;

    let header_size = format::synthetic_header_size(&layout, u64::from(NUMBER_OF_SECTIONS));
    let reserved = align_up(header_size, PAGE_SIZE);
    space
        .map_fixed(module, reserved)
        .map_err(|_| ImageError::OutOfMemory { addr: module, size: reserved })?;

    let view = ImageView::new(space, module, profile);
    match populate(&view, template, &layout, header_size, options) {
        Ok(mut image) => {
            image.header_size = reserved;
            Ok(image)
        }
        Err(e) => {
            let _ = space.unmap(module);
            Err(e)
        }
    }
}

fn check_template(
    space: &AddressSpace,
    profile: TargetProfile,
    template: u64,
    layout: &OptionalLayout,
) -> Result<()> {
    let view = ImageView::new(space, template, profile);
    if view.read_u32(nt::SIGNATURE)? != format::PE_MAGIC {
        return Err(ImageError::InvalidTemplate("missing NT signature".into()));
    }
    let magic = view.read_u16(nt::OPTIONAL_HEADER + optional::MAGIC)?;
    if magic != layout.magic {
        return Err(ImageError::InvalidTemplate(format!(
            "optional header magic {magic:#x} does not fit the {profile} profile"
        )));
    }
    Ok(())
}

fn populate(
    view: &ImageView<'_>,
    template: u64,
    layout: &OptionalLayout,
    header_size: u64,
    options: BuildOptions,
) -> Result<SyntheticImage> {
    write_dos_header(view)?;

    let mut nt_headers = vec![0u8; layout.nt_headers_size() as usize];
    view.space().read(template, &mut nt_headers)?;
    view.write_bytes(SYNTHETIC_NT_OFFSET, &nt_headers)?;

    let opt = SYNTHETIC_NT_OFFSET + nt::OPTIONAL_HEADER;
    let delta = RelocationDelta::between(template, view.base());

    let alignment = view.read_u32(opt + optional::SECTION_ALIGNMENT)?;
    if !alignment.is_power_of_two() {
        return Err(ImageError::InvalidTemplate(format!(
            "section alignment {alignment:#x} is not a power of two"
        )));
    }
    let mask = alignment - 1;
    let declared_size = view.read_u32(opt + optional::SIZE_OF_IMAGE)?;

    let code_start = (header_size as u32 + mask) & !mask;
    let data_start = (delta.value() as u32) & !mask;
    let code_end = data_start;
    let data_end = delta.apply_u32(declared_size).wrapping_add(mask) & !mask;
    if code_end < code_start || data_end < data_start {
        return Err(ImageError::InvalidTemplate(format!(
            "template at {template:#x} overlaps the header region of {:#x}",
            view.base()
        )));
    }

    fixup_rva_ptrs(view, opt + optional::ADDRESS_OF_ENTRY_POINT, 1)?;

    let file_header = SYNTHETIC_NT_OFFSET + nt::FILE_HEADER;
    view.write_u16(file_header + format::file_header::NUMBER_OF_SECTIONS, NUMBER_OF_SECTIONS)?;
    view.write_u32(opt + optional::BASE_OF_CODE, code_start)?;
    if !layout.is_64bit() {
        view.write_u32(opt + optional::BASE_OF_DATA, data_start)?;
    }
    view.write_u32(opt + optional::SIZE_OF_CODE, code_end - code_start)?;
    view.write_u32(opt + optional::SIZE_OF_INITIALIZED_DATA, data_end - data_start)?;
    view.write_u32(opt + optional::SIZE_OF_UNINITIALIZED_DATA, 0)?;
    view.write_u32(opt + optional::SIZE_OF_IMAGE, data_end)?;
    if layout.is_64bit() {
        view.space().write_u64(view.addr(opt + layout.image_base), view.base())?;
    } else {
        view.write_u32(opt + layout.image_base, view.base() as u32)?;
    }

    let sections = SYNTHETIC_NT_OFFSET + layout.nt_headers_size();
    write_section(
        view,
        sections,
        b".text",
        code_start..code_end,
        format::IMAGE_SCN_CNT_CODE | format::IMAGE_SCN_MEM_EXECUTE | format::IMAGE_SCN_MEM_READ,
    )?;
    write_section(
        view,
        sections + section::SIZE,
        b".data",
        data_start..data_end,
        format::IMAGE_SCN_CNT_INITIALIZED_DATA
            | format::IMAGE_SCN_MEM_WRITE
            | format::IMAGE_SCN_MEM_READ,
    )?;

    let dirs = opt + layout.data_directory;
    let count = view
        .read_u32(opt + layout.number_of_rva_and_sizes)?
        .min(format::NUMBER_OF_DIRECTORY_ENTRIES);
    for i in 0..u64::from(count) {
        fixup_rva_dwords(view, dirs + i * format::DATA_DIRECTORY_SIZE, delta, 1)?;
    }

    let directory_at = |index: u32| -> Result<Option<u64>> {
        if index >= count {
            return Ok(None);
        }
        let entry = dirs + u64::from(index) * format::DATA_DIRECTORY_SIZE;
        let size = view.read_u32(entry + 4)?;
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(u64::from(view.read_u32(entry)?)))
    };

    if let Some(imports) = directory_at(directory::IMPORT)? {
        fixup_imports(view, imports, delta)?;
    }
    if let Some(resources) = directory_at(directory::RESOURCE)? {
        fixup_resources(view, resources, resources, delta, 0)?;
    }
    if let Some(exports) = directory_at(directory::EXPORT)? {
        fixup_exports(view, exports, delta, options.export_functions)?;
    }

    Ok(SyntheticImage {
        base: view.base(),
        header_size,
        code: code_start..code_end,
        data: data_start..data_end,
        delta,
        entry_point: view.read_u32(opt + optional::ADDRESS_OF_ENTRY_POINT)?,
        size_of_image: data_end,
        machine: view.read_u16(file_header + format::file_header::MACHINE)?,
    })
}

fn write_dos_header(view: &ImageView<'_>) -> Result<()> {
    view.write_u16(dos::E_MAGIC, format::DOS_MAGIC)?;
    view.write_u16(dos::E_CBLP, 0x90)?;
    view.write_u16(dos::E_CP, 3)?;
    view.write_u16(dos::E_CPARHDR, ((dos::SIZE + 0xf) / 0x10) as u16)?;
    view.write_u16(dos::E_MINALLOC, 0)?;
    view.write_u16(dos::E_MAXALLOC, 0xffff)?;
    view.write_u16(dos::E_SS, 0)?;
    view.write_u16(dos::E_SP, 0xb8)?;
    view.write_u32(dos::E_LFANEW, SYNTHETIC_NT_OFFSET as u32)?;
    view.write_bytes(dos::SIZE, &BUILTIN_SIGNATURE)?;
    Ok(())
}

fn write_section(
    view: &ImageView<'_>,
    at: u64,
    name: &[u8],
    range: Range<u32>,
    characteristics: u32,
) -> Result<()> {
    let mut raw_name = [0u8; 8];
    raw_name[..name.len()].copy_from_slice(name);
    view.write_bytes(at + section::NAME, &raw_name)?;
    let size = range.end - range.start;
    view.write_u32(at + section::SIZE_OF_RAW_DATA, size)?;
    view.write_u32(at + section::VIRTUAL_SIZE, size)?;
    view.write_u32(at + section::VIRTUAL_ADDRESS, range.start)?;
    view.write_u32(at + section::POINTER_TO_RAW_DATA, range.start)?;
    view.write_u32(at + section::CHARACTERISTICS, characteristics)?;
    Ok(())
}

fn fixup_imports(view: &ImageView<'_>, directory: u64, delta: RelocationDelta) -> Result<()> {
    let mut descr = directory;
    while view.read_u32(descr + id::NAME)? != 0 {
        fixup_rva_dwords(view, descr + id::ORIGINAL_FIRST_THUNK, delta, 1)?;
        fixup_rva_dwords(view, descr + id::NAME, delta, 1)?;
        fixup_rva_dwords(view, descr + id::FIRST_THUNK, delta, 1)?;

        for field in [id::ORIGINAL_FIRST_THUNK, id::FIRST_THUNK] {
            let thunks = view.read_u32(descr + field)?;
            if thunks != 0 {
                fixup_rva_names(view, u64::from(thunks), delta)?;
            }
        }
        descr += id::SIZE;
    }
    Ok(())
}

fn fixup_resources(
    view: &ImageView<'_>,
    dir: u64,
    root: u64,
    delta: RelocationDelta,
    depth: u32,
) -> Result<()> {
    if depth > MAX_RESOURCE_DEPTH {
        return Err(ImageError::InvalidTemplate("resource tree is too deep".into()));
    }
    let named = view.read_u16(dir + resource::NUMBER_OF_NAMED_ENTRIES)?;
    let ids = view.read_u16(dir + resource::NUMBER_OF_ID_ENTRIES)?;
    let entries = dir + resource::DIRECTORY_SIZE;

    for i in 0..u64::from(named) + u64::from(ids) {
        let entry = entries + i * resource::ENTRY_SIZE;
        let offset = view.read_u32(entry + resource::ENTRY_OFFSET_TO_DATA)?;
        let target = root + u64::from(offset & !resource::DATA_IS_DIRECTORY);
        if offset & resource::DATA_IS_DIRECTORY != 0 {
            fixup_resources(view, target, root, delta, depth + 1)?;
        } else {
            fixup_rva_dwords(view, target + resource::DATA_OFFSET_TO_DATA, delta, 1)?;
        }
    }
    Ok(())
}

fn fixup_exports(
    view: &ImageView<'_>,
    directory: u64,
    delta: RelocationDelta,
    form: ExportFunctionForm,
) -> Result<()> {
    for field in [
        ed::NAME,
        ed::ADDRESS_OF_FUNCTIONS,
        ed::ADDRESS_OF_NAMES,
        ed::ADDRESS_OF_NAME_ORDINALS,
    ] {
        fixup_rva_dwords(view, directory + field, delta, 1)?;
    }

    let names = view.read_u32(directory + ed::ADDRESS_OF_NAMES)?;
    let number_of_names = view.read_u32(directory + ed::NUMBER_OF_NAMES)?;
    fixup_rva_dwords(view, u64::from(names), delta, number_of_names as usize)?;

    let functions = u64::from(view.read_u32(directory + ed::ADDRESS_OF_FUNCTIONS)?);
    let number_of_functions = view.read_u32(directory + ed::NUMBER_OF_FUNCTIONS)? as usize;
    match form {
        ExportFunctionForm::AbsolutePointers => {
            // hybrid images carry a host-side pointer after each entry
            let count = if view.profile().is_hybrid() {
                number_of_functions * 2
            } else {
                number_of_functions
            };
            fixup_rva_ptrs(view, functions, count)
        }
        ExportFunctionForm::RelativeOffsets => {
            fixup_rva_dwords(view, functions, delta, number_of_functions)
        }
    }
    .map_err(ImageError::from)
}
