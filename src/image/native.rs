//! Mapping of genuine PE files that are marked as builtins.

use goblin::pe::PE;
use log::warn;

use super::format::{dos, BUILTIN_SIGNATURE};
use crate::memory::{align_up, AddressSpace, MemoryError, ALLOCATION_GRANULARITY, PAGE_SIZE};

/// Where the loader looks for room when the preferred base is taken.
const FALLBACK_SEARCH_START: u64 = 0x1000_0000;

/// Facts about a parsed PE file needed before deciding to map it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeFacts {
    pub machine: u16,
    pub image_base: u64,
    pub size_of_image: u64,
    pub entry_point: u32,
    pub is_builtin: bool,
}

#[derive(Debug)]
pub struct MappedPe {
    pub base: u64,
    pub size: u64,
    pub facts: PeFacts,
}

pub fn inspect(pe: &PE<'_>, bytes: &[u8]) -> PeFacts {
    let (image_base, size_of_image) = pe
        .header
        .optional_header
        .as_ref()
        .map(|o| (o.windows_fields.image_base, u64::from(o.windows_fields.size_of_image)))
        .unwrap_or((pe.image_base as u64, 0));

    let sig_start = dos::SIZE as usize;
    let sig_end = sig_start + BUILTIN_SIGNATURE.len();
    let is_builtin = pe.header.dos_header.pe_pointer as usize >= sig_end
        && bytes.get(sig_start..sig_end) == Some(&BUILTIN_SIGNATURE[..]);

    PeFacts {
        machine: pe.header.coff_header.machine,
        image_base,
        size_of_image,
        entry_point: pe.entry as u32,
        is_builtin,
    }
}

/// Copy headers and sections of `bytes` into `space`.
///
/// The image goes to its preferred base when that range is free, otherwise
/// to the first free range above it. Base relocations are not applied.
pub fn map_image(
    space: &AddressSpace,
    pe: &PE<'_>,
    bytes: &[u8],
) -> Result<MappedPe, MemoryError> {
    let facts = inspect(pe, bytes);
    let size = align_up(facts.size_of_image.max(PAGE_SIZE), PAGE_SIZE);

    let base = match space.map_fixed(facts.image_base, size) {
        Ok(()) => facts.image_base,
        Err(MemoryError::Overlap { .. }) => {
            let start = facts.image_base.max(FALLBACK_SEARCH_START);
            let base = space
                .find_free(start, size, ALLOCATION_GRANULARITY)
                .ok_or(MemoryError::OutOfMemory { addr: start, size })?;
            warn!(
                "image preferred at {:#x} mapped at {base:#x}, relocations not applied",
                facts.image_base
            );
            space.map_fixed(base, size)?;
            base
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = copy_contents(space, pe, bytes, base, size) {
        let _ = space.unmap(base);
        return Err(e);
    }
    Ok(MappedPe { base, size, facts })
}

fn copy_contents(
    space: &AddressSpace,
    pe: &PE<'_>,
    bytes: &[u8],
    base: u64,
    size: u64,
) -> Result<(), MemoryError> {
    let headers = pe
        .header
        .optional_header
        .as_ref()
        .map(|o| o.windows_fields.size_of_headers as usize)
        .unwrap_or(bytes.len())
        .min(bytes.len())
        .min(size as usize);
    space.write(base, &bytes[..headers])?;

    for section in &pe.sections {
        let start = section.pointer_to_raw_data as usize;
        let raw = section.size_of_raw_data as usize;
        let virt = section.virtual_size as usize;
        // raw data past the virtual size is file padding
        let len = if virt != 0 { raw.min(virt) } else { raw };
        let Some(data) = bytes.get(start..start.saturating_add(len)) else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        space.write(base + u64::from(section.virtual_address), data)?;
    }
    Ok(())
}
