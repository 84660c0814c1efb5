use super::format::import_descriptor as id;
use crate::memory::{ImageView, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// RVA of the descriptor itself.
    pub rva: u64,
    pub original_first_thunk: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    pub fn read(view: &ImageView<'_>, rva: u64) -> Result<Self> {
        Ok(Self {
            rva,
            original_first_thunk: view.read_u32(rva + id::ORIGINAL_FIRST_THUNK)?,
            name: view.read_u32(rva + id::NAME)?,
            first_thunk: view.read_u32(rva + id::FIRST_THUNK)?,
        })
    }

    /// Thunk list holding the import identifiers: the lookup table when
    /// present, otherwise the address table itself.
    pub fn lookup_table(&self) -> u32 {
        if self.original_first_thunk != 0 {
            self.original_first_thunk
        } else {
            self.first_thunk
        }
    }
}

/// Descriptors of an import directory, up to the first one with a zero name.
pub fn descriptors(view: &ImageView<'_>, directory: u32) -> Result<Vec<ImportDescriptor>> {
    let mut out = Vec::new();
    let mut rva = u64::from(directory);
    loop {
        let descr = ImportDescriptor::read(view, rva)?;
        if descr.name == 0 {
            return Ok(out);
        }
        out.push(descr);
        rva += id::SIZE;
    }
}

/// Decoded thunk-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThunkEntry {
    Ordinal(u16),
    /// Import by name; `rva` points at the hint/name record.
    Name { rva: u64 },
}

impl ThunkEntry {
    /// Decode a raw non-zero thunk value.
    pub fn decode(view: &ImageView<'_>, raw: u64) -> Self {
        if raw & view.profile().ordinal_flag() != 0 {
            ThunkEntry::Ordinal(raw as u16)
        } else {
            ThunkEntry::Name { rva: raw }
        }
    }
}

/// Read the hint and name of a by-name import record.
pub fn hint_name(view: &ImageView<'_>, rva: u64) -> Result<(u16, Vec<u8>)> {
    let hint = view.read_u16(rva)?;
    let name = view.read_cstr(rva + 2)?;
    Ok((hint, name))
}
