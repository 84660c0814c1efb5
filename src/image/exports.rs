//! Export table lookups.
//!
//! The name table of an export directory is sorted, so names are found by
//! binary search and then mapped through the ordinal table onto the function
//! table. A zero function slot means the ordinal is not exported.

use std::cmp::Ordering;

use super::format::{self, dos, export_directory as ed, nt, OptionalLayout};
use crate::memory::{ImageView, Result};

/// Export directory of a mapped image, with its table RVAs already fixed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDirectory {
    /// RVA of the directory itself.
    pub rva: u32,
    pub name: u32,
    /// Ordinal bias applied to imports by ordinal.
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

impl ExportDirectory {
    /// Locate the export directory through the image headers. Returns `None`
    /// when the headers are not a PE image or no exports are present.
    pub fn locate(view: &ImageView<'_>) -> Result<Option<Self>> {
        if view.read_u16(dos::E_MAGIC)? != format::DOS_MAGIC {
            return Ok(None);
        }
        let nt_rva = u64::from(view.read_u32(dos::E_LFANEW)?);
        if view.read_u32(nt_rva + nt::SIGNATURE)? != format::PE_MAGIC {
            return Ok(None);
        }
        let layout = OptionalLayout::for_profile(view.profile());
        let dir = nt_rva
            + nt::OPTIONAL_HEADER
            + layout.data_directory
            + u64::from(format::directory::EXPORT) * format::DATA_DIRECTORY_SIZE;
        let rva = view.read_u32(dir)?;
        if rva == 0 {
            return Ok(None);
        }
        Self::read(view, rva).map(Some)
    }

    pub fn read(view: &ImageView<'_>, rva: u32) -> Result<Self> {
        let at = u64::from(rva);
        Ok(Self {
            rva,
            name: view.read_u32(at + ed::NAME)?,
            base: view.read_u32(at + ed::BASE)?,
            number_of_functions: view.read_u32(at + ed::NUMBER_OF_FUNCTIONS)?,
            number_of_names: view.read_u32(at + ed::NUMBER_OF_NAMES)?,
            address_of_functions: view.read_u32(at + ed::ADDRESS_OF_FUNCTIONS)?,
            address_of_names: view.read_u32(at + ed::ADDRESS_OF_NAMES)?,
            address_of_name_ordinals: view.read_u32(at + ed::ADDRESS_OF_NAME_ORDINALS)?,
        })
    }

    /// Absolute address of the function at table index `ordinal` (already
    /// unbiased), or `None` when out of range or not exported.
    pub fn find_by_ordinal(&self, view: &ImageView<'_>, ordinal: u32) -> Result<Option<u64>> {
        if ordinal >= self.number_of_functions {
            return Ok(None);
        }
        let slot = u64::from(self.address_of_functions) + u64::from(ordinal) * 4;
        match view.read_u32(slot)? {
            0 => Ok(None),
            rva => Ok(Some(view.addr(u64::from(rva)))),
        }
    }

    pub fn find_by_name(&self, view: &ImageView<'_>, name: &[u8]) -> Result<Option<u64>> {
        let mut min = 0i64;
        let mut max = i64::from(self.number_of_names) - 1;
        while min <= max {
            let pos = (min + max) / 2;
            let ename = self.name_at(view, pos as u32)?;
            match ename.as_slice().cmp(name) {
                Ordering::Equal => return self.find_by_name_index(view, pos as u32),
                Ordering::Greater => max = pos - 1,
                Ordering::Less => min = pos + 1,
            }
        }
        Ok(None)
    }

    /// Try the name-table slot `hint` first, then fall back to a search.
    pub fn find_by_hinted_name(
        &self,
        view: &ImageView<'_>,
        hint: u16,
        name: &[u8],
    ) -> Result<Option<u64>> {
        let hint = u32::from(hint);
        if hint < self.number_of_names && self.name_at(view, hint)? == name {
            return self.find_by_name_index(view, hint);
        }
        self.find_by_name(view, name)
    }

    /// Name-table entries in table order, paired with their unbiased ordinal.
    pub fn names(&self, view: &ImageView<'_>) -> Result<Vec<(Vec<u8>, u32)>> {
        (0..self.number_of_names)
            .map(|i| Ok((self.name_at(view, i)?, self.ordinal_at(view, i)?)))
            .collect()
    }

    /// RVA of the name-table slot `index`.
    fn name_slot(&self, index: u32) -> u64 {
        u64::from(self.address_of_names) + u64::from(index) * 4
    }

    fn name_at(&self, view: &ImageView<'_>, index: u32) -> Result<Vec<u8>> {
        let rva = view.read_u32(self.name_slot(index))?;
        view.read_cstr(u64::from(rva))
    }

    fn ordinal_at(&self, view: &ImageView<'_>, index: u32) -> Result<u32> {
        let slot = u64::from(self.address_of_name_ordinals) + u64::from(index) * 2;
        view.read_u16(slot).map(u32::from)
    }

    fn find_by_name_index(&self, view: &ImageView<'_>, index: u32) -> Result<Option<u64>> {
        let ordinal = self.ordinal_at(view, index)?;
        self.find_by_ordinal(view, ordinal)
    }
}
