//! Emulated process address space.
//!
//! Builtin images, the shared objects backing them and natively mapped PE
//! images all live in one [`AddressSpace`]. Each mapping is a separate
//! `vm-memory` region, so every access is bounds-checked against the region
//! it falls in and can never spill into a neighbour.

pub mod errors;
mod view;

use std::sync::{PoisonError, RwLock};

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

pub use errors::{MemoryError, Result};
pub use view::{ImageView, RelocationDelta};

pub const PAGE_SIZE: u64 = 0x1000;

/// Granularity used when the loader picks a base address on its own.
pub const ALLOCATION_GRANULARITY: u64 = 0x10000;

pub const fn align_up(value: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    value & !(align - 1)
}

struct Region {
    base: u64,
    size: u64,
    mem: GuestMemoryMmap<()>,
}

impl Region {
    fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.base && end <= self.base + self.size
    }

    fn overlaps(&self, addr: u64, size: u64) -> bool {
        addr < self.base + self.size && self.base < addr + size
    }
}

#[derive(Default)]
pub struct AddressSpace {
    /// Sorted by base address, never overlapping.
    regions: RwLock<Vec<Region>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size` zeroed bytes at exactly `addr`.
    ///
    /// Unlike a host `MAP_FIXED` mapping this never replaces an existing
    /// region: an overlapping request fails and leaves the space untouched.
    pub fn map_fixed(&self, addr: u64, size: u64) -> Result<()> {
        if size == 0 || addr.checked_add(size).is_none() {
            return Err(MemoryError::OutOfMemory { addr, size });
        }
        let len = usize::try_from(size).map_err(|_| MemoryError::OutOfMemory { addr, size })?;

        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        if regions.iter().any(|r| r.overlaps(addr, size)) {
            return Err(MemoryError::Overlap { addr, size });
        }

        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(addr), len)])?;

        let pos = regions.partition_point(|r| r.base < addr);
        regions.insert(pos, Region { base: addr, size, mem });
        Ok(())
    }

    /// Release the region starting at `addr`.
    pub fn unmap(&self, addr: u64) -> Result<()> {
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        match regions.iter().position(|r| r.base == addr) {
            Some(pos) => {
                regions.remove(pos);
                Ok(())
            }
            None => Err(MemoryError::NotMapped { addr }),
        }
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        regions.iter().any(|r| r.contains(addr, 1))
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// First `align`-aligned hole of `size` bytes at or above `start`.
    pub fn find_free(&self, start: u64, size: u64, align: u64) -> Option<u64> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidate = align_up(start, align);
        for r in regions.iter() {
            let end = candidate.checked_add(size)?;
            if end <= r.base {
                break;
            }
            if r.base + r.size > candidate {
                candidate = align_up(r.base + r.size, align);
            }
        }
        candidate.checked_add(size).map(|_| candidate)
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .iter()
            .find(|r| r.contains(addr, buf.len()))
            .ok_or(MemoryError::Unmapped { addr, len: buf.len() })?;
        region.mem.read_slice(buf, GuestAddress(addr))?;
        Ok(())
    }

    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let regions = self.regions.read().unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .iter()
            .find(|r| r.contains(addr, buf.len()))
            .ok_or(MemoryError::Unmapped { addr, len: buf.len() })?;
        region.mem.write_slice(buf, GuestAddress(addr))?;
        Ok(())
    }

    pub fn fill(&self, addr: u64, len: usize, value: u8) -> Result<()> {
        self.write(addr, &vec![value; len])
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read a NUL-terminated byte string, at most `max` bytes long.
    pub fn read_cstr(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..max as u64 {
            let byte = self.read_u8(addr + i)?;
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_fixed_rejects_overlap() {
        let space = AddressSpace::new();
        space.map_fixed(0x10000, 0x2000).unwrap();
        assert!(matches!(
            space.map_fixed(0x11000, 0x1000),
            Err(MemoryError::Overlap { .. })
        ));
        space.map_fixed(0x12000, 0x1000).unwrap();
        assert_eq!(space.region_count(), 2);
    }

    #[test]
    fn accesses_are_bounded_by_region() {
        let space = AddressSpace::new();
        space.map_fixed(0x10000, 0x1000).unwrap();
        space.map_fixed(0x11000, 0x1000).unwrap();

        space.write_u32(0x10ffc, 0xdeadbeef).unwrap();
        assert_eq!(space.read_u32(0x10ffc).unwrap(), 0xdeadbeef);

        // straddles two adjacent regions
        assert!(matches!(
            space.read_u64(0x10ffc),
            Err(MemoryError::Unmapped { addr: 0x10ffc, len: 8 })
        ));
        assert!(space.read_u8(0x20000).is_err());
    }

    #[test]
    fn fresh_mappings_are_zeroed() {
        let space = AddressSpace::new();
        space.map_fixed(0x40000, 0x1000).unwrap();
        assert_eq!(space.read_u64(0x40800).unwrap(), 0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn host_mapping_failure_is_reported() {
        let space = AddressSpace::new();
        // larger than any host address space
        assert!(matches!(
            space.map_fixed(0x10000, 1 << 62),
            Err(MemoryError::FromRanges(_))
        ));
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn unmap_releases_the_range() {
        let space = AddressSpace::new();
        space.map_fixed(0x10000, 0x1000).unwrap();
        space.unmap(0x10000).unwrap();
        assert!(!space.is_mapped(0x10000));
        assert!(matches!(space.unmap(0x10000), Err(MemoryError::NotMapped { .. })));
        space.map_fixed(0x10000, 0x1000).unwrap();
    }

    #[test]
    fn find_free_skips_existing_regions() {
        let space = AddressSpace::new();
        space.map_fixed(0x10000, 0x8000).unwrap();
        space.map_fixed(0x20000, 0x10000).unwrap();

        assert_eq!(space.find_free(0x10000, 0x1000, 0x10000), Some(0x30000));
        assert_eq!(space.find_free(0x10000, 0x1000, 0x1000), Some(0x18000));
    }

    #[test]
    fn read_cstr_stops_at_nul() {
        let space = AddressSpace::new();
        space.map_fixed(0x10000, 0x1000).unwrap();
        space.write(0x10100, b"ntdll.dll\0junk").unwrap();
        assert_eq!(space.read_cstr(0x10100, 64).unwrap(), b"ntdll.dll");
    }
}
