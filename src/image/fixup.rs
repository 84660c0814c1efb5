//! In-place RVA adjustments over tables inside an image.

use crate::memory::{ImageView, RelocationDelta, Result};

/// Turn `count` absolute pointers at `rva` into 32-bit RVAs relative to the
/// view's base. The table is compacted in place: entry `i` is written as a
/// dword at `rva + 4 * i`. Null pointers stay zero.
pub fn fixup_rva_ptrs(view: &ImageView<'_>, rva: u64, count: usize) -> Result<()> {
    let width = view.pointer_width() as u64;
    for i in 0..count as u64 {
        let ptr = view.read_ptr(rva + i * width)?;
        let offset = if ptr != 0 { ptr.wrapping_sub(view.base()) as u32 } else { 0 };
        view.write_u32(rva + i * 4, offset)?;
    }
    Ok(())
}

/// Add `delta` to each non-zero dword of a `count`-entry table.
pub fn fixup_rva_dwords(
    view: &ImageView<'_>,
    rva: u64,
    delta: RelocationDelta,
    count: usize,
) -> Result<()> {
    for i in 0..count as u64 {
        let entry = rva + i * 4;
        let value = view.read_u32(entry)?;
        if value != 0 {
            view.write_u32(entry, delta.apply_u32(value))?;
        }
    }
    Ok(())
}

/// Add `delta` to every by-name entry of a zero-terminated thunk list.
///
/// For the hybrid profile the list is followed by a second one holding the
/// host-side imports, which is adjusted the same way.
pub fn fixup_rva_names(view: &ImageView<'_>, rva: u64, delta: RelocationDelta) -> Result<()> {
    let end = fixup_name_list(view, rva, delta)?;
    if view.profile().is_hybrid() {
        fixup_name_list(view, end + view.pointer_width() as u64, delta)?;
    }
    Ok(())
}

/// Returns the RVA of the terminating entry.
fn fixup_name_list(view: &ImageView<'_>, rva: u64, delta: RelocationDelta) -> Result<u64> {
    let width = view.pointer_width() as u64;
    let flag = view.profile().ordinal_flag();
    let mut entry = rva;
    loop {
        let value = view.read_ptr(entry)?;
        if value == 0 {
            return Ok(entry);
        }
        if value & flag == 0 {
            view.write_ptr(entry, delta.apply_u64(value))?;
        }
        entry += width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AddressSpace;
    use crate::profile::TargetProfile;
    use proptest::prelude::*;

    const BASE: u64 = 0x100000;

    fn space() -> AddressSpace {
        let space = AddressSpace::new();
        space.map_fixed(BASE, 0x4000).unwrap();
        space
    }

    #[test]
    fn ptrs_become_rvas_and_null_stays_null() {
        let space = space();
        let view = ImageView::new(&space, BASE, TargetProfile::X86_64);
        for (i, p) in [BASE + 0x1230, 0, BASE + 0x40].iter().enumerate() {
            view.write_ptr(0x100 + i as u64 * 8, *p).unwrap();
        }

        fixup_rva_ptrs(&view, 0x100, 3).unwrap();

        assert_eq!(view.read_u32(0x100).unwrap(), 0x1230);
        assert_eq!(view.read_u32(0x104).unwrap(), 0);
        assert_eq!(view.read_u32(0x108).unwrap(), 0x40);
    }

    #[test]
    fn names_skip_ordinal_entries() {
        let space = space();
        let view = ImageView::new(&space, BASE, TargetProfile::X86);
        view.write_u32(0x200, 0x500).unwrap();
        view.write_u32(0x204, 0x8000_0007).unwrap();
        view.write_u32(0x208, 0x600).unwrap();
        view.write_u32(0x20c, 0).unwrap();
        view.write_u32(0x210, 0x700).unwrap();

        fixup_rva_names(&view, 0x200, RelocationDelta::new(0x1000)).unwrap();

        assert_eq!(view.read_u32(0x200).unwrap(), 0x1500);
        assert_eq!(view.read_u32(0x204).unwrap(), 0x8000_0007);
        assert_eq!(view.read_u32(0x208).unwrap(), 0x1600);
        // past the terminator: untouched outside the hybrid profile
        assert_eq!(view.read_u32(0x210).unwrap(), 0x700);
    }

    #[test]
    fn hybrid_names_walk_the_second_list() {
        let space = space();
        let view = ImageView::new(&space, BASE, TargetProfile::X86On64);
        view.write_u32(0x200, 0x500).unwrap();
        view.write_u32(0x204, 0).unwrap();
        view.write_u32(0x208, 0x700).unwrap();
        view.write_u32(0x20c, 0x8000_0001).unwrap();
        view.write_u32(0x210, 0).unwrap();

        fixup_rva_names(&view, 0x200, RelocationDelta::new(0x10)).unwrap();

        assert_eq!(view.read_u32(0x200).unwrap(), 0x510);
        assert_eq!(view.read_u32(0x208).unwrap(), 0x710);
        assert_eq!(view.read_u32(0x20c).unwrap(), 0x8000_0001);
    }

    proptest! {
        #[test]
        fn dword_fixup_round_trips(
            table in proptest::collection::vec(
                prop_oneof![Just(0u32), 1u32..0x4000_0000], 1..64),
            delta in 0i64..0x4000_0000,
        ) {
            let space = space();
            let view = ImageView::new(&space, BASE, TargetProfile::X86_64);
            for (i, v) in table.iter().enumerate() {
                view.write_u32(i as u64 * 4, *v).unwrap();
            }

            let d = RelocationDelta::new(delta);
            fixup_rva_dwords(&view, 0, d, table.len()).unwrap();
            fixup_rva_dwords(&view, 0, -d, table.len()).unwrap();

            for (i, v) in table.iter().enumerate() {
                prop_assert_eq!(view.read_u32(i as u64 * 4).unwrap(), *v);
            }
        }
    }
}
