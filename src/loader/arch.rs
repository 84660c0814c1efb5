//! Word-size checks for native shared objects.

use goblin::elf::header::{
    ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFDATA2MSB, ELFMAG, EI_CLASS, EI_DATA, EI_VERSION,
    EV_CURRENT,
};
use goblin::mach::header::{MH_MAGIC, MH_MAGIC_64};

use crate::profile::TargetProfile;

/// Bytes of a file [`check_library_arch`] wants to see.
pub const HEADER_LEN: usize = 8;

/// `CPU_ARCH_ABI64` in a Mach-O cputype.
const CPU_ARCH_ABI64: u32 = 0x0100_0000;

const HOST_DATA: u8 = if cfg!(target_endian = "big") {
    ELFDATA2MSB
} else {
    ELFDATA2LSB
};

/// Whether a shared object with this header can back a builtin for
/// `profile`.
///
/// Only a well-formed ELF or Mach-O header of the wrong word size is
/// rejected; short or unrecognised headers pass and fail later, when the
/// library is actually opened.
pub fn check_library_arch(header: &[u8], profile: TargetProfile) -> bool {
    let want_64 = profile.host_elf_class() == ELFCLASS64;

    if header.len() >= 8 {
        let magic = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        if magic == MH_MAGIC || magic == MH_MAGIC_64 {
            let cputype = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
            return (cputype & CPU_ARCH_ABI64 != 0) == want_64;
        }
    }

    if header.len() <= EI_VERSION || &header[..ELFMAG.len()] != ELFMAG {
        return true;
    }
    if header[EI_VERSION] != EV_CURRENT || header[EI_DATA] != HOST_DATA {
        return true;
    }
    match header[EI_CLASS] {
        ELFCLASS32 => !want_64,
        ELFCLASS64 => want_64,
        _ => true,
    }
}
