use std::fmt;
use std::str::FromStr;

use goblin::elf::header::{ELFCLASS32, ELFCLASS64};
use goblin::pe::header::{
    COFF_MACHINE_ARM, COFF_MACHINE_ARM64, COFF_MACHINE_ARMNT, COFF_MACHINE_THUMB,
    COFF_MACHINE_X86, COFF_MACHINE_X86_64,
};

/// CPU architecture and bitness the loader emulates images for.
///
/// Everything that differs between architectures (pointer width, ordinal
/// tagging, accepted machine types, launcher names) is derived from this
/// value so that one loader instance can be exercised against any profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetProfile {
    X86,
    X86_64,
    Arm,
    Arm64,
    /// 32-bit images running inside a 64-bit host process.
    X86On64,
}

impl TargetProfile {
    pub const ALL: [TargetProfile; 5] = [
        TargetProfile::X86,
        TargetProfile::X86_64,
        TargetProfile::Arm,
        TargetProfile::Arm64,
        TargetProfile::X86On64,
    ];

    /// Profile matching the architecture this binary was compiled for.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            TargetProfile::X86_64
        } else if cfg!(target_arch = "aarch64") {
            TargetProfile::Arm64
        } else if cfg!(target_arch = "arm") {
            TargetProfile::Arm
        } else {
            TargetProfile::X86
        }
    }

    /// Width in bytes of pointers stored inside images (thunks, export pointers).
    pub const fn pointer_width(self) -> usize {
        match self {
            TargetProfile::X86_64 | TargetProfile::Arm64 => 8,
            TargetProfile::X86 | TargetProfile::Arm | TargetProfile::X86On64 => 4,
        }
    }

    pub const fn is_64bit(self) -> bool {
        self.pointer_width() == 8
    }

    pub const fn is_hybrid(self) -> bool {
        matches!(self, TargetProfile::X86On64)
    }

    /// Top bit of a thunk entry; set when the import is by ordinal.
    pub const fn ordinal_flag(self) -> u64 {
        if self.is_64bit() { 1 << 63 } else { 1 << 31 }
    }

    /// Machine type written into synthesized headers.
    pub const fn machine(self) -> u16 {
        match self {
            TargetProfile::X86 | TargetProfile::X86On64 => COFF_MACHINE_X86,
            TargetProfile::X86_64 => COFF_MACHINE_X86_64,
            TargetProfile::Arm => COFF_MACHINE_ARMNT,
            TargetProfile::Arm64 => COFF_MACHINE_ARM64,
        }
    }

    pub fn is_valid_machine(self, machine: u16) -> bool {
        match self {
            TargetProfile::X86 | TargetProfile::X86On64 => machine == COFF_MACHINE_X86,
            TargetProfile::X86_64 => machine == COFF_MACHINE_X86_64,
            TargetProfile::Arm => matches!(
                machine,
                COFF_MACHINE_ARM | COFF_MACHINE_THUMB | COFF_MACHINE_ARMNT
            ),
            TargetProfile::Arm64 => machine == COFF_MACHINE_ARM64,
        }
    }

    /// ELF class of the shared objects backing builtins. The hybrid profile
    /// runs on a 64-bit host, so its native libraries are 64-bit.
    pub const fn host_elf_class(self) -> u8 {
        match self {
            TargetProfile::X86 | TargetProfile::Arm => ELFCLASS32,
            _ => ELFCLASS64,
        }
    }

    /// Suffix of the launcher binary that runs images for this profile.
    pub const fn loader_suffix(self) -> &'static str {
        match self {
            TargetProfile::X86_64 | TargetProfile::Arm64 => "64",
            TargetProfile::X86On64 => "32on64",
            TargetProfile::X86 | TargetProfile::Arm => "",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TargetProfile::X86 => "x86",
            TargetProfile::X86_64 => "x86_64",
            TargetProfile::Arm => "arm",
            TargetProfile::Arm64 => "arm64",
            TargetProfile::X86On64 => "x86on64",
        }
    }
}

impl fmt::Display for TargetProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown target profile {0:?}")]
pub struct UnknownProfile(String);

impl FromStr for TargetProfile {
    type Err = UnknownProfile;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetProfile::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownProfile(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_profile_uses_narrow_pointers_on_wide_host() {
        let p = TargetProfile::X86On64;
        assert_eq!(p.pointer_width(), 4);
        assert_eq!(p.ordinal_flag(), 0x8000_0000);
        assert_eq!(p.host_elf_class(), ELFCLASS64);
        assert!(p.is_valid_machine(COFF_MACHINE_X86));
        assert!(!p.is_valid_machine(COFF_MACHINE_X86_64));
    }

    #[test]
    fn arm_accepts_all_thumb_variants() {
        for m in [COFF_MACHINE_ARM, COFF_MACHINE_THUMB, COFF_MACHINE_ARMNT] {
            assert!(TargetProfile::Arm.is_valid_machine(m));
        }
        assert!(!TargetProfile::Arm.is_valid_machine(COFF_MACHINE_ARM64));
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("X86_64".parse::<TargetProfile>().unwrap(), TargetProfile::X86_64);
        assert_eq!("x86on64".parse::<TargetProfile>().unwrap(), TargetProfile::X86On64);
        assert!("mips".parse::<TargetProfile>().is_err());
    }
}
