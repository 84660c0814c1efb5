//! Field offsets of the PE structures the loader reads and writes.
//!
//! Only the fields touched by header synthesis and import/export
//! resolution are listed. All offsets are relative to the start of the
//! structure they belong to.

use crate::profile::TargetProfile;

pub use goblin::pe::header::{DOS_MAGIC, PE_MAGIC};
pub use goblin::pe::section_table::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE,
};

pub const OPTIONAL_MAGIC_PE32: u16 = 0x10b;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20b;

/// Marker stored right after the DOS header of every builtin image.
pub const BUILTIN_SIGNATURE: [u8; 32] = *b"pebridge builtin module\0\0\0\0\0\0\0\0\0";

pub mod dos {
    pub const SIZE: u64 = 64;
    pub const E_MAGIC: u64 = 0;
    pub const E_CBLP: u64 = 2;
    pub const E_CP: u64 = 4;
    pub const E_CPARHDR: u64 = 8;
    pub const E_MINALLOC: u64 = 10;
    pub const E_MAXALLOC: u64 = 12;
    pub const E_SS: u64 = 14;
    pub const E_SP: u64 = 16;
    pub const E_LFANEW: u64 = 60;
}

pub mod file_header {
    pub const MACHINE: u64 = 0;
    pub const NUMBER_OF_SECTIONS: u64 = 2;
    pub const SIZE: u64 = 20;
}

/// Offsets inside the NT headers (signature + file header + optional header).
pub mod nt {
    pub const SIGNATURE: u64 = 0;
    pub const FILE_HEADER: u64 = 4;
    pub const OPTIONAL_HEADER: u64 = FILE_HEADER + super::file_header::SIZE;
}

/// Optional header fields, relative to the optional header.
pub mod optional {
    pub const MAGIC: u64 = 0;
    pub const SIZE_OF_CODE: u64 = 4;
    pub const SIZE_OF_INITIALIZED_DATA: u64 = 8;
    pub const SIZE_OF_UNINITIALIZED_DATA: u64 = 12;
    pub const ADDRESS_OF_ENTRY_POINT: u64 = 16;
    pub const BASE_OF_CODE: u64 = 20;
    /// PE32 only.
    pub const BASE_OF_DATA: u64 = 24;
    pub const SECTION_ALIGNMENT: u64 = 32;
    pub const SIZE_OF_IMAGE: u64 = 56;
}

/// Layout differences between PE32 and PE32+ optional headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalLayout {
    pub magic: u16,
    pub image_base: u64,
    pub number_of_rva_and_sizes: u64,
    pub data_directory: u64,
    pub size: u64,
}

impl OptionalLayout {
    pub const PE32: OptionalLayout = OptionalLayout {
        magic: OPTIONAL_MAGIC_PE32,
        image_base: 28,
        number_of_rva_and_sizes: 92,
        data_directory: 96,
        size: 224,
    };

    pub const PE32_PLUS: OptionalLayout = OptionalLayout {
        magic: OPTIONAL_MAGIC_PE32_PLUS,
        image_base: 24,
        number_of_rva_and_sizes: 108,
        data_directory: 112,
        size: 240,
    };

    pub const fn for_profile(profile: TargetProfile) -> Self {
        if profile.is_64bit() { Self::PE32_PLUS } else { Self::PE32 }
    }

    pub const fn nt_headers_size(&self) -> u64 {
        nt::OPTIONAL_HEADER + self.size
    }

    pub const fn is_64bit(&self) -> bool {
        self.magic == OPTIONAL_MAGIC_PE32_PLUS
    }
}

pub const NUMBER_OF_DIRECTORY_ENTRIES: u32 = 16;
pub const DATA_DIRECTORY_SIZE: u64 = 8;

/// Data directory indices.
pub mod directory {
    pub const EXPORT: u32 = 0;
    pub const IMPORT: u32 = 1;
    pub const RESOURCE: u32 = 2;
}

pub mod section {
    pub const SIZE: u64 = 40;
    pub const NAME: u64 = 0;
    pub const VIRTUAL_SIZE: u64 = 8;
    pub const VIRTUAL_ADDRESS: u64 = 12;
    pub const SIZE_OF_RAW_DATA: u64 = 16;
    pub const POINTER_TO_RAW_DATA: u64 = 20;
    pub const CHARACTERISTICS: u64 = 36;
}

pub mod import_descriptor {
    pub const SIZE: u64 = 20;
    pub const ORIGINAL_FIRST_THUNK: u64 = 0;
    pub const NAME: u64 = 12;
    pub const FIRST_THUNK: u64 = 16;
}

pub mod export_directory {
    pub const SIZE: u64 = 40;
    pub const NAME: u64 = 12;
    pub const BASE: u64 = 16;
    pub const NUMBER_OF_FUNCTIONS: u64 = 20;
    pub const NUMBER_OF_NAMES: u64 = 24;
    pub const ADDRESS_OF_FUNCTIONS: u64 = 28;
    pub const ADDRESS_OF_NAMES: u64 = 32;
    pub const ADDRESS_OF_NAME_ORDINALS: u64 = 36;
}

pub mod resource {
    pub const DIRECTORY_SIZE: u64 = 16;
    pub const NUMBER_OF_NAMED_ENTRIES: u64 = 12;
    pub const NUMBER_OF_ID_ENTRIES: u64 = 14;
    pub const ENTRY_SIZE: u64 = 8;
    pub const ENTRY_OFFSET_TO_DATA: u64 = 4;
    pub const DATA_IS_DIRECTORY: u32 = 0x8000_0000;
    /// Offset of `OffsetToData` inside a resource data entry.
    pub const DATA_OFFSET_TO_DATA: u64 = 0;
}

/// Offset of the NT headers in a synthesized image.
pub const SYNTHETIC_NT_OFFSET: u64 = dos::SIZE + BUILTIN_SIGNATURE.len() as u64;

/// Bytes needed for the synthesized DOS header, signature, NT headers and
/// `sections` section headers.
pub const fn synthetic_header_size(layout: &OptionalLayout, sections: u64) -> u64 {
    SYNTHETIC_NT_OFFSET + layout.nt_headers_size() + sections * section::SIZE
}
