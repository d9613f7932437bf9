//! Raw PE/COFF on-disk structures.
//!
//! Only the fields the loader actually consumes are parsed; offsets follow
//! the PE32/PE32+ layouts in the PE specification. All reads are
//! little-endian through `scroll`.

use scroll::Pread;

use super::PeError;

pub const DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const DOS_LFANEW_OFFSET: usize = 0x3C;

pub const MACHINE_I386: u16 = 0x014C;
pub const MACHINE_AMD64: u16 = 0x8664;
pub const MACHINE_ARM64: u16 = 0xAA64;

pub const MAGIC_PE32: u16 = 0x010B;
pub const MAGIC_PE64: u16 = 0x020B;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub const CURRENT_MACHINE: u16 = MACHINE_AMD64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub const CURRENT_MACHINE: u16 = MACHINE_ARM64;
    } else {
        pub const CURRENT_MACHINE: u16 = MACHINE_I386;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const CURRENT_MAGIC: u16 = MAGIC_PE64;
    } else {
        pub const CURRENT_MAGIC: u16 = MAGIC_PE32;
    }
}

pub const NUM_DATA_DIRECTORIES: usize = 16;
pub const DIRECTORY_EXPORT: usize = 0;
pub const DIRECTORY_IMPORT: usize = 1;
pub const DIRECTORY_BASE_RELOCATION: usize = 5;
pub const DIRECTORY_GLOBAL_PTR: usize = 8;

pub const RELOCATION_ABSOLUTE: u16 = 0;
pub const RELOCATION_HIGHLOW: u16 = 3;
pub const RELOCATION_DIR64: u16 = 10;

pub const IMPORT_ORDINAL_32: u32 = 0x8000_0000;
pub const IMPORT_ORDINAL_64: u64 = 0x8000_0000_0000_0000;
pub const IMPORT_NAMEMASK: u32 = 0x7FFF_FFFF;

pub const SECTION_HEADER_SIZE: usize = 40;
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;
pub const EXPORT_DIRECTORY_SIZE: usize = 40;

bitflags::bitflags! {
    /// Section characteristics honored by the loader.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CODE    = 0x0000_0020;
        const DATA    = 0x0000_0040;
        const BSS     = 0x0000_0080;
        const EXECUTE = 0x2000_0000;
        const READ    = 0x4000_0000;
        const WRITE   = 0x8000_0000;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub size_of_optional_header: u16,
}

impl CoffHeader {
    /// `offset` points at the COFF header (right after the PE signature).
    pub fn parse(buffer: &[u8], offset: usize) -> Result<CoffHeader, PeError> {
        Ok(CoffHeader {
            machine: buffer.pread_with(offset, scroll::LE)?,
            number_of_sections: buffer.pread_with(offset + 2, scroll::LE)?,
            size_of_optional_header: buffer.pread_with(offset + 16, scroll::LE)?,
        })
    }

    pub const SIZE: usize = 20;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct OptionalHeader {
    pub magic: u16,
    pub address_of_entry_point: u32,
    pub image_base: u64,
    pub size_of_headers: u32,
    pub directories: [DataDirectory; NUM_DATA_DIRECTORIES],
    /// Parsed byte size of the optional header including directories; the
    /// section table follows immediately.
    pub parsed_size: usize,
}

impl OptionalHeader {
    pub fn parse(buffer: &[u8], offset: usize) -> Result<OptionalHeader, PeError> {
        let magic: u16 = buffer.pread_with(offset, scroll::LE)?;
        let (image_base, directories_offset) = match magic {
            MAGIC_PE32 => {
                let base: u32 = buffer.pread_with(offset + 28, scroll::LE)?;
                (base as u64, offset + 96)
            }
            MAGIC_PE64 => {
                let base: u64 = buffer.pread_with(offset + 24, scroll::LE)?;
                (base, offset + 112)
            }
            other => return Err(PeError::WrongArch(other)),
        };

        let mut directories = [DataDirectory::default(); NUM_DATA_DIRECTORIES];
        for (index, directory) in directories.iter_mut().enumerate() {
            let at = directories_offset + index * 8;
            directory.virtual_address = buffer.pread_with(at, scroll::LE)?;
            directory.size = buffer.pread_with(at + 4, scroll::LE)?;
        }

        Ok(OptionalHeader {
            magic,
            address_of_entry_point: buffer.pread_with(offset + 16, scroll::LE)?,
            image_base,
            size_of_headers: buffer.pread_with(offset + 60, scroll::LE)?,
            directories,
            parsed_size: directories_offset - offset + NUM_DATA_DIRECTORIES * 8,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: SectionFlags,
}

impl SectionHeader {
    pub fn parse(buffer: &[u8], offset: usize) -> Result<SectionHeader, PeError> {
        let mut name = [0u8; 8];
        name.copy_from_slice(
            buffer
                .get(offset..offset + 8)
                .ok_or(PeError::InvalidImage("section header out of bounds"))?,
        );
        let raw_flags: u32 = buffer.pread_with(offset + 36, scroll::LE)?;
        Ok(SectionHeader {
            name,
            virtual_size: buffer.pread_with(offset + 8, scroll::LE)?,
            virtual_address: buffer.pread_with(offset + 12, scroll::LE)?,
            size_of_raw_data: buffer.pread_with(offset + 16, scroll::LE)?,
            pointer_to_raw_data: buffer.pread_with(offset + 20, scroll::LE)?,
            characteristics: SectionFlags::from_bits_retain(raw_flags),
        })
    }

    pub fn display_name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// One entry of the import directory table.
#[derive(Debug, Clone, Copy)]
pub struct ImportDescriptor {
    pub import_lookup_table: u32,
    pub module_name: u32,
    pub import_address_table: u32,
}

impl ImportDescriptor {
    pub fn parse(raw: &[u8]) -> Result<ImportDescriptor, PeError> {
        Ok(ImportDescriptor {
            import_lookup_table: raw.pread_with(0, scroll::LE)?,
            module_name: raw.pread_with(12, scroll::LE)?,
            import_address_table: raw.pread_with(16, scroll::LE)?,
        })
    }

    pub fn is_terminator(&self) -> bool {
        self.import_address_table == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExportDirectory {
    pub ordinal_base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_ordinals: u32,
}

impl ExportDirectory {
    pub fn parse(raw: &[u8]) -> Result<ExportDirectory, PeError> {
        Ok(ExportDirectory {
            ordinal_base: raw.pread_with(16, scroll::LE)?,
            number_of_functions: raw.pread_with(20, scroll::LE)?,
            number_of_names: raw.pread_with(24, scroll::LE)?,
            address_of_functions: raw.pread_with(28, scroll::LE)?,
            address_of_names: raw.pread_with(32, scroll::LE)?,
            address_of_ordinals: raw.pread_with(36, scroll::LE)?,
        })
    }
}

/// Basic structural validation of a candidate image buffer; everything the
/// loader touches later is bounds-checked again on access.
pub fn validate_image_buffer(buffer: &[u8]) -> Result<(), PeError> {
    if buffer.len() < 0x40 {
        return Err(PeError::InvalidImage("buffer smaller than a DOS header"));
    }
    let dos_signature: u16 = buffer.pread_with(0, scroll::LE)?;
    if dos_signature != DOS_SIGNATURE {
        return Err(PeError::InvalidImage("missing MZ signature"));
    }
    let pe_offset: u32 = buffer.pread_with(DOS_LFANEW_OFFSET, scroll::LE)?;
    let pe_signature: u32 = buffer.pread_with(pe_offset as usize, scroll::LE)?;
    if pe_signature != PE_SIGNATURE {
        return Err(PeError::InvalidImage("missing PE signature"));
    }
    Ok(())
}
