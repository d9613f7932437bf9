//! Base relocations and MinGW-style runtime pseudo-relocations.

use log::{error, trace};

use crate::memory::MemorySpaceHandle;

use super::format::{self, DataDirectory};
use super::loader::PeImage;
use super::PeError;

const RP_VERSION_1: u32 = 0;
const RP_VERSION_2: u32 = 1;

/// Walk the base-relocation directory and add the image delta to every
/// HIGHLOW/DIR64 fixup. A zero delta skips the whole directory.
pub(super) fn apply_base_relocations(
    image: &PeImage,
    space: &MemorySpaceHandle,
    directory: DataDirectory,
) -> Result<(), PeError> {
    let delta = image.virtual_address.wrapping_sub(image.original_image_base) as i64;
    trace!(
        "apply_base_relocations(size={}, delta={delta:#x})",
        directory.size
    );
    if delta == 0 {
        return Ok(());
    }

    let mut space = space.lock().unwrap();
    let directory_base = image.virtual_address + directory.virtual_address as u64;
    let mut offset = 0u64;
    while offset < directory.size as u64 {
        let page_rva = space.read_u32(directory_base + offset)?;
        let block_size = space.read_u32(directory_base + offset + 4)?;
        if page_rva == 0 || block_size == 0 {
            error!("relocation block header is zero (offset {offset:#x})");
            return Err(PeError::InvalidImage("zero relocation block header"));
        }
        if block_size as u64 > directory.size as u64 - offset {
            error!("relocation block exceeds the directory, bailing");
            return Err(PeError::InvalidImage("oversized relocation block"));
        }

        let count = (block_size - 8) / 2;
        for index in 0..count as u64 {
            let entry = space.read_u16(directory_base + offset + 8 + 2 * index)?;
            let kind = entry >> 12;
            let value = entry & 0x0FFF;
            let target = image.virtual_address + page_rva as u64 + value as u64;

            match kind {
                format::RELOCATION_HIGHLOW => {
                    let old = space.read_u32(target)?;
                    space.write_u32(target, old.wrapping_add(delta as u32))?;
                }
                format::RELOCATION_DIR64 => {
                    let old = space.read_u64(target)?;
                    space.write_u64(target, old.wrapping_add(delta as u64))?;
                }
                format::RELOCATION_ABSOLUTE => {
                    // Alignment padding terminates the block.
                    break;
                }
                other => {
                    error!("unsupported relocation type {other}");
                    return Err(PeError::UnsupportedRelocation(other));
                }
            }
        }
        offset += block_size as u64;
    }
    Ok(())
}

/// Handle the Global-Ptr directory carrying runtime pseudo-relocations.
///
/// With the `{0, 0, version}` header present the entry format is selected
/// by version; a headerless directory is treated as a v1 entry list.
pub(super) fn apply_runtime_relocations(
    image: &PeImage,
    space: &MemorySpaceHandle,
    directory: DataDirectory,
) -> Result<(), PeError> {
    trace!("apply_runtime_relocations(size={})", directory.size);
    if directory.size < 8 {
        return Err(PeError::InvalidImage("runtime-relocation directory too small"));
    }

    let directory_base = image.virtual_address + directory.virtual_address as u64;
    let directory_end = directory_base + directory.size as u64;

    let space_guard = space.lock().unwrap();
    let magic0 = space_guard.read_u32(directory_base)?;
    let magic1 = space_guard.read_u32(directory_base + 4)?;
    drop(space_guard);

    if directory.size >= 12 && magic0 == 0 && magic1 == 0 {
        let version = space.lock().unwrap().read_u32(directory_base + 8)?;
        let entries = directory_base + 12;
        return match version {
            RP_VERSION_1 => relocate_v1(image, space, entries, directory_end),
            RP_VERSION_2 => relocate_v2(image, space, entries, directory_end),
            _ => Err(PeError::InvalidImage("unknown runtime-relocation version")),
        };
    }
    relocate_v1(image, space, directory_base, directory_end)
}

/// V1: `(value, offset)` pairs adding `value` to the word at `offset`.
fn relocate_v1(
    image: &PeImage,
    space: &MemorySpaceHandle,
    start: u64,
    end: u64,
) -> Result<(), PeError> {
    let mut space = space.lock().unwrap();
    let mut cursor = start;
    while cursor + 8 <= end {
        let value = space.read_u32(cursor)?;
        let offset = space.read_u32(cursor + 4)?;
        let target = image.virtual_address + offset as u64;

        if image.is_64() {
            let old = space.read_u64(target)?;
            space.write_u64(target, old.wrapping_add(value as u64))?;
        } else {
            let old = space.read_u32(target)?;
            space.write_u32(target, old.wrapping_add(value))?;
        }
        cursor += 8;
    }
    Ok(())
}

/// V2: `(symbol_rva, offset_rva, flags)` with the fixup width encoded in the
/// low byte of `flags`. The existing target is read sign-extended,
/// rebased from `virtual_address + symbol_rva` to the resolved symbol value
/// and written back truncated.
fn relocate_v2(
    image: &PeImage,
    space: &MemorySpaceHandle,
    start: u64,
    end: u64,
) -> Result<(), PeError> {
    let mut space = space.lock().unwrap();
    let mut cursor = start;
    while cursor + 12 <= end {
        let symbol_rva = space.read_u32(cursor)?;
        let offset_rva = space.read_u32(cursor + 4)?;
        let flags = space.read_u32(cursor + 8)?;
        let width = (flags & 0xFF) as u8;

        let target = image.virtual_address + offset_rva as u64;
        let symbol_address = image.virtual_address + symbol_rva as u64;
        let symbol_value = if image.is_64() {
            space.read_u64(symbol_address)? as i64
        } else {
            space.read_u32(symbol_address)? as i32 as i64
        };

        let mut data: i64 = match width {
            8 => space.read_u8(target)? as i8 as i64,
            16 => space.read_u16(target)? as i16 as i64,
            32 => {
                if image.is_64() {
                    space.read_u32(target)? as i32 as i64
                } else {
                    space.read_u32(target)? as i64
                }
            }
            64 if image.is_64() => space.read_u64(target)? as i64,
            other => {
                error!("invalid runtime-relocation size {other}");
                return Err(PeError::InvalidImage("invalid runtime-relocation size"));
            }
        };

        data -= (image.virtual_address + symbol_rva as u64) as i64;
        data += symbol_value;

        match width {
            8 => space.write_u8(target, data as u8)?,
            16 => space.write_u16(target, data as u16)?,
            32 => space.write_u32(target, data as u32)?,
            64 => space.write_u64(target, data as u64)?,
            _ => unreachable!(),
        }
        cursor += 12;
    }
    Ok(())
}
