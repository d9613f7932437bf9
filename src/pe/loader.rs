//! Image loading, linking and unloading.

use log::{error, trace, warn};

use crate::handles::{ImageId, ProcessId};
use crate::memory::{MapFlags, MemorySpace, MemorySpaceHandle, PAGE_SIZE};
use crate::mstring::{CompareResult, MString};

use super::format::{
    self, CoffHeader, DataDirectory, ImportDescriptor, OptionalHeader, SectionHeader,
};
use super::relocations;
use super::{FileProvider, PeError};

/// Base address handed to images loaded without a parent.
pub const PE_LOAD_BASE: u64 = 0x40_0000;

#[derive(Debug, Clone)]
pub struct ExportedFunction {
    pub ordinal: u32,
    pub address: u64,
    pub name: Option<String>,
    /// Address pointed into the export directory itself; the name is the
    /// forward target and resolution happens on first call.
    pub forwarded: bool,
}

/// Where a section ended up inside the address space.
#[derive(Debug, Clone, Copy)]
pub struct SectionMapping {
    pub rva: u32,
    pub size: u64,
    pub virtual_base: u64,
}

pub struct PeImage {
    pub id: ImageId,
    pub owner: ProcessId,
    pub name: MString,
    pub full_path: MString,
    /// Optional-header magic; PE32 or PE32+.
    pub architecture: u16,
    pub virtual_address: u64,
    pub original_image_base: u64,
    pub code_base: u64,
    pub code_size: u32,
    pub entry_address: u64,
    pub next_load_address: u64,
    pub references: i32,
    pub space: MemorySpaceHandle,
    pub exports: Vec<ExportedFunction>,
    pub libraries: Vec<ImageId>,
    pub sections: Vec<SectionMapping>,
    /// Regions to tear down on unload.
    mapped: Vec<(u64, u64)>,
}

impl PeImage {
    pub fn is_64(&self) -> bool {
        self.architecture == format::MAGIC_PE64
    }

    pub fn find_export(&self, name: &str) -> Option<&ExportedFunction> {
        self.exports
            .iter()
            .find(|export| export.name.as_deref() == Some(name))
    }

    pub fn find_export_by_ordinal(&self, ordinal: u32) -> Option<&ExportedFunction> {
        self.exports.iter().find(|export| export.ordinal == ordinal)
    }
}

pub struct PeLoader {
    provider: Box<dyn FileProvider>,
    images: Vec<Option<PeImage>>,
}

impl PeLoader {
    pub fn new(provider: Box<dyn FileProvider>) -> Self {
        PeLoader {
            provider,
            images: Vec::new(),
        }
    }

    pub fn image(&self, id: ImageId) -> Result<&PeImage, PeError> {
        self.images
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PeError::UnknownImage)
    }

    pub fn image_mut(&mut self, id: ImageId) -> Result<&mut PeImage, PeError> {
        self.images
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(PeError::UnknownImage)
    }

    fn insert(&mut self, mut image: PeImage) -> ImageId {
        for (index, slot) in self.images.iter_mut().enumerate() {
            if slot.is_none() {
                let id = ImageId(index as u32);
                image.id = id;
                *slot = Some(image);
                return id;
            }
        }
        let id = ImageId(self.images.len() as u32);
        image.id = id;
        self.images.push(Some(image));
        id
    }

    /// Load `path` (and its import closure) for `owner`. With a parent the
    /// image lands at the parent's next loading address inside the parent's
    /// address space; without one it gets a fresh space at the platform
    /// base.
    pub fn load_image(
        &mut self,
        owner: ProcessId,
        parent: Option<ImageId>,
        path: &MString,
    ) -> Result<ImageId, PeError> {
        let parent_path = match parent {
            Some(id) => Some(self.image(id)?.full_path.clone()),
            None => None,
        };
        let full_path = resolve_path(parent_path.as_ref(), path);
        trace!("load_image(path={path}, full={full_path})");

        let buffer = self
            .provider
            .load_file(&full_path)
            .ok_or_else(|| PeError::FileNotFound(full_path.to_string()))?;
        format::validate_image_buffer(&buffer)?;

        let pe_offset = {
            use scroll::Pread;
            let value: u32 = buffer.pread_with(format::DOS_LFANEW_OFFSET, scroll::LE)?;
            value as usize
        };
        let coff = CoffHeader::parse(&buffer, pe_offset + 4)?;
        if coff.machine != format::CURRENT_MACHINE {
            error!(
                "image was built for machine {:#x}, not the current machine",
                coff.machine
            );
            return Err(PeError::WrongMachine(coff.machine));
        }

        let optional_offset = pe_offset + 4 + CoffHeader::SIZE;
        let optional = OptionalHeader::parse(&buffer, optional_offset)?;
        if optional.magic != format::CURRENT_MAGIC {
            error!(
                "image was built for architecture {:#x}, not the current architecture",
                optional.magic
            );
            return Err(PeError::WrongArch(optional.magic));
        }
        let section_table = optional_offset + optional.parsed_size;

        let (virtual_address, space) = match parent {
            Some(id) => {
                let parent_image = self.image(id)?;
                (parent_image.next_load_address, parent_image.space.clone())
            }
            None => (PE_LOAD_BASE, MemorySpace::new_handle()),
        };

        let name = match full_path.find_reverse('/' as u32) {
            Some(index) => full_path.substring(index + 1, -1),
            None => full_path.clone(),
        };
        warn!("{name}: loading at {virtual_address:#x}");

        let entry_address = if optional.address_of_entry_point != 0 {
            virtual_address + optional.address_of_entry_point as u64
        } else {
            0
        };

        let id = self.insert(PeImage {
            id: ImageId::INVALID,
            owner,
            name,
            full_path,
            architecture: optional.magic,
            virtual_address,
            original_image_base: optional.image_base,
            code_base: 0,
            code_size: 0,
            entry_address,
            next_load_address: 0,
            references: 1,
            space,
            exports: Vec::new(),
            libraries: Vec::new(),
            sections: Vec::new(),
            mapped: Vec::new(),
        });
        if let Some(parent_id) = parent {
            self.image_mut(parent_id)?.libraries.push(id);
        }

        match self.parse_and_map(parent, id, &buffer, &coff, &optional, section_table) {
            Ok(()) => Ok(id),
            Err(err) => {
                error!("{err}");
                let _ = self.unload_library(parent, id);
                Err(err)
            }
        }
    }

    fn parse_and_map(
        &mut self,
        parent: Option<ImageId>,
        id: ImageId,
        buffer: &[u8],
        coff: &CoffHeader,
        optional: &OptionalHeader,
        section_table: usize,
    ) -> Result<(), PeError> {
        let (virtual_address, space) = {
            let image = self.image(id)?;
            (image.virtual_address, image.space.clone())
        };

        // Map the image metadata read-only at the base address.
        let header_size = optional.size_of_headers as u64;
        let header_copy = (optional.size_of_headers as usize).min(buffer.len());
        {
            let mut space = space.lock().unwrap();
            space
                .map(virtual_address, header_size, MapFlags::READ)
                .map_err(|_| PeError::MappingFailed("headers".to_string()))?;
            space.write(virtual_address, &buffer[..header_copy])?;
        }
        self.image_mut(id)?.mapped.push((virtual_address, header_size));

        let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
        let mut current_address = virtual_address;
        let mut code_base = 0u64;
        let mut code_size = 0u32;
        for index in 0..coff.number_of_sections as usize {
            let section =
                SectionHeader::parse(buffer, section_table + index * format::SECTION_HEADER_SIZE)?;
            let destination = virtual_address + section.virtual_address as u64;
            let size = section.size_of_raw_data.max(section.virtual_size) as u64;

            let mut flags = MapFlags::READ;
            if section.characteristics.contains(format::SectionFlags::EXECUTE) {
                flags |= MapFlags::EXECUTE;
            }
            if section.characteristics.contains(format::SectionFlags::WRITE) {
                flags |= MapFlags::WRITE;
            }

            {
                let mut space = space.lock().unwrap();
                space.map(destination, size, flags).map_err(|err| {
                    error!(
                        "failed to map section {} at {destination:#x}: {err}",
                        section.display_name()
                    );
                    PeError::MappingFailed(section.display_name())
                })?;

                let is_bss = section.size_of_raw_data == 0
                    || section.characteristics.contains(format::SectionFlags::BSS);
                if is_bss {
                    trace!(
                        "section({index}, {}): clearing {} bytes at {destination:#x}",
                        section.display_name(),
                        section.virtual_size
                    );
                    // Regions map zero-filled.
                } else if section
                    .characteristics
                    .intersects(format::SectionFlags::CODE | format::SectionFlags::DATA)
                {
                    let start = section.pointer_to_raw_data as usize;
                    let end = start + section.size_of_raw_data as usize;
                    let raw = buffer
                        .get(start..end)
                        .ok_or(PeError::InvalidImage("section data out of bounds"))?;
                    trace!(
                        "section({index}, {}): copying {} bytes to {destination:#x}",
                        section.display_name(),
                        raw.len()
                    );
                    space.write(destination, raw)?;
                }
            }

            if section.characteristics.contains(format::SectionFlags::CODE) && code_base == 0 {
                code_base = destination;
                code_size = section.virtual_size;
            }

            sections.push(SectionMapping {
                rva: section.virtual_address,
                size,
                virtual_base: destination,
            });
            self.image_mut(id)?.mapped.push((destination, size));
            current_address = destination + size;
        }

        // The next free loading address is page-aligned past the highest
        // mapped section.
        if current_address % PAGE_SIZE != 0 {
            current_address += PAGE_SIZE - current_address % PAGE_SIZE;
        }
        {
            let image = self.image_mut(id)?;
            image.sections = sections;
            image.code_base = code_base;
            image.code_size = code_size;
        }
        match parent {
            Some(parent_id) => self.image_mut(parent_id)?.next_load_address = current_address,
            None => self.image_mut(id)?.next_load_address = current_address,
        }

        // Data directories, in fixed order: base relocations first so every
        // later directory reads fixed-up memory, then exports so imports of
        // siblings can resolve, then imports, then the runtime
        // pseudo-relocations that patch around the resolved imports.
        let directories = &optional.directories;
        let relocation = directories[format::DIRECTORY_BASE_RELOCATION];
        if relocation.virtual_address != 0 && relocation.size != 0 {
            relocations::apply_base_relocations(self.image(id)?, &space, relocation)?;
        }
        let export = directories[format::DIRECTORY_EXPORT];
        if export.virtual_address != 0 && export.size != 0 {
            self.handle_exports(parent, id, &space, export)?;
        }
        let import = directories[format::DIRECTORY_IMPORT];
        if import.virtual_address != 0 && import.size != 0 {
            self.handle_imports(parent, id, &space, import)?;
        }
        let global = directories[format::DIRECTORY_GLOBAL_PTR];
        if global.virtual_address != 0 && global.size != 0 {
            relocations::apply_runtime_relocations(self.image(id)?, &space, global)?;
        }
        Ok(())
    }

    fn handle_exports(
        &mut self,
        parent: Option<ImageId>,
        id: ImageId,
        space: &MemorySpaceHandle,
        directory: DataDirectory,
    ) -> Result<(), PeError> {
        let (virtual_address, code_base) = {
            let image = self.image(id)?;
            (image.virtual_address, image.code_base)
        };
        let load_ceiling = match parent {
            Some(parent_id) => self.image(parent_id)?.next_load_address,
            None => self.image(id)?.next_load_address,
        };

        let space = space.lock().unwrap();
        let directory_base = virtual_address + directory.virtual_address as u64;
        let mut raw = vec![0u8; format::EXPORT_DIRECTORY_SIZE];
        space.read(directory_base, &mut raw)?;
        let table = format::ExportDirectory::parse(&raw)?;
        if table.address_of_functions == 0 {
            warn!("export table present, but the function address table is zero");
            return Err(PeError::InvalidImage("export directory without functions"));
        }

        let directory_end = directory_base + directory.size as u64;
        let count = table.number_of_names as usize;
        trace!("number of exports to iterate: {count}");

        let mut exports = Vec::with_capacity(count);
        for index in 0..count {
            let name_rva =
                space.read_u32(virtual_address + table.address_of_names as u64 + 4 * index as u64)?;
            let ordinal_raw = space
                .read_u16(virtual_address + table.address_of_ordinals as u64 + 2 * index as u64)?;
            let ordinal = (ordinal_raw as u32).wrapping_sub(table.ordinal_base);
            if ordinal >= table.number_of_functions {
                return Err(PeError::InvalidImage("export ordinal out of range"));
            }
            let function_rva = space
                .read_u32(virtual_address + table.address_of_functions as u64 + 4 * ordinal as u64)?;
            let address = virtual_address + function_rva as u64;

            let forwarded = address >= directory_base && address < directory_end;
            if !forwarded && !(address >= code_base && address < load_ceiling) {
                error!(
                    "export {index} at {address:#x} lies outside the image code boundaries \
                     ({code_base:#x} => {load_ceiling:#x})"
                );
                return Err(PeError::InvalidImage("export outside the image"));
            }

            let name_address = if forwarded {
                // The address table entry holds the forward string.
                address
            } else {
                virtual_address + name_rva as u64
            };
            let name_bytes = space.read_cstring(name_address)?;
            exports.push(ExportedFunction {
                ordinal,
                address,
                name: Some(String::from_utf8_lossy(&name_bytes).into_owned()),
                forwarded,
            });
        }
        drop(space);

        self.image_mut(id)?.exports = exports;
        Ok(())
    }

    fn handle_imports(
        &mut self,
        parent: Option<ImageId>,
        id: ImageId,
        space: &MemorySpaceHandle,
        directory: DataDirectory,
    ) -> Result<(), PeError> {
        // Library resolution always runs against the root of the load; its
        // next loading address is the bump allocator for the whole closure.
        let root = parent.unwrap_or(id);
        let (virtual_address, is_64) = {
            let image = self.image(id)?;
            (image.virtual_address, image.is_64())
        };

        let mut descriptor_address = virtual_address + directory.virtual_address as u64;
        loop {
            let descriptor = {
                let space = space.lock().unwrap();
                let mut raw = vec![0u8; format::IMPORT_DESCRIPTOR_SIZE];
                space.read(descriptor_address, &mut raw)?;
                ImportDescriptor::parse(&raw)?
            };
            if descriptor.is_terminator() {
                break;
            }

            let module_name = {
                let space = space.lock().unwrap();
                let bytes = space.read_cstring(virtual_address + descriptor.module_name as u64)?;
                MString::from_utf8(&bytes)
            };
            trace!("resolving import descriptor {module_name}");

            let library = self.resolve_library(root, &module_name).map_err(|err| {
                error!("failed to resolve library {module_name}: {err}");
                err
            })?;
            let exports = self.image(library)?.exports.clone();
            if exports.is_empty() {
                return Err(PeError::MissingSymbol(format!(
                    "{module_name} exports nothing"
                )));
            }

            let mut space = space.lock().unwrap();
            let mut slot = virtual_address + descriptor.import_address_table as u64;
            loop {
                let value = if is_64 {
                    space.read_u64(slot)?
                } else {
                    space.read_u32(slot)? as u64
                };
                if value == 0 {
                    break;
                }

                let by_ordinal = if is_64 {
                    value & format::IMPORT_ORDINAL_64 != 0
                } else {
                    value as u32 & format::IMPORT_ORDINAL_32 != 0
                };

                let function = if by_ordinal {
                    let ordinal = (value & 0xFFFF) as u32;
                    exports
                        .iter()
                        .find(|export| export.ordinal == ordinal)
                        .ok_or_else(|| {
                            PeError::MissingSymbol(format!("{module_name}!#{ordinal}"))
                        })?
                } else {
                    let record = virtual_address + (value as u32 & format::IMPORT_NAMEMASK) as u64;
                    let hint = space.read_u16(record)? as u32;
                    let symbol = space.read_cstring(record + 2)?;
                    let symbol = String::from_utf8_lossy(&symbol).into_owned();

                    // Try the hint first, fall back to a linear search.
                    exports
                        .iter()
                        .find(|export| {
                            export.ordinal == hint && export.name.as_deref() == Some(&symbol)
                        })
                        .or_else(|| {
                            exports
                                .iter()
                                .find(|export| export.name.as_deref() == Some(&symbol))
                        })
                        .ok_or_else(|| {
                            PeError::MissingSymbol(format!("{module_name}!{symbol}"))
                        })?
                };

                if is_64 {
                    space.write_u64(slot, function.address)?;
                    slot += 8;
                } else {
                    space.write_u32(slot, function.address as u32)?;
                    slot += 4;
                }
            }
            drop(space);

            descriptor_address += format::IMPORT_DESCRIPTOR_SIZE as u64;
        }
        Ok(())
    }

    /// Find `name` in the library tree rooted at `root`, loading it as a
    /// new member when absent. Found images get their reference count
    /// bumped.
    pub fn resolve_library(
        &mut self,
        root: ImageId,
        name: &MString,
    ) -> Result<ImageId, PeError> {
        let mut queue = vec![root];
        let mut visited = Vec::new();
        while let Some(next) = queue.pop() {
            if visited.contains(&next) {
                continue;
            }
            visited.push(next);
            let image = self.image(next)?;
            if image.name.compare(name, true) == CompareResult::FullMatch {
                let image = self.image_mut(next)?;
                image.references += 1;
                return Ok(next);
            }
            queue.extend(self.image(next)?.libraries.iter().copied());
        }

        let owner = self.image(root)?.owner;
        self.load_image(owner, Some(root), name)
    }

    /// Tear down an image and its whole library subtree unconditionally.
    pub fn unload_image(&mut self, id: ImageId) -> Result<(), PeError> {
        let image = self
            .images
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(PeError::UnknownImage)?;
        trace!("unload_image(image={})", image.name);

        for child in image.libraries.iter().copied() {
            // Children may already be gone if they appeared twice in a
            // degenerate tree.
            let _ = self.unload_image(child);
        }

        let mut space = image.space.lock().unwrap();
        for &(base, size) in image.mapped.iter() {
            let _ = space.unmap(base, size);
        }
        Ok(())
    }

    /// Drop one reference to `library`; at zero it is removed from the
    /// parent's list and its subtree is unloaded.
    pub fn unload_library(
        &mut self,
        parent: Option<ImageId>,
        library: ImageId,
    ) -> Result<(), PeError> {
        let references = {
            let image = self.image_mut(library)?;
            image.references -= 1;
            image.references
        };

        if references <= 0 {
            if let Some(parent_id) = parent {
                if let Ok(parent_image) = self.image_mut(parent_id) {
                    parent_image.libraries.retain(|&child| child != library);
                }
            }
            return self.unload_image(library);
        }
        Ok(())
    }
}

fn is_absolute(path: &MString) -> bool {
    let bytes = path.as_bytes();
    bytes.first() == Some(&b'/') || bytes.windows(2).any(|pair| pair == b":/")
}

/// Resolve `path` against the parent image's directory unless absolute.
fn resolve_path(parent_path: Option<&MString>, path: &MString) -> MString {
    if is_absolute(path) {
        return path.clone();
    }
    match parent_path {
        Some(parent) => match parent.find_reverse('/' as u32) {
            Some(index) => {
                let mut full = parent.substring(0, index as isize + 1);
                full.append(path);
                full
            }
            None => path.clone(),
        },
        None => path.clone(),
    }
}
