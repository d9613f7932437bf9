//! Shared fixtures: a programmatic PE builder and kernel/loader setup.
//!
//! The builder emits a minimal but structurally valid image for the host
//! machine/architecture: DOS header at 0, PE signature at 0x80, optional
//! header with 16 data directories, section table, raw section data from
//! file offset 0x400. Section RVAs are chosen by the tests; the loader
//! maps headers at the base address and sections at base + RVA.

#![allow(dead_code)]

use vali_core::mstring::MString;
use vali_core::pe::format::{self, SectionFlags, DIRECTORY_EXPORT, DIRECTORY_IMPORT};
use vali_core::pe::{PeLoader, Ramdisk};

pub const HEADERS_SIZE: u32 = 0x400;

fn put_u16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub struct SectionSpec {
    pub name: &'static str,
    pub rva: u32,
    pub data: Vec<u8>,
    pub virtual_size: u32,
    pub flags: SectionFlags,
}

pub struct PeFixture {
    pub image_base: u64,
    pub entry_rva: u32,
    sections: Vec<SectionSpec>,
    directories: [(u32, u32); format::NUM_DATA_DIRECTORIES],
}

impl PeFixture {
    pub fn new(image_base: u64) -> Self {
        PeFixture {
            image_base,
            entry_rva: 0,
            sections: Vec::new(),
            directories: [(0, 0); format::NUM_DATA_DIRECTORIES],
        }
    }

    pub fn code_section(&mut self, rva: u32, data: Vec<u8>) -> &mut Self {
        let virtual_size = data.len() as u32;
        self.sections.push(SectionSpec {
            name: ".text",
            rva,
            data,
            virtual_size,
            flags: SectionFlags::CODE | SectionFlags::EXECUTE | SectionFlags::READ,
        });
        self
    }

    pub fn data_section(&mut self, name: &'static str, rva: u32, data: Vec<u8>) -> &mut Self {
        let virtual_size = data.len() as u32;
        self.sections.push(SectionSpec {
            name,
            rva,
            data,
            virtual_size,
            flags: SectionFlags::DATA | SectionFlags::READ | SectionFlags::WRITE,
        });
        self
    }

    pub fn bss_section(&mut self, rva: u32, virtual_size: u32) -> &mut Self {
        self.sections.push(SectionSpec {
            name: ".bss",
            rva,
            data: Vec::new(),
            virtual_size,
            flags: SectionFlags::BSS | SectionFlags::READ | SectionFlags::WRITE,
        });
        self
    }

    pub fn section(&mut self, spec: SectionSpec) -> &mut Self {
        self.sections.push(spec);
        self
    }

    pub fn directory(&mut self, index: usize, rva: u32, size: u32) -> &mut Self {
        self.directories[index] = (rva, size);
        self
    }

    pub fn entry(&mut self, rva: u32) -> &mut Self {
        self.entry_rva = rva;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_for(format::CURRENT_MACHINE, format::CURRENT_MAGIC)
    }

    /// Build with explicit machine/magic so mismatch handling can be
    /// exercised.
    pub fn build_for(&self, machine: u16, magic: u16) -> Vec<u8> {
        let is_64 = magic == format::MAGIC_PE64;
        let optional_size: u16 = if is_64 { 240 } else { 224 };
        let pe_offset = 0x80usize;
        let optional_offset = pe_offset + 4 + 20;
        let table_offset = optional_offset + optional_size as usize;

        let mut file = vec![0u8; HEADERS_SIZE as usize];

        // DOS header.
        put_u16(&mut file, 0, format::DOS_SIGNATURE);
        put_u32(&mut file, format::DOS_LFANEW_OFFSET, pe_offset as u32);

        // PE signature + COFF header.
        put_u32(&mut file, pe_offset, format::PE_SIGNATURE);
        put_u16(&mut file, pe_offset + 4, machine);
        put_u16(&mut file, pe_offset + 6, self.sections.len() as u16);
        put_u16(&mut file, pe_offset + 20, optional_size);
        put_u16(&mut file, pe_offset + 22, 0x0022);

        // Optional header.
        put_u16(&mut file, optional_offset, magic);
        put_u32(&mut file, optional_offset + 16, self.entry_rva);
        let directories_offset = if is_64 {
            put_u64(&mut file, optional_offset + 24, self.image_base);
            optional_offset + 112
        } else {
            put_u32(&mut file, optional_offset + 28, self.image_base as u32);
            optional_offset + 96
        };
        put_u32(&mut file, optional_offset + 32, 0x1000); // section alignment
        put_u32(&mut file, optional_offset + 36, 0x200); // file alignment
        put_u32(&mut file, optional_offset + 60, HEADERS_SIZE);
        put_u32(
            &mut file,
            directories_offset - 4,
            format::NUM_DATA_DIRECTORIES as u32,
        );
        for (index, &(rva, size)) in self.directories.iter().enumerate() {
            put_u32(&mut file, directories_offset + index * 8, rva);
            put_u32(&mut file, directories_offset + index * 8 + 4, size);
        }

        // Section table plus raw data.
        let mut raw_cursor = file.len();
        for (index, section) in self.sections.iter().enumerate() {
            let header = table_offset + index * format::SECTION_HEADER_SIZE;
            let name_bytes = section.name.as_bytes();
            file[header..header + name_bytes.len().min(8)]
                .copy_from_slice(&name_bytes[..name_bytes.len().min(8)]);
            put_u32(&mut file, header + 8, section.virtual_size);
            put_u32(&mut file, header + 12, section.rva);
            put_u32(&mut file, header + 16, section.data.len() as u32);
            put_u32(&mut file, header + 20, raw_cursor as u32);
            put_u32(&mut file, header + 36, section.flags.bits());

            file.extend_from_slice(&section.data);
            raw_cursor = file.len();
        }
        file
    }
}

/// Export-directory section contents.
///
/// `functions` is the address table (RVA per slot); `names` binds a name to
/// an address-table index (the stored ordinal, with `ordinal_base` 0).
pub fn edata(section_rva: u32, functions: &[u32], names: &[(&str, u16)]) -> Vec<u8> {
    let address_table = 40u32;
    let names_table = address_table + functions.len() as u32 * 4;
    let ordinals_table = names_table + names.len() as u32 * 4;
    let strings = ordinals_table + names.len() as u32 * 2;

    let mut blob = vec![0u8; strings as usize];
    put_u32(&mut blob, 16, 0); // ordinal base
    put_u32(&mut blob, 20, functions.len() as u32);
    put_u32(&mut blob, 24, names.len() as u32);
    put_u32(&mut blob, 28, section_rva + address_table);
    put_u32(&mut blob, 32, section_rva + names_table);
    put_u32(&mut blob, 36, section_rva + ordinals_table);

    for (index, &rva) in functions.iter().enumerate() {
        put_u32(&mut blob, (address_table as usize) + index * 4, rva);
    }
    for (index, &(name, ordinal)) in names.iter().enumerate() {
        let name_rva = section_rva + blob.len() as u32;
        put_u32(&mut blob, (names_table as usize) + index * 4, name_rva);
        put_u16(&mut blob, (ordinals_table as usize) + index * 2, ordinal);
        blob.extend_from_slice(name.as_bytes());
        blob.push(0);
    }
    blob
}

pub enum ImportEntry {
    Ordinal(u16),
    Named { hint: u16, name: &'static str },
}

pub struct ImportModule {
    pub name: &'static str,
    pub entries: Vec<ImportEntry>,
}

/// Import-directory section contents; returns the blob and the IAT RVA of
/// each module.
pub fn idata(section_rva: u32, modules: &[ImportModule]) -> (Vec<u8>, Vec<u32>) {
    let is_64 = format::CURRENT_MAGIC == format::MAGIC_PE64;
    let slot = if is_64 { 8 } else { 4 };
    let descriptors = (modules.len() + 1) * format::IMPORT_DESCRIPTOR_SIZE;

    let mut blob = vec![0u8; descriptors];
    let mut iat_rvas = Vec::with_capacity(modules.len());

    for (index, module) in modules.iter().enumerate() {
        // Module name string.
        let name_rva = section_rva + blob.len() as u32;
        blob.extend_from_slice(module.name.as_bytes());
        blob.push(0);
        while blob.len() % 8 != 0 {
            blob.push(0);
        }

        // Hint/name records, collected first so the IAT can point at them.
        let mut records: Vec<Option<u32>> = Vec::with_capacity(module.entries.len());
        for entry in &module.entries {
            match entry {
                ImportEntry::Ordinal(_) => records.push(None),
                ImportEntry::Named { hint, name } => {
                    let record_rva = section_rva + blob.len() as u32;
                    let mut record = Vec::with_capacity(name.len() + 3);
                    record.extend_from_slice(&hint.to_le_bytes());
                    record.extend_from_slice(name.as_bytes());
                    record.push(0);
                    blob.extend_from_slice(&record);
                    while blob.len() % 8 != 0 {
                        blob.push(0);
                    }
                    records.push(Some(record_rva));
                }
            }
        }

        // The import address table, zero-terminated.
        while blob.len() % 8 != 0 {
            blob.push(0);
        }
        let iat_rva = section_rva + blob.len() as u32;
        iat_rvas.push(iat_rva);
        for (entry, record) in module.entries.iter().zip(&records) {
            let value: u64 = match (entry, record) {
                (ImportEntry::Ordinal(ordinal), _) => {
                    if is_64 {
                        format::IMPORT_ORDINAL_64 | *ordinal as u64
                    } else {
                        (format::IMPORT_ORDINAL_32 | *ordinal as u32) as u64
                    }
                }
                (ImportEntry::Named { .. }, Some(record_rva)) => *record_rva as u64,
                (ImportEntry::Named { .. }, None) => unreachable!(),
            };
            blob.extend_from_slice(&value.to_le_bytes()[..slot]);
        }
        blob.extend_from_slice(&vec![0u8; slot]);

        // Fill in the descriptor.
        let descriptor = index * format::IMPORT_DESCRIPTOR_SIZE;
        put_u32(&mut blob, descriptor + 12, name_rva);
        put_u32(&mut blob, descriptor + 16, iat_rva);
    }
    (blob, iat_rvas)
}

/// Base-relocation directory contents: `(page_rva, entries)` per block,
/// entries as `(type, offset_in_page)`. Odd blocks are padded with an
/// ABSOLUTE entry.
pub fn reloc_blocks(blocks: &[(u32, Vec<(u16, u16)>)]) -> Vec<u8> {
    let mut blob = Vec::new();
    for (page_rva, entries) in blocks {
        let mut padded: Vec<(u16, u16)> = entries.clone();
        if padded.len() % 2 != 0 {
            padded.push((format::RELOCATION_ABSOLUTE, 0));
        }
        let block_size = 8 + padded.len() as u32 * 2;
        blob.extend_from_slice(&page_rva.to_le_bytes());
        blob.extend_from_slice(&block_size.to_le_bytes());
        for (kind, offset) in padded {
            let entry = (kind << 12) | (offset & 0x0FFF);
            blob.extend_from_slice(&entry.to_le_bytes());
        }
    }
    blob
}

/// Runtime pseudo-relocation directory, v1 entries `(value, offset_rva)`.
pub fn runtime_relocs_v1(entries: &[(u32, u32)]) -> Vec<u8> {
    let mut blob = vec![0u8; 12];
    put_u32(&mut blob, 8, 0); // RP_VERSION_1
    for &(value, offset) in entries {
        blob.extend_from_slice(&value.to_le_bytes());
        blob.extend_from_slice(&offset.to_le_bytes());
    }
    blob
}

/// Runtime pseudo-relocation directory, v2 entries
/// `(symbol_rva, offset_rva, flags)`.
pub fn runtime_relocs_v2(entries: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut blob = vec![0u8; 12];
    put_u32(&mut blob, 8, 1); // RP_VERSION_2
    for &(symbol, offset, flags) in entries {
        blob.extend_from_slice(&symbol.to_le_bytes());
        blob.extend_from_slice(&offset.to_le_bytes());
        blob.extend_from_slice(&flags.to_le_bytes());
    }
    blob
}

/// A library exporting `add` at ordinal 3 with a small stub in its code
/// section; mirrors the runtime-support library every app links against.
pub fn rt_library() -> Vec<u8> {
    // Stub bytes for `add`; never executed by the hosted loader.
    let stub = vec![0x8D, 0x04, 0x37, 0xC3, 0x90, 0x90, 0x90, 0x90];
    let functions = [0x1000u32, 0x1000, 0x1000, 0x1000];
    let exports = edata(0x2000, &functions, &[("add", 3)]);
    let exports_len = exports.len() as u32;

    let mut fixture = PeFixture::new(0x0100_0000);
    fixture
        .code_section(0x1000, stub)
        .data_section(".edata", 0x2000, exports)
        .directory(DIRECTORY_EXPORT, 0x2000, exports_len)
        .entry(0);
    fixture.build()
}

/// An application importing `rt.dll!add` by ordinal 3. Returns the file
/// and the IAT RVA.
pub fn app_with_import() -> (Vec<u8>, u32) {
    let (imports, iat_rvas) = idata(
        0x2000,
        &[ImportModule {
            name: "rt.dll",
            entries: vec![ImportEntry::Ordinal(3)],
        }],
    );
    let imports_len = imports.len() as u32;

    let mut fixture = PeFixture::new(0x0040_0000);
    fixture
        .code_section(0x1000, vec![0xC3; 0x40])
        .data_section(".idata", 0x2000, imports)
        .directory(DIRECTORY_IMPORT, 0x2000, imports_len)
        .entry(0x1000);
    (fixture.build(), iat_rvas[0])
}

/// A plain executable with one code section and no imports.
pub fn minimal_app() -> Vec<u8> {
    let mut fixture = PeFixture::new(0x0040_0000);
    fixture.code_section(0x1000, vec![0xC3; 0x20]).entry(0x1000);
    fixture.build()
}

pub fn loader_with(files: &[(&str, Vec<u8>)]) -> PeLoader {
    let mut ramdisk = Ramdisk::new();
    for (path, contents) in files {
        ramdisk.insert(path, contents.clone());
    }
    PeLoader::new(Box::new(ramdisk))
}

pub fn mstr(text: &str) -> MString {
    MString::from(text)
}

/// Deterministic chunk sizes for the property tests.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn range(&mut self, low: u64, high: u64) -> u64 {
        low + self.next() % (high - low)
    }
}
