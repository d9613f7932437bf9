use vali_core::handles::ProcessId;
use vali_core::pe::format::{
    self, DIRECTORY_BASE_RELOCATION, DIRECTORY_GLOBAL_PTR, RELOCATION_DIR64, RELOCATION_HIGHLOW,
};
use vali_core::pe::{PeError, PE_LOAD_BASE};

mod common;
use common::*;

const OWNER: ProcessId = ProcessId(1);

#[test]
fn loads_a_minimal_image() {
    let mut loader = loader_with(&[("rd:/bin/app.app", minimal_app())]);
    let image = loader
        .load_image(OWNER, None, &mstr("rd:/bin/app.app"))
        .expect("load failed");

    let image = loader.image(image).unwrap();
    assert_eq!(image.virtual_address, PE_LOAD_BASE);
    assert_eq!(image.name.as_bytes(), b"app.app");
    assert_eq!(image.entry_address, PE_LOAD_BASE + 0x1000);
    assert_eq!(image.code_base, PE_LOAD_BASE + 0x1000);
    assert_eq!(image.references, 1);
    // Next loading address is page-aligned past the highest section.
    assert_eq!(image.next_load_address % 0x1000, 0);
    assert!(image.next_load_address >= PE_LOAD_BASE + 0x2000);

    let space = image.space.lock().unwrap();
    // Headers are mapped at the base; sections carry their section flags.
    assert!(space.is_mapped(PE_LOAD_BASE));
    let code_flags = space.flags_of(PE_LOAD_BASE + 0x1000).unwrap();
    assert!(code_flags.contains(vali_core::memory::MapFlags::EXECUTE));
    assert!(!code_flags.contains(vali_core::memory::MapFlags::WRITE));
    assert_eq!(space.read_u8(PE_LOAD_BASE + 0x1000).unwrap(), 0xC3);
}

#[test]
fn rejects_foreign_machine_and_architecture() {
    let mut fixture = PeFixture::new(0x40_0000);
    fixture.code_section(0x1000, vec![0xC3; 8]);
    let wrong_machine = fixture.build_for(0x1234, format::CURRENT_MAGIC);

    let other_magic = if format::CURRENT_MAGIC == format::MAGIC_PE64 {
        format::MAGIC_PE32
    } else {
        format::MAGIC_PE64
    };
    let wrong_arch = fixture.build_for(format::CURRENT_MACHINE, other_magic);

    let mut loader = loader_with(&[
        ("rd:/machine.dll", wrong_machine),
        ("rd:/arch.dll", wrong_arch),
    ]);
    assert!(matches!(
        loader.load_image(OWNER, None, &mstr("rd:/machine.dll")),
        Err(PeError::WrongMachine(0x1234))
    ));
    assert!(matches!(
        loader.load_image(OWNER, None, &mstr("rd:/arch.dll")),
        Err(PeError::WrongArch(_))
    ));
}

fn reloc_fixture(image_base: u64) -> Vec<u8> {
    // .data holds two absolute pointers; .reloc rebases them.
    let mut data = vec![0u8; 0x20];
    data[0..8].copy_from_slice(&(image_base + 0x1010).to_le_bytes());
    data[8..12].copy_from_slice(&((image_base as u32) + 0x2000).to_le_bytes());

    let kind = if format::CURRENT_MAGIC == format::MAGIC_PE64 {
        RELOCATION_DIR64
    } else {
        RELOCATION_HIGHLOW
    };
    let blocks = reloc_blocks(&[(0x1000, vec![(kind, 0), (RELOCATION_HIGHLOW, 8)])]);
    let blocks_len = blocks.len() as u32;

    let mut fixture = PeFixture::new(image_base);
    fixture
        .code_section(0x1000, data)
        .data_section(".reloc", 0x2000, blocks)
        .directory(DIRECTORY_BASE_RELOCATION, 0x2000, blocks_len);
    fixture.build()
}

#[test]
fn relocations_at_preferred_base_leave_file_bytes() {
    // Preferred base equals the load base: delta zero, directory skipped.
    let mut loader = loader_with(&[("rd:/app.app", reloc_fixture(PE_LOAD_BASE))]);
    let image = loader.load_image(OWNER, None, &mstr("rd:/app.app")).unwrap();
    let image = loader.image(image).unwrap();

    let space = image.space.lock().unwrap();
    assert_eq!(
        space.read_u64(image.virtual_address + 0x1000).unwrap(),
        PE_LOAD_BASE + 0x1010
    );
    assert_eq!(
        space.read_u32(image.virtual_address + 0x1008).unwrap(),
        PE_LOAD_BASE as u32 + 0x2000
    );
}

#[test]
fn relocations_apply_the_image_delta() {
    let preferred = 0x0030_0000u64;
    let delta = PE_LOAD_BASE - preferred;
    let mut loader = loader_with(&[("rd:/app.app", reloc_fixture(preferred))]);
    let image = loader.load_image(OWNER, None, &mstr("rd:/app.app")).unwrap();
    let image = loader.image(image).unwrap();
    assert_eq!(image.original_image_base, preferred);

    let space = image.space.lock().unwrap();
    assert_eq!(
        space.read_u64(image.virtual_address + 0x1000).unwrap(),
        preferred + 0x1010 + delta
    );
    assert_eq!(
        space.read_u32(image.virtual_address + 0x1008).unwrap(),
        (preferred as u32 + 0x2000).wrapping_add(delta as u32)
    );
}

#[test]
fn unsupported_relocation_type_fails_the_load() {
    let blocks = reloc_blocks(&[(0x1000, vec![(7, 0), (7, 2)])]);
    let blocks_len = blocks.len() as u32;
    let mut fixture = PeFixture::new(0x0030_0000);
    fixture
        .code_section(0x1000, vec![0u8; 0x20])
        .data_section(".reloc", 0x2000, blocks)
        .directory(DIRECTORY_BASE_RELOCATION, 0x2000, blocks_len);

    let mut loader = loader_with(&[("rd:/app.app", fixture.build())]);
    assert!(matches!(
        loader.load_image(OWNER, None, &mstr("rd:/app.app")),
        Err(PeError::UnsupportedRelocation(7))
    ));
}

#[test]
fn runtime_pseudo_relocations_v1_add_the_value() {
    let mut data = vec![0u8; 0x20];
    data[0..8].copy_from_slice(&0x1111u64.to_le_bytes());
    let directory = runtime_relocs_v1(&[(0x0F, 0x1000)]);
    let directory_len = directory.len() as u32;

    let mut fixture = PeFixture::new(PE_LOAD_BASE);
    fixture
        .code_section(0x1000, data)
        .data_section(".rdata", 0x3000, directory)
        .directory(DIRECTORY_GLOBAL_PTR, 0x3000, directory_len);

    let mut loader = loader_with(&[("rd:/app.app", fixture.build())]);
    let image = loader.load_image(OWNER, None, &mstr("rd:/app.app")).unwrap();
    let image = loader.image(image).unwrap();
    let space = image.space.lock().unwrap();
    if image.is_64() {
        assert_eq!(
            space.read_u64(image.virtual_address + 0x1000).unwrap(),
            0x1111 + 0x0F
        );
    } else {
        assert_eq!(
            space.read_u32(image.virtual_address + 0x1000).unwrap(),
            0x1111 + 0x0F
        );
    }
}

#[test]
fn runtime_pseudo_relocations_v2_rebase_through_the_symbol() {
    if format::CURRENT_MAGIC != format::MAGIC_PE64 {
        return;
    }
    // symbol cell at +0x1000 holds S; target at +0x1010 holds T0. The
    // fixup writes T0 - (va + symbol_rva) + S.
    let symbol_value = 0x5000_0000u64;
    let target_initial = 0x0123_4567_89ABu64;
    let mut data = vec![0u8; 0x20];
    data[0..8].copy_from_slice(&symbol_value.to_le_bytes());
    data[16..24].copy_from_slice(&target_initial.to_le_bytes());

    let directory = runtime_relocs_v2(&[(0x1000, 0x1010, 64)]);
    let directory_len = directory.len() as u32;
    let mut fixture = PeFixture::new(PE_LOAD_BASE);
    fixture
        .code_section(0x1000, data)
        .data_section(".rdata", 0x3000, directory)
        .directory(DIRECTORY_GLOBAL_PTR, 0x3000, directory_len);

    let mut loader = loader_with(&[("rd:/app.app", fixture.build())]);
    let image = loader.load_image(OWNER, None, &mstr("rd:/app.app")).unwrap();
    let image = loader.image(image).unwrap();
    let space = image.space.lock().unwrap();
    let expected = target_initial
        .wrapping_sub(image.virtual_address + 0x1000)
        .wrapping_add(symbol_value);
    assert_eq!(
        space.read_u64(image.virtual_address + 0x1010).unwrap(),
        expected
    );
}

#[test]
fn imports_resolve_into_the_providing_library() {
    let (app, iat_rva) = app_with_import();
    let mut loader = loader_with(&[
        ("rd:/bin/app.app", app),
        ("rd:/bin/rt.dll", rt_library()),
    ]);
    let app = loader
        .load_image(OWNER, None, &mstr("rd:/bin/app.app"))
        .expect("load failed");

    let app_image = loader.image(app).unwrap();
    assert_eq!(app_image.libraries.len(), 1);
    let library_id = app_image.libraries[0];
    let library = loader.image(library_id).unwrap();
    assert_eq!(library.name.as_bytes(), b"rt.dll");

    // The IAT slot points at the provider's export, inside its mapped
    // code range, and the stub bytes are the provider's.
    let export = library.find_export("add").expect("missing export");
    assert_eq!(export.ordinal, 3);
    let space = app_image.space.lock().unwrap();
    let slot_address = app_image.virtual_address + iat_rva as u64;
    let resolved = if app_image.is_64() {
        space.read_u64(slot_address).unwrap()
    } else {
        space.read_u32(slot_address).unwrap() as u64
    };
    assert_eq!(resolved, export.address);
    assert!(resolved >= library.code_base);
    assert!(resolved < library.code_base + library.code_size as u64);
    assert_eq!(space.read_u8(resolved).unwrap(), 0x8D);
}

#[test]
fn named_import_resolves_by_hint_and_name() {
    let (imports, iat_rvas) = idata(
        0x2000,
        &[ImportModule {
            name: "rt.dll",
            entries: vec![ImportEntry::Named {
                hint: 3,
                name: "add",
            }],
        }],
    );
    let imports_len = imports.len() as u32;
    let mut fixture = PeFixture::new(0x40_0000);
    fixture
        .code_section(0x1000, vec![0xC3; 8])
        .data_section(".idata", 0x2000, imports)
        .directory(format::DIRECTORY_IMPORT, 0x2000, imports_len);

    let mut loader = loader_with(&[
        ("rd:/app.app", fixture.build()),
        ("rd:/rt.dll", rt_library()),
    ]);
    let app = loader.load_image(OWNER, None, &mstr("rd:/app.app")).unwrap();
    let app_image = loader.image(app).unwrap();
    let library = loader.image(app_image.libraries[0]).unwrap();
    let export = library.find_export("add").unwrap();

    let space = app_image.space.lock().unwrap();
    let slot_address = app_image.virtual_address + iat_rvas[0] as u64;
    let resolved = if app_image.is_64() {
        space.read_u64(slot_address).unwrap()
    } else {
        space.read_u32(slot_address).unwrap() as u64
    };
    assert_eq!(resolved, export.address);
}

#[test]
fn missing_symbol_fails_and_unwinds_the_library() {
    let (imports, _) = idata(
        0x2000,
        &[ImportModule {
            name: "rt.dll",
            entries: vec![ImportEntry::Named {
                hint: 0,
                name: "does_not_exist",
            }],
        }],
    );
    let imports_len = imports.len() as u32;
    let mut bad = PeFixture::new(0x0050_0000);
    bad.code_section(0x1000, vec![0xC3; 8])
        .data_section(".idata", 0x2000, imports)
        .directory(format::DIRECTORY_IMPORT, 0x2000, imports_len);

    let mut loader = loader_with(&[
        ("rd:/app.app", minimal_app()),
        ("rd:/bad.dll", bad.build()),
        ("rd:/rt.dll", rt_library()),
    ]);
    let app = loader.load_image(OWNER, None, &mstr("rd:/app.app")).unwrap();
    let bad_base = loader.image(app).unwrap().next_load_address;

    let result = loader.resolve_library(app, &mstr("rd:/bad.dll"));
    assert!(matches!(result, Err(PeError::MissingSymbol(_))));

    // The failed library's sections were unwound; the app itself stays.
    let app_image = loader.image(app).unwrap();
    let space = app_image.space.lock().unwrap();
    assert!(!space.is_mapped(bad_base));
    assert!(space.is_mapped(app_image.virtual_address));
}

#[test]
fn library_refcount_tracks_loads_and_unloads() {
    let (app, _) = app_with_import();
    let mut loader = loader_with(&[
        ("rd:/bin/app.app", app),
        ("rd:/bin/rt.dll", rt_library()),
    ]);
    let app = loader
        .load_image(OWNER, None, &mstr("rd:/bin/app.app"))
        .unwrap();

    // A second image in the same tree resolves the already-loaded copy.
    let library = loader.resolve_library(app, &mstr("rt.dll")).unwrap();
    assert_eq!(loader.image(library).unwrap().references, 2);
    let code_base = loader.image(library).unwrap().code_base;
    let space = loader.image(app).unwrap().space.clone();

    loader.unload_library(Some(app), library).unwrap();
    assert_eq!(loader.image(library).unwrap().references, 1);
    assert!(space.lock().unwrap().is_mapped(code_base));

    loader.unload_library(Some(app), library).unwrap();
    assert!(loader.image(library).is_err());
    assert!(!space.lock().unwrap().is_mapped(code_base));
    assert!(loader.image(app).unwrap().libraries.is_empty());
}
