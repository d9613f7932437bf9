//! PE/COFF image loader.
//!
//! Given a path and an owning process, produces a fully linked,
//! section-mapped image in the process's address space together with its
//! transitive library closure. Images live in an arena keyed by
//! [`ImageId`](crate::handles::ImageId); parent/child edges carry ids only.

pub mod format;
mod loader;
mod relocations;

pub use loader::{ExportedFunction, PeImage, PeLoader, SectionMapping, PE_LOAD_BASE};

use std::collections::HashMap;

use thiserror::Error;

use crate::errors::OsStatus;
use crate::memory::MemoryError;
use crate::mstring::MString;

#[derive(Debug, Error)]
pub enum PeError {
    #[error("invalid image: {0}")]
    InvalidImage(&'static str),
    #[error("image was built for machine {0:#x}, not the current machine")]
    WrongMachine(u16),
    #[error("image was built for architecture {0:#x}, not the current architecture")]
    WrongArch(u16),
    #[error("out of memory")]
    OutOfMemory,
    #[error("failed to map section {0}")]
    MappingFailed(String),
    #[error("unresolved symbol {0}")]
    MissingSymbol(String),
    #[error("unsupported relocation type {0}")]
    UnsupportedRelocation(u16),
    #[error("no file at {0}")]
    FileNotFound(String),
    #[error("no image registered for the handle")]
    UnknownImage,
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("malformed image structure: {0}")]
    Parse(#[from] scroll::Error),
}

impl From<PeError> for OsStatus {
    fn from(value: PeError) -> Self {
        match value {
            PeError::OutOfMemory => OsStatus::OutOfMemory,
            PeError::FileNotFound(_) => OsStatus::DoesNotExist,
            PeError::UnknownImage => OsStatus::DoesNotExist,
            _ => OsStatus::Error,
        }
    }
}

/// Seam through which the loader reads image files. The process layer backs
/// it with the ramdisk; tests provide their own fixtures.
pub trait FileProvider: Send {
    fn load_file(&self, path: &MString) -> Option<Vec<u8>>;
}

/// In-memory file store. Canonical paths are stored verbatim, so both
/// `rd:/...` ramdisk paths and plain absolute paths work.
#[derive(Default)]
pub struct Ramdisk {
    files: HashMap<String, Vec<u8>>,
}

impl Ramdisk {
    pub fn new() -> Self {
        Ramdisk::default()
    }

    pub fn insert(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(path.to_string(), contents);
    }
}

impl FileProvider for Ramdisk {
    fn load_file(&self, path: &MString) -> Option<Vec<u8>> {
        let key = String::from_utf8_lossy(path.as_bytes()).into_owned();
        self.files.get(&key).cloned()
    }
}
