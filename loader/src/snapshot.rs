//! Snapshot Handles
//!
//! The public, opaque handle returned to callers: four resolved raw
//! pointers plus the one resource that keeps them alive. Exactly one
//! resource kind is active per handle; dropping the handle releases
//! everything in reverse-acquisition order. Rust ownership makes a
//! double close unrepresentable.

use std::fs::File;
use std::path::Path;

use log::info;

use crate::blob::BlobSnapshot;
use crate::dylib::DynamicLibrary;
use crate::error::Error;
use crate::image::{LoadedImage, SnapshotPointers};
use crate::mapping::{FileMapper, MappedRegion, MemoryMapper};
use crate::symbols::{Interest, IMAGE_SYMBOLS, LIBRARY_SYMBOLS};

/// Which container shape a snapshot was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotShape {
    /// Simple blob container.
    Blob,
    /// ELF image at offset 0.
    BareElf,
    /// ELF image appended to a host file.
    AppendedElf,
    /// ELF image found through a Mach-O `LC_NOTE`.
    MachONote,
    /// ELF image copied out of a PE `snapshot` section.
    PeSection,
    /// Ordinary shared library resolved with the OS dynamic loader.
    DynamicLibrary,
}

impl std::fmt::Display for SnapshotShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SnapshotShape::Blob => "blob container",
            SnapshotShape::BareElf => "ELF image",
            SnapshotShape::AppendedElf => "appended ELF image",
            SnapshotShape::MachONote => "ELF image in Mach-O note",
            SnapshotShape::PeSection => "ELF image in PE section",
            SnapshotShape::DynamicLibrary => "dynamic library",
        };
        f.write_str(name)
    }
}

/// The resource backing a snapshot's pointers.
///
/// One variant per resource kind, each owning exactly what it needs.
enum SnapshotResource {
    Blob {
        #[allow(dead_code)]
        regions: Vec<MappedRegion>,
    },
    Elf {
        #[allow(dead_code)]
        image: LoadedImage,
    },
    Dylib {
        #[allow(dead_code)]
        library: DynamicLibrary,
    },
}

/// A loaded snapshot.
///
/// The four pointers remain valid exactly as long as this handle lives.
pub struct Snapshot {
    pointers: SnapshotPointers,
    shape: SnapshotShape,
    // Dropped last; owns every mapping the pointers point into.
    resource: SnapshotResource,
}

impl Snapshot {
    /// Load an ELF-format snapshot from `path`.
    ///
    /// `elf_data_offset` is the page-aligned byte offset of the image
    /// within the file (0 for a bare ELF file).
    pub fn open_elf(path: &Path, elf_data_offset: u64) -> Result<Snapshot, Error> {
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let shape = if elf_data_offset == 0 {
            SnapshotShape::BareElf
        } else {
            SnapshotShape::AppendedElf
        };
        Self::from_elf_source(Box::new(FileMapper::new(file)?), elf_data_offset, shape)
    }

    /// Load an ELF-format snapshot from a byte buffer.
    pub fn open_elf_memory(bytes: Vec<u8>) -> Result<Snapshot, Error> {
        Self::from_elf_source(Box::new(MemoryMapper::new(bytes)), 0, SnapshotShape::PeSection)
    }

    pub(crate) fn from_elf_source(
        source: Box<dyn crate::mapping::Mappable + Send>,
        elf_data_offset: u64,
        shape: SnapshotShape,
    ) -> Result<Snapshot, Error> {
        let mut image = LoadedImage::load(source, elf_data_offset)?;
        // The isolate pair is mandatory for an executable snapshot; the
        // VM pair depends on the snapshot kind.
        let pointers = image.resolve_symbols(&IMAGE_SYMBOLS, Interest::isolate_pair())?;
        info!("loaded {} at {:p}", shape, image.base());
        Ok(Snapshot {
            pointers,
            shape,
            resource: SnapshotResource::Elf { image },
        })
    }

    /// Load a snapshot shipped as an ordinary shared library.
    pub fn try_read_dynamic_library(path: &Path) -> Result<Snapshot, Error> {
        let library = DynamicLibrary::open(path)?;
        let pointers = SnapshotPointers {
            vm_data: library.lookup(LIBRARY_SYMBOLS.vm_data),
            vm_instructions: library.lookup(LIBRARY_SYMBOLS.vm_instructions),
            isolate_data: library.lookup(LIBRARY_SYMBOLS.isolate_data),
            isolate_instructions: library.lookup(LIBRARY_SYMBOLS.isolate_instructions),
        };
        if pointers.isolate_data.is_none() {
            return Err(Error::MissingSymbol(LIBRARY_SYMBOLS.isolate_data));
        }
        if pointers.isolate_instructions.is_none() {
            return Err(Error::MissingSymbol(LIBRARY_SYMBOLS.isolate_instructions));
        }
        info!("loaded {} from {}", SnapshotShape::DynamicLibrary, path.display());
        Ok(Snapshot {
            pointers,
            shape: SnapshotShape::DynamicLibrary,
            resource: SnapshotResource::Dylib { library },
        })
    }

    pub(crate) fn from_blob(blob: BlobSnapshot) -> Snapshot {
        Snapshot {
            pointers: blob.pointers,
            shape: SnapshotShape::Blob,
            resource: SnapshotResource::Blob {
                regions: blob.regions,
            },
        }
    }

    pub fn shape(&self) -> SnapshotShape {
        self.shape
    }

    /// VM heap data, or null when the snapshot carries none.
    pub fn vm_data(&self) -> *const u8 {
        ptr_or_null(self.pointers.vm_data)
    }

    /// VM instructions, or null when the snapshot carries none.
    pub fn vm_instructions(&self) -> *const u8 {
        ptr_or_null(self.pointers.vm_instructions)
    }

    /// Isolate heap data.
    pub fn isolate_data(&self) -> *const u8 {
        ptr_or_null(self.pointers.isolate_data)
    }

    /// Isolate instructions.
    pub fn isolate_instructions(&self) -> *const u8 {
        ptr_or_null(self.pointers.isolate_instructions)
    }
}

// Pointers reference memory owned by `resource`; moving the handle to
// another thread moves the mappings with it.
unsafe impl Send for Snapshot {}

fn ptr_or_null(ptr: Option<*const u8>) -> *const u8 {
    ptr.unwrap_or(std::ptr::null())
}
