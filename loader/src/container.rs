//! Container Discovery
//!
//! A snapshot file can arrive in several shapes: a raw blob container, a
//! bare ELF image, an ELF image appended to the end of a host file, or an
//! ELF image embedded in a Mach-O or PE host executable. Discovery walks
//! an ordered list of probes and stops at the first match.
//!
//! Each probe distinguishes "not this format" (discovery continues) from
//! "this format, but malformed" (the load fails with that error). Only
//! when every probe declines does discovery report an unknown format.
//!
//! The order is fixed: blob, bare ELF, appended ELF, Mach-O, PE. A
//! pathological file matching two shapes' magics resolves by priority;
//! no collision detection is attempted.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, warn};

use crate::blob::{self, BlobProbe, BLOB_MAGIC};
use crate::elf::ELF_MAGIC;
use crate::error::Error;
use crate::mapping::{FileMapper, MemoryMapper};
use crate::snapshot::{Snapshot, SnapshotShape};
use crate::{macho, pe};

/// Appended-image trailer: `{i64 offset, u64 magic}` in the last 16
/// bytes of the host file.
pub const TRAILER_SIZE: u64 = 16;

/// Options for [`try_read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Copy snapshot contents into anonymous memory instead of mapping
    /// the file, for callers that cannot keep the file stable.
    pub force_in_memory: bool,
}

/// Outcome of one container-shape probe.
enum Probe {
    /// Not this format; try the next shape.
    NoMatch,
    /// This format, but the contents fail validation.
    Malformed(Error),
    Matched(Snapshot),
}

/// Try every known container shape against `path`, in fixed order.
///
/// Returns `Ok(None)` when the path does not resolve to a file, an
/// [`Error::UnknownFormat`] when no shape matched, and the underlying
/// error when a shape matched but its contents were malformed.
pub fn try_read(path: &Path, options: ReadOptions) -> Result<Option<Snapshot>, Error> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let probes: [(&str, &dyn Fn() -> Probe); 5] = [
        ("blob", &|| probe_blob(&file, options)),
        ("bare ELF", &|| probe_bare_elf(&file, options)),
        ("appended ELF", &|| probe_appended_elf(&file, options)),
        ("Mach-O note", &|| probe_macho_note(&file, options)),
        ("PE section", &|| probe_pe_section(&file)),
    ];

    for (name, probe) in probes {
        match probe() {
            Probe::NoMatch => debug!("{}: not a {} snapshot", path.display(), name),
            Probe::Malformed(error) => {
                warn!("{}: matched {} shape but malformed: {}", path.display(), name, error);
                return Err(error);
            }
            Probe::Matched(snapshot) => return Ok(Some(snapshot)),
        }
    }
    Err(Error::UnknownFormat)
}

fn probe_blob(file: &File, options: ReadOptions) -> Probe {
    match blob::probe(file, options.force_in_memory) {
        BlobProbe::NoMatch => Probe::NoMatch,
        BlobProbe::Malformed(error) => Probe::Malformed(error),
        BlobProbe::Matched(snapshot) => Probe::Matched(Snapshot::from_blob(snapshot)),
    }
}

fn probe_bare_elf(file: &File, options: ReadOptions) -> Probe {
    let mut magic = [0u8; 4];
    if file.read_exact_at(&mut magic, 0).is_err() || magic != ELF_MAGIC {
        return Probe::NoMatch;
    }
    load_elf(file, 0, SnapshotShape::BareElf, options)
}

fn probe_appended_elf(file: &File, options: ReadOptions) -> Probe {
    let length = match file.metadata() {
        Ok(metadata) => metadata.len(),
        Err(source) => {
            return Probe::Malformed(Error::Io {
                context: "stat snapshot file",
                source,
            })
        }
    };
    if length < TRAILER_SIZE {
        return Probe::NoMatch;
    }
    let mut trailer = [0u8; TRAILER_SIZE as usize];
    if file.read_exact_at(&mut trailer, length - TRAILER_SIZE).is_err() {
        return Probe::NoMatch;
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&trailer[8..16]);
    if u64::from_le_bytes(word) != BLOB_MAGIC {
        return Probe::NoMatch;
    }
    word.copy_from_slice(&trailer[0..8]);
    let offset = i64::from_le_bytes(word);
    if offset <= 0 || offset as u64 >= length {
        return Probe::Malformed(Error::BadHostContainer {
            context: "appended snapshot trailer offset",
        });
    }
    load_elf(file, offset as u64, SnapshotShape::AppendedElf, options)
}

fn probe_macho_note(file: &File, options: ReadOptions) -> Probe {
    match macho::probe(file) {
        Ok(None) => Probe::NoMatch,
        Err(error) => Probe::Malformed(error),
        Ok(Some((offset, _size))) => {
            load_elf(file, offset, SnapshotShape::MachONote, options)
        }
    }
}

fn probe_pe_section(file: &File) -> Probe {
    match pe::probe(file) {
        Ok(None) => Probe::NoMatch,
        Err(error) => Probe::Malformed(error),
        // PE file alignment can be sub-page; the section was copied to a
        // heap buffer and is loaded through the in-memory variant.
        Ok(Some(bytes)) => match Snapshot::open_elf_memory(bytes) {
            Ok(snapshot) => Probe::Matched(snapshot),
            Err(error) => Probe::Malformed(error),
        },
    }
}

/// Shared tail for the ELF-shaped probes: once a shape's magic matched,
/// every load failure is malformed input, not a mismatch.
fn load_elf(file: &File, elf_data_offset: u64, shape: SnapshotShape, options: ReadOptions) -> Probe {
    let result = if options.force_in_memory {
        read_whole_file(file).and_then(|bytes| {
            Snapshot::from_elf_source(Box::new(MemoryMapper::new(bytes)), elf_data_offset, shape)
        })
    } else {
        file.try_clone()
            .map_err(|source| Error::Io {
                context: "reopen snapshot file",
                source,
            })
            .and_then(FileMapper::new)
            .and_then(|mapper| Snapshot::from_elf_source(Box::new(mapper), elf_data_offset, shape))
    };
    match result {
        Ok(snapshot) => Probe::Matched(snapshot),
        Err(error) => Probe::Malformed(error),
    }
}

fn read_whole_file(file: &File) -> Result<Vec<u8>, Error> {
    let mut clone = file.try_clone().map_err(|source| Error::Io {
        context: "reopen snapshot file",
        source,
    })?;
    clone.seek(SeekFrom::Start(0)).map_err(|source| Error::Io {
        context: "seek snapshot file",
        source,
    })?;
    let mut bytes = Vec::new();
    clone.read_to_end(&mut bytes).map_err(|source| Error::Io {
        context: "read snapshot file",
        source,
    })?;
    Ok(bytes)
}
