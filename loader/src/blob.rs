//! Simple Blob Snapshot Container
//!
//! The raw two/four-blob container format used by app-JIT snapshots:
//!
//! ```text
//! offset 0:  u64 magic
//! offset 8:  i64 vm_data_size
//! offset 16: i64 vm_instructions_size
//! offset 24: i64 isolate_data_size
//! offset 32: i64 isolate_instructions_size
//! -- each blob starts on a 16 KiB boundary, except that the rounding is
//!    skipped for a zero-size instruction blob --
//! ```
//!
//! The 16 KiB internal page size is a format constant, independent of the
//! OS page size, so the same file maps cleanly on any supported host.
//! Data blobs map read-only; instruction blobs map read-execute.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::debug;

use crate::error::Error;
use crate::image::SnapshotPointers;
use crate::mapping::{round_up, FileMapper, Mappable, MappedRegion, MemoryMapper, Protection};

/// Magic number identifying the blob container.
pub const BLOB_MAGIC: u64 = 0xf6f6_dcdc;

/// Internal page size of the container format: 16 KiB.
pub const BLOB_PAGE_SIZE: u64 = 16 * 1024;

/// Magic + four sizes.
pub const BLOB_HEADER_SIZE: u64 = 5 * 8;

/// The four buffers of a blob snapshot, in file order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobContents<'a> {
    pub vm_data: &'a [u8],
    pub vm_instructions: &'a [u8],
    pub isolate_data: &'a [u8],
    pub isolate_instructions: &'a [u8],
}

/// File positions of the four blobs, given their sizes.
///
/// Data blob positions are always rounded up to the container page size;
/// instruction blob positions only when the blob is non-empty. Reader and
/// writer both derive positions from this one function, which is what
/// makes the format bit-exact.
fn blob_positions(sizes: [u64; 4]) -> [u64; 4] {
    let vm_data = round_up(BLOB_HEADER_SIZE, BLOB_PAGE_SIZE);
    let mut vm_instructions = vm_data + sizes[0];
    if sizes[1] != 0 {
        vm_instructions = round_up(vm_instructions, BLOB_PAGE_SIZE);
    }
    let isolate_data = round_up(vm_instructions + sizes[1], BLOB_PAGE_SIZE);
    let mut isolate_instructions = isolate_data + sizes[2];
    if sizes[3] != 0 {
        isolate_instructions = round_up(isolate_instructions, BLOB_PAGE_SIZE);
    }
    [vm_data, vm_instructions, isolate_data, isolate_instructions]
}

/// Serialize four buffers into the blob container format.
pub fn write_snapshot(path: &Path, contents: &BlobContents<'_>) -> Result<(), Error> {
    let io = |source| Error::Io {
        context: "write snapshot blob file",
        source,
    };

    let blobs = [
        contents.vm_data,
        contents.vm_instructions,
        contents.isolate_data,
        contents.isolate_instructions,
    ];
    let sizes = blobs.map(|b| b.len() as u64);
    let positions = blob_positions(sizes);

    let mut file = File::create(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(&BLOB_MAGIC.to_le_bytes()).map_err(io)?;
    for size in sizes {
        file.write_all(&(size as i64).to_le_bytes()).map_err(io)?;
    }

    let mut written = BLOB_HEADER_SIZE;
    for (blob, position) in blobs.iter().zip(positions) {
        if blob.is_empty() {
            continue;
        }
        // Pad with zeros up to the blob's computed position.
        debug_assert!(position >= written);
        let padding = (position - written) as usize;
        file.write_all(&vec![0u8; padding]).map_err(io)?;
        file.write_all(blob).map_err(io)?;
        written = position + blob.len() as u64;
    }
    file.flush().map_err(io)?;
    Ok(())
}

/// A blob container opened for reading: the four pointers plus the
/// mappings that back them.
pub struct BlobSnapshot {
    pub pointers: SnapshotPointers,
    pub regions: Vec<MappedRegion>,
}

/// Outcome of probing a file for the blob container shape.
pub enum BlobProbe {
    NoMatch,
    Matched(BlobSnapshot),
    Malformed(Error),
}

/// Probe `file` for the blob container shape.
///
/// A missing magic or a too-short header is a soft mismatch, not an
/// error; discovery moves on to the next shape. Once the magic matches,
/// any inconsistency is malformed input.
pub fn probe(file: &File, force_in_memory: bool) -> BlobProbe {
    let clone = match file.try_clone() {
        Ok(f) => f,
        Err(source) => {
            return BlobProbe::Malformed(Error::Io {
                context: "reopen snapshot file",
                source,
            })
        }
    };
    let mapper = match FileMapper::new(clone) {
        Ok(m) => m,
        Err(e) => return BlobProbe::Malformed(e),
    };

    if mapper.source_len() < BLOB_HEADER_SIZE {
        return BlobProbe::NoMatch;
    }
    let header = match mapper.map(Protection::ReadOnly, 0, BLOB_HEADER_SIZE as usize) {
        Ok(region) => region,
        Err(e) => return BlobProbe::Malformed(e),
    };
    let bytes = header.as_slice();
    let word = |i: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        u64::from_le_bytes(buf)
    };
    if word(0) != BLOB_MAGIC {
        return BlobProbe::NoMatch;
    }

    let mut sizes = [0u64; 4];
    for (i, size) in sizes.iter_mut().enumerate() {
        let raw = word(i + 1) as i64;
        if raw < 0 {
            return BlobProbe::Malformed(Error::BadBlobContainer("negative blob size"));
        }
        *size = raw as u64;
    }
    drop(header);

    match read_blobs(&mapper, sizes, force_in_memory) {
        Ok(snapshot) => BlobProbe::Matched(snapshot),
        Err(e) => BlobProbe::Malformed(e),
    }
}

fn read_blobs(
    mapper: &FileMapper,
    sizes: [u64; 4],
    force_in_memory: bool,
) -> Result<BlobSnapshot, Error> {
    let positions = blob_positions(sizes);
    let end = positions[3] + sizes[3];
    if end > mapper.source_len() {
        return Err(Error::BadBlobContainer("blob sizes exceed file length"));
    }

    // Instruction blobs (indices 1 and 3) are executable.
    let protections = [
        Protection::ReadOnly,
        Protection::ReadExecute,
        Protection::ReadOnly,
        Protection::ReadExecute,
    ];

    let memory;
    let source: &dyn Mappable = if force_in_memory {
        let contents = mapper.map(Protection::ReadOnly, 0, mapper.source_len() as usize)?;
        memory = MemoryMapper::new(contents.as_slice().to_vec());
        &memory
    } else {
        mapper
    };

    let mut pointers = SnapshotPointers::default();
    let mut regions = Vec::new();
    for i in 0..4 {
        if sizes[i] == 0 {
            continue;
        }
        let region = source.map(protections[i], positions[i], sizes[i] as usize)?;
        let ptr = region.start();
        match i {
            0 => pointers.vm_data = Some(ptr),
            1 => pointers.vm_instructions = Some(ptr),
            2 => pointers.isolate_data = Some(ptr),
            _ => pointers.isolate_instructions = Some(ptr),
        }
        regions.push(region);
    }

    debug!(
        "blob snapshot: sizes {:?}, {} mapped regions{}",
        sizes,
        regions.len(),
        if force_in_memory { " (in memory)" } else { "" }
    );
    Ok(BlobSnapshot { pointers, regions })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_round_to_container_pages() {
        let p = blob_positions([100, 200, 300, 400]);
        assert_eq!(p[0], BLOB_PAGE_SIZE);
        assert_eq!(p[1], 2 * BLOB_PAGE_SIZE);
        assert_eq!(p[2], 3 * BLOB_PAGE_SIZE);
        assert_eq!(p[3], 4 * BLOB_PAGE_SIZE);
    }

    #[test]
    fn zero_size_instruction_blobs_skip_rounding() {
        // No instruction blobs: isolate data packs against vm data's end.
        let p = blob_positions([100, 0, 300, 0]);
        assert_eq!(p[0], BLOB_PAGE_SIZE);
        assert_eq!(p[1], BLOB_PAGE_SIZE + 100);
        assert_eq!(p[2], 2 * BLOB_PAGE_SIZE);
        assert_eq!(p[3], 2 * BLOB_PAGE_SIZE + 300);
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let vm_data: Vec<u8> = (0..5000u32).map(|i| (i % 255) as u8).collect();
        let vm_instructions = vec![0x90u8; 700];
        let isolate_data = vec![0xabu8; 20000];
        let isolate_instructions = vec![0xc3u8; 100];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.snapshot");
        write_snapshot(
            &path,
            &BlobContents {
                vm_data: &vm_data,
                vm_instructions: &vm_instructions,
                isolate_data: &isolate_data,
                isolate_instructions: &isolate_instructions,
            },
        )
        .unwrap();

        let file = File::open(&path).unwrap();
        let snapshot = match probe(&file, false) {
            BlobProbe::Matched(s) => s,
            _ => panic!("expected blob match"),
        };
        let read = |ptr: *const u8, len: usize| unsafe { std::slice::from_raw_parts(ptr, len) };
        let p = &snapshot.pointers;
        assert_eq!(read(p.vm_data.unwrap(), vm_data.len()), &vm_data[..]);
        assert_eq!(
            read(p.vm_instructions.unwrap(), vm_instructions.len()),
            &vm_instructions[..]
        );
        assert_eq!(read(p.isolate_data.unwrap(), isolate_data.len()), &isolate_data[..]);
        assert_eq!(
            read(p.isolate_instructions.unwrap(), isolate_instructions.len()),
            &isolate_instructions[..]
        );
    }

    #[test]
    fn zero_size_blobs_read_back_null() {
        // Scenario: vm blobs absent, isolate blobs present.
        let isolate_data = vec![7u8; 100];
        let isolate_instructions = vec![0xc3u8; 200];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isolate_only.snapshot");
        write_snapshot(
            &path,
            &BlobContents {
                isolate_data: &isolate_data,
                isolate_instructions: &isolate_instructions,
                ..Default::default()
            },
        )
        .unwrap();

        let file = File::open(&path).unwrap();
        let snapshot = match probe(&file, false) {
            BlobProbe::Matched(s) => s,
            _ => panic!("expected blob match"),
        };
        let p = &snapshot.pointers;
        assert!(p.vm_data.is_none());
        assert!(p.vm_instructions.is_none());
        assert!(p.isolate_data.is_some());
        assert!(p.isolate_instructions.is_some());
        let read = |ptr: *const u8, len: usize| unsafe { std::slice::from_raw_parts(ptr, len) };
        assert_eq!(read(p.isolate_data.unwrap(), 100), &isolate_data[..]);
        assert_eq!(read(p.isolate_instructions.unwrap(), 200), &isolate_instructions[..]);
    }

    #[test]
    fn wrong_magic_is_a_soft_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_snapshot");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let file = File::open(&path).unwrap();
        assert!(matches!(probe(&file, false), BlobProbe::NoMatch));
    }

    #[test]
    fn short_file_is_a_soft_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");
        std::fs::write(&path, b"abc").unwrap();
        let file = File::open(&path).unwrap();
        assert!(matches!(probe(&file, false), BlobProbe::NoMatch));
    }

    #[test]
    fn oversized_blob_sizes_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lying_header");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&BLOB_MAGIC.to_le_bytes());
        for size in [0i64, 0, 1 << 40, 0] {
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();
        let file = File::open(&path).unwrap();
        assert!(matches!(probe(&file, false), BlobProbe::Malformed(_)));
    }

    #[test]
    fn in_memory_read_preserves_bytes() {
        let isolate_data = vec![0x5au8; 3000];
        let isolate_instructions = vec![0x90u8; 64];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in_memory.snapshot");
        write_snapshot(
            &path,
            &BlobContents {
                isolate_data: &isolate_data,
                isolate_instructions: &isolate_instructions,
                ..Default::default()
            },
        )
        .unwrap();

        let file = File::open(&path).unwrap();
        let snapshot = match probe(&file, true) {
            BlobProbe::Matched(s) => s,
            _ => panic!("expected blob match"),
        };
        let read = |ptr: *const u8, len: usize| unsafe { std::slice::from_raw_parts(ptr, len) };
        assert_eq!(read(snapshot.pointers.isolate_data.unwrap(), 3000), &isolate_data[..]);
    }
}
