//! Mach-O Host Container Sniffer
//!
//! A snapshot image may be embedded inside a Mach-O host executable as an
//! `LC_NOTE` load command whose data-owner name is the reserved constant
//! below. Only enough of the format to walk the load command list is
//! implemented; everything else in the host binary is opaque.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::debug;

use crate::error::Error;

/// 64-bit little-endian Mach-O magic.
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

/// Load command: arbitrary data note.
pub const LC_NOTE: u32 = 0x31;

/// Data-owner name identifying the embedded snapshot note.
pub const NOTE_OWNER: &[u8] = b"snapshot";

/// Mach-O 64-bit header size: magic, cputype, cpusubtype, filetype,
/// ncmds, sizeofcmds, flags, reserved.
const HEADER_SIZE: usize = 32;

/// LC_NOTE layout: cmd, cmdsize, data_owner[16], offset, size.
const NOTE_SIZE: usize = 40;

/// Upper bound on a plausible load command region.
const MAX_COMMANDS_SIZE: u32 = 16 * 1024 * 1024;

/// Probe `file` for a Mach-O host carrying a snapshot note.
///
/// Returns the note's `(file_offset, size)` on a match, `None` when the
/// file is not a Mach-O image or carries no snapshot note, and an error
/// when the file is Mach-O-shaped but its command list is inconsistent.
pub fn probe(file: &File) -> Result<Option<(u64, u64)>, Error> {
    let mut header = [0u8; HEADER_SIZE];
    if file.read_exact_at(&mut header, 0).is_err() {
        return Ok(None);
    }
    if read_u32(&header, 0) != MH_MAGIC_64 {
        return Ok(None);
    }

    let ncmds = read_u32(&header, 16);
    let sizeofcmds = read_u32(&header, 20);
    if sizeofcmds > MAX_COMMANDS_SIZE {
        return Err(Error::BadHostContainer {
            context: "Mach-O load command region",
        });
    }

    let mut commands = vec![0u8; sizeofcmds as usize];
    file.read_exact_at(&mut commands, HEADER_SIZE as u64)
        .map_err(|_| Error::BadHostContainer {
            context: "Mach-O load command region",
        })?;

    let mut cursor = 0usize;
    for _ in 0..ncmds {
        if cursor + 8 > commands.len() {
            return Err(Error::BadHostContainer {
                context: "Mach-O load command list",
            });
        }
        let cmd = read_u32(&commands, cursor);
        let cmdsize = read_u32(&commands, cursor + 4) as usize;
        if cmdsize < 8 || cursor + cmdsize > commands.len() {
            return Err(Error::BadHostContainer {
                context: "Mach-O load command size",
            });
        }
        if cmd == LC_NOTE && cmdsize >= NOTE_SIZE {
            let owner = &commands[cursor + 8..cursor + 24];
            if owner_matches(owner) {
                let offset = read_u64(&commands, cursor + 24);
                let size = read_u64(&commands, cursor + 32);
                debug!("Mach-O snapshot note at {:#x}, {:#x} bytes", offset, size);
                return Ok(Some((offset, size)));
            }
        }
        cursor += cmdsize;
    }
    Ok(None)
}

/// The 16-byte data-owner field is the reserved name, NUL padded.
fn owner_matches(owner: &[u8]) -> bool {
    owner.len() == 16
        && owner.starts_with(NOTE_OWNER)
        && owner[NOTE_OWNER.len()..].iter().all(|&b| b == 0)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Build the header and command-list prefix of a Mach-O host image with
/// one snapshot note.
#[cfg(test)]
fn build_host_prefix(note_offset: u64, note_size: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
    bytes.extend_from_slice(&0x0100_000cu32.to_le_bytes()); // cputype
    bytes.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
    bytes.extend_from_slice(&2u32.to_le_bytes()); // filetype: execute
    bytes.extend_from_slice(&1u32.to_le_bytes()); // ncmds
    bytes.extend_from_slice(&(NOTE_SIZE as u32).to_le_bytes()); // sizeofcmds
    bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
    bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved

    bytes.extend_from_slice(&LC_NOTE.to_le_bytes());
    bytes.extend_from_slice(&(NOTE_SIZE as u32).to_le_bytes());
    let mut owner = [0u8; 16];
    owner[..NOTE_OWNER.len()].copy_from_slice(NOTE_OWNER);
    bytes.extend_from_slice(&owner);
    bytes.extend_from_slice(&note_offset.to_le_bytes());
    bytes.extend_from_slice(&note_size.to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_from(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn non_macho_is_a_soft_mismatch() {
        let f = file_from(b"definitely not mach-o");
        assert!(probe(f.as_file()).unwrap().is_none());
    }

    #[test]
    fn note_is_found() {
        let f = file_from(&build_host_prefix(0x4000, 123));
        assert_eq!(probe(f.as_file()).unwrap(), Some((0x4000, 123)));
    }

    #[test]
    fn wrong_owner_name_is_skipped() {
        let mut bytes = build_host_prefix(0x4000, 123);
        bytes[HEADER_SIZE + 8] = b'x';
        let f = file_from(&bytes);
        assert!(probe(f.as_file()).unwrap().is_none());
    }

    #[test]
    fn truncated_command_list_is_malformed() {
        let mut bytes = build_host_prefix(0x4000, 123);
        bytes.truncate(HEADER_SIZE + 8);
        let f = file_from(&bytes);
        assert!(probe(f.as_file()).is_err());
    }

    #[test]
    fn zero_cmdsize_is_malformed() {
        let mut bytes = build_host_prefix(0x4000, 123);
        bytes[HEADER_SIZE + 4..HEADER_SIZE + 8].fill(0);
        let f = file_from(&bytes);
        assert!(probe(f.as_file()).is_err());
    }
}
