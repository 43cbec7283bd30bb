//! PE Host Container Sniffer
//!
//! A snapshot image may be embedded inside a PE host executable as a COFF
//! section literally named `snapshot`. PE section file alignment can be
//! smaller than the OS page size, so the matched section cannot be mapped
//! by file offset; its bytes are copied into a heap buffer and loaded via
//! the in-memory variant instead.

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::debug;

use crate::error::Error;

const DOS_MAGIC: [u8; 2] = *b"MZ";
const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";

/// Offset of the `e_lfanew` field holding the PE signature offset.
const PE_OFFSET_FIELD: u64 = 0x3c;

/// COFF file header size: machine, nsections, timestamp, symtab pointer,
/// nsymbols, optional header size, characteristics.
const COFF_HEADER_SIZE: usize = 20;

/// COFF section header size.
const SECTION_HEADER_SIZE: usize = 40;

/// Name of the section carrying the embedded snapshot; exactly fills the
/// 8-byte section name field.
pub const SNAPSHOT_SECTION: &[u8; 8] = b"snapshot";

/// Upper bound on a plausible section count.
const MAX_SECTIONS: u16 = 4096;

/// Probe `file` for a PE host carrying a snapshot section.
///
/// Returns the section's bytes copied to a heap buffer on a match, `None`
/// when the file is not PE-shaped or has no snapshot section, and an
/// error when the file is PE-shaped but inconsistent.
pub fn probe(file: &File) -> Result<Option<Vec<u8>>, Error> {
    let mut dos_magic = [0u8; 2];
    if file.read_exact_at(&mut dos_magic, 0).is_err() || dos_magic != DOS_MAGIC {
        return Ok(None);
    }

    let mut offset_field = [0u8; 4];
    if file.read_exact_at(&mut offset_field, PE_OFFSET_FIELD).is_err() {
        return Ok(None);
    }
    let pe_offset = u32::from_le_bytes(offset_field) as u64;

    let mut signature = [0u8; 4];
    if file.read_exact_at(&mut signature, pe_offset).is_err() || signature != PE_SIGNATURE {
        return Ok(None);
    }

    let mut coff = [0u8; COFF_HEADER_SIZE];
    file.read_exact_at(&mut coff, pe_offset + 4)
        .map_err(|_| Error::BadHostContainer {
            context: "PE COFF header",
        })?;
    let section_count = u16::from_le_bytes([coff[2], coff[3]]);
    let optional_header_size = u16::from_le_bytes([coff[16], coff[17]]);
    if section_count > MAX_SECTIONS {
        return Err(Error::BadHostContainer {
            context: "PE section count",
        });
    }

    let file_length = file
        .metadata()
        .map_err(|source| Error::Io {
            context: "stat snapshot file",
            source,
        })?
        .len();

    let table_offset = pe_offset + 4 + COFF_HEADER_SIZE as u64 + optional_header_size as u64;
    let mut table = vec![0u8; section_count as usize * SECTION_HEADER_SIZE];
    file.read_exact_at(&mut table, table_offset)
        .map_err(|_| Error::BadHostContainer {
            context: "PE section table",
        })?;

    for index in 0..section_count as usize {
        let entry = &table[index * SECTION_HEADER_SIZE..(index + 1) * SECTION_HEADER_SIZE];
        if &entry[0..8] != SNAPSHOT_SECTION {
            continue;
        }
        let raw_size = u32::from_le_bytes([entry[16], entry[17], entry[18], entry[19]]) as usize;
        let raw_offset = u32::from_le_bytes([entry[20], entry[21], entry[22], entry[23]]) as u64;
        // Validate the claimed extent against the file before allocating
        // a buffer sized by an untrusted header field.
        if raw_offset + raw_size as u64 > file_length {
            return Err(Error::BadHostContainer {
                context: "PE snapshot section bounds",
            });
        }
        let mut bytes = vec![0u8; raw_size];
        file.read_exact_at(&mut bytes, raw_offset)
            .map_err(|_| Error::BadHostContainer {
                context: "PE snapshot section data",
            })?;
        debug!(
            "PE snapshot section: {:#x} bytes copied from {:#x}",
            raw_size, raw_offset
        );
        return Ok(Some(bytes));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// A minimal PE host: DOS stub, PE signature, COFF header, one
    /// section table entry, and the section payload.
    fn build_host(payload: &[u8], payload_offset: u32) -> Vec<u8> {
        let pe_offset = 0x80u32;
        let mut bytes = vec![0u8; pe_offset as usize];
        bytes[0..2].copy_from_slice(&DOS_MAGIC);
        bytes[PE_OFFSET_FIELD as usize..PE_OFFSET_FIELD as usize + 4]
            .copy_from_slice(&pe_offset.to_le_bytes());

        bytes.extend_from_slice(&PE_SIGNATURE);
        let mut coff = [0u8; COFF_HEADER_SIZE];
        coff[2..4].copy_from_slice(&1u16.to_le_bytes()); // one section
        bytes.extend_from_slice(&coff);

        let mut section = [0u8; SECTION_HEADER_SIZE];
        section[0..8].copy_from_slice(SNAPSHOT_SECTION);
        section[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        section[20..24].copy_from_slice(&payload_offset.to_le_bytes());
        bytes.extend_from_slice(&section);

        bytes.resize(payload_offset as usize, 0);
        bytes.extend_from_slice(payload);
        bytes
    }

    fn file_from(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn non_pe_is_a_soft_mismatch() {
        let f = file_from(b"#!/bin/sh\necho hi\n");
        assert!(probe(f.as_file()).unwrap().is_none());
    }

    #[test]
    fn mz_without_pe_signature_is_a_soft_mismatch() {
        let mut bytes = vec![0u8; 0x90];
        bytes[0..2].copy_from_slice(&DOS_MAGIC);
        bytes[PE_OFFSET_FIELD as usize..PE_OFFSET_FIELD as usize + 4]
            .copy_from_slice(&0x80u32.to_le_bytes());
        let f = file_from(&bytes);
        assert!(probe(f.as_file()).unwrap().is_none());
    }

    #[test]
    fn snapshot_section_bytes_are_copied() {
        // Sub-page alignment on purpose: 0x200 is a typical PE file
        // alignment and far below any OS page size.
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let f = file_from(&build_host(&payload, 0x200));
        assert_eq!(probe(f.as_file()).unwrap(), Some(payload));
    }

    #[test]
    fn oversized_section_size_is_rejected_before_allocation() {
        let payload = vec![1u8; 100];
        let mut bytes = build_host(&payload, 0x200);
        // The section size field claims ~4 GiB; the file does not.
        let size_field = 0x80 + 4 + COFF_HEADER_SIZE + 16;
        bytes[size_field..size_field + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let f = file_from(&bytes);
        assert!(matches!(
            probe(f.as_file()),
            Err(Error::BadHostContainer { .. })
        ));
    }

    #[test]
    fn missing_section_data_is_malformed() {
        let payload = vec![1u8; 100];
        let mut bytes = build_host(&payload, 0x200);
        bytes.truncate(0x220);
        let f = file_from(&bytes);
        assert!(probe(f.as_file()).is_err());
    }
}
