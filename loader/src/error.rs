use std::io;
use std::path::PathBuf;

/// All errors produced by the snapshot loader.
///
/// Variants are split into two categories:
/// - **Malformed input**: an externally produced file failed validation.
///   The in-progress load is fully unwound before the error is returned.
/// - **Resource failures**: the OS refused a map/reserve/open call. These
///   are fatal to the loading attempt; the embedder decides whether they
///   are fatal to the process.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ── Malformed input ──────────────────────────────────────────────

    #[error("file too short for {context}")]
    Truncated { context: &'static str },

    #[error("invalid ELF magic")]
    BadMagic,

    #[error("expected a 64-bit image (ELF class {0})")]
    WrongClass(u8),

    #[error("expected a little-endian image (encoding {0})")]
    WrongEndianness(u8),

    #[error("unexpected ELF version")]
    WrongVersion,

    #[error("expected a shared-object image (type {0})")]
    WrongObjectType(u16),

    #[error("image built for another architecture (machine {found}, expected {expected})")]
    WrongArchitecture { found: u16, expected: u16 },

    #[error("{table} entry size is {found}, expected {expected}")]
    BadEntrySize {
        table: &'static str,
        found: u16,
        expected: usize,
    },

    #[error("image offset {0:#x} is not page-aligned")]
    MisalignedImage(u64),

    #[error("segment memory offset {memory_offset:#x} and file offset {file_offset:#x} have different page phase")]
    BadSegmentPhase { memory_offset: u64, file_offset: u64 },

    #[error("segment alignment {0:#x} is not a power of two")]
    BadAlignment(u64),

    #[error("unsupported segment flag combination {0:#x}")]
    UnsupportedFlags(u32),

    #[error("segment extends beyond the image (offset {offset:#x}, size {size:#x})")]
    SegmentBounds { offset: u64, size: u64 },

    #[error("no loadable segments")]
    NoLoadableSegments,

    #[error("could not find section {0}")]
    MissingSection(&'static str),

    #[error("could not find symbol {0}")]
    MissingSymbol(&'static str),

    #[error("malformed {context} in host container")]
    BadHostContainer { context: &'static str },

    #[error("snapshot blob container is malformed: {0}")]
    BadBlobContainer(&'static str),

    #[error("no known snapshot format matched")]
    UnknownFormat,

    // ── Resource failures ────────────────────────────────────────────

    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to {context}: {source}")]
    Io {
        context: &'static str,
        source: io::Error,
    },

    #[error("memory map failed: {0}")]
    Map(io::Error),

    #[error("virtual memory reservation failed: {0}")]
    Reserve(io::Error),

    #[error("memory protection change failed: {0}")]
    Protect(io::Error),

    #[error("kernel did not honor fixed mapping address {wanted:#x} (got {got:#x})")]
    FixedAddress { wanted: usize, got: usize },

    #[error("dynamic library error: {0}")]
    Library(String),
}
