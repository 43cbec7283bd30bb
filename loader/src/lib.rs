//! AOT/JIT Snapshot Loading
//!
//! Takes a previously produced snapshot artifact (compiled code and heap
//! data) and makes it usable by a running program without recompilation.
//!
//! A snapshot file can arrive in several container shapes: a raw blob
//! container, a bare ELF image, an ELF image appended to a host file, or
//! an ELF image embedded in a Mach-O or PE host executable. Discovery
//! ([`Snapshot::try_read`]) probes the shapes in a fixed order; the
//! resulting [`Snapshot`] handle exposes the four well-known pointers
//! (VM data, VM instructions, isolate data, isolate instructions) and
//! owns every mapping behind them until it is dropped.
//!
//! # Shape Support
//!
//! - Blob container read/write ([`write_snapshot`], [`Snapshot::try_read`])
//! - ELF images, standalone or embedded at a page-aligned offset
//! - Mach-O `LC_NOTE` and PE `snapshot`-section host binaries
//! - Shared-library snapshots via the OS dynamic loader
//!
//! # Safety
//!
//! The loader validates every externally produced structure before
//! trusting it: header magic/class/architecture, table entry sizes,
//! segment flag triples, page-phase invariants, and file bounds. Loading
//! is synchronous; a failed load unwinds every mapping it acquired.

pub mod blob;
pub mod container;
pub mod dylib;
pub mod elf;
pub mod error;
pub mod image;
pub mod mapping;
pub mod macho;
pub mod pe;
pub mod snapshot;
pub mod symbols;

pub use blob::{write_snapshot, BlobContents};
pub use container::{try_read, ReadOptions};
pub use error::Error;
pub use snapshot::{Snapshot, SnapshotShape};

use std::path::Path;

impl Snapshot {
    /// Try every known container shape against `path`; see
    /// [`container::try_read`].
    pub fn try_read(path: &Path, options: ReadOptions) -> Result<Option<Snapshot>, Error> {
        container::try_read(path, options)
    }
}
