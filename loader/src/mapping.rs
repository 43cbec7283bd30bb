//! Page-Aligned Memory Mapping
//!
//! Wraps the OS mapping primitives behind three abstractions:
//!
//! - [`MappedRegion`]: one owned mapping, created from a byte range that
//!   need *not* be page-aligned. The region remembers the alignment
//!   adjustment so callers get a pointer to exactly the byte they asked
//!   for, while `munmap` still sees the page-aligned base.
//! - [`Reservation`]: one contiguous `PROT_NONE` reservation into which
//!   loadable segments are later placed at fixed offsets.
//! - [`Mappable`]: the byte source behind a mapping, either an open file
//!   (`FileMapper`) or an in-memory buffer (`MemoryMapper`).
//!
//! Every mapping uses the same arithmetic. The mapper computes
//! `adjustment = start % page_size`, maps the page-aligned superset, and
//! hands back `base + adjustment`.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::OnceLock;

use crate::error::Error;

/// The OS page size, queried once.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn round_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment` (a power of two).
pub fn round_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Protection level for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access; used only for address-space reservations.
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadExecute,
}

impl Protection {
    fn as_posix(self) -> libc::c_int {
        match self {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// One owned memory mapping.
///
/// `address()` is the page-aligned base handed to `munmap`; `start()` is
/// the logical pointer corresponding to the byte range the caller asked
/// for. `len()` is the logical length, not the mapped length.
#[derive(Debug)]
pub struct MappedRegion {
    base: *mut u8,
    mapped_length: usize,
    adjustment: usize,
    logical_length: usize,
}

// The region exclusively owns its address range.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Page-aligned base of the underlying mapping.
    pub fn address(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to the first requested byte.
    pub fn start(&self) -> *const u8 {
        unsafe { self.base.add(self.adjustment) }
    }

    /// Length of the requested byte range.
    pub fn len(&self) -> usize {
        self.logical_length
    }

    pub fn is_empty(&self) -> bool {
        self.logical_length == 0
    }

    /// Total mapped length, always a multiple of the page size.
    pub fn mapped_len(&self) -> usize {
        self.mapped_length
    }

    /// The requested bytes as a slice.
    ///
    /// Only valid for readable regions, which every region produced by
    /// this module is.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.start(), self.logical_length) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped_length);
        }
    }
}

/// A byte source that can produce [`MappedRegion`]s for arbitrary ranges.
pub trait Mappable {
    /// Map `length` bytes starting at byte `start` of the source. Neither
    /// value needs to be page-aligned.
    fn map(&self, protection: Protection, start: u64, length: usize) -> Result<MappedRegion, Error>;

    /// Total length of the source in bytes.
    fn source_len(&self) -> u64;

    /// Place `file_length` bytes from source offset `src_offset` at the
    /// fixed offset `reservation_offset` inside `reservation`, with the
    /// given protection. Offsets must share page phase.
    fn place(
        &self,
        reservation: &Reservation,
        reservation_offset: usize,
        src_offset: u64,
        file_length: usize,
        protection: Protection,
    ) -> Result<(), Error>;
}

/// File-backed mapping source.
pub struct FileMapper {
    file: File,
    length: u64,
}

impl FileMapper {
    pub fn new(file: File) -> Result<Self, Error> {
        let length = file
            .metadata()
            .map_err(|e| Error::Io {
                context: "stat snapshot file",
                source: e,
            })?
            .len();
        Ok(FileMapper { file, length })
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Mappable for FileMapper {
    fn map(&self, protection: Protection, start: u64, length: usize) -> Result<MappedRegion, Error> {
        let page = page_size() as u64;
        let adjustment = (start % page) as usize;
        let map_offset = start - adjustment as u64;
        let map_length = (round_up(start + length as u64, page) - map_offset) as usize;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_length,
                protection.as_posix(),
                libc::MAP_PRIVATE,
                self.file.as_raw_fd(),
                map_offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Map(io::Error::last_os_error()));
        }

        Ok(MappedRegion {
            base: base as *mut u8,
            mapped_length: map_length,
            adjustment,
            logical_length: length,
        })
    }

    fn source_len(&self) -> u64 {
        self.length
    }

    fn place(
        &self,
        reservation: &Reservation,
        reservation_offset: usize,
        src_offset: u64,
        file_length: usize,
        protection: Protection,
    ) -> Result<(), Error> {
        let page = page_size() as u64;
        let adjustment = src_offset % page;
        if adjustment != reservation_offset as u64 % page {
            return Err(Error::BadSegmentPhase {
                memory_offset: reservation_offset as u64,
                file_offset: src_offset,
            });
        }
        check_reservation_bounds(reservation, reservation_offset, file_length)?;

        let map_offset = src_offset - adjustment;
        let map_length =
            (round_up(src_offset + file_length as u64, page) - map_offset) as usize;
        let wanted = reservation.base() as usize + reservation_offset - adjustment as usize;

        let got = unsafe {
            libc::mmap(
                wanted as *mut libc::c_void,
                map_length,
                protection.as_posix(),
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                self.file.as_raw_fd(),
                map_offset as libc::off_t,
            )
        };
        if got == libc::MAP_FAILED {
            return Err(Error::Map(io::Error::last_os_error()));
        }
        // An address-space conflict here means the fixed placement cannot
        // be satisfied; the load cannot continue.
        if got as usize != wanted {
            return Err(Error::FixedAddress {
                wanted,
                got: got as usize,
            });
        }
        Ok(())
    }
}

/// In-memory mapping source, used for snapshots that arrive as a byte
/// buffer (PE host sections, forced in-memory loads).
///
/// Every mapping is a fresh anonymous region filled by copy, then set to
/// the requested protection.
pub struct MemoryMapper {
    bytes: Vec<u8>,
}

impl MemoryMapper {
    pub fn new(bytes: Vec<u8>) -> Self {
        MemoryMapper { bytes }
    }
}

impl Mappable for MemoryMapper {
    fn map(&self, protection: Protection, start: u64, length: usize) -> Result<MappedRegion, Error> {
        let end = start
            .checked_add(length as u64)
            .filter(|&e| e <= self.bytes.len() as u64)
            .ok_or(Error::SegmentBounds {
                offset: start,
                size: length as u64,
            })?;

        let page = page_size() as u64;
        let adjustment = (start % page) as usize;
        let map_length = (round_up(start + length as u64, page) - (start - adjustment as u64)) as usize;

        let base = anonymous_map(ptr::null_mut(), map_length, Protection::ReadWrite, 0)?;
        let region = MappedRegion {
            base,
            mapped_length: map_length,
            adjustment,
            logical_length: length,
        };
        unsafe {
            ptr::copy_nonoverlapping(
                self.bytes[start as usize..end as usize].as_ptr(),
                base.add(adjustment),
                length,
            );
        }
        if protection != Protection::ReadWrite {
            protect(base, map_length, protection)?;
        }
        Ok(region)
    }

    fn source_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn place(
        &self,
        reservation: &Reservation,
        reservation_offset: usize,
        src_offset: u64,
        file_length: usize,
        protection: Protection,
    ) -> Result<(), Error> {
        let end = src_offset
            .checked_add(file_length as u64)
            .filter(|&e| e <= self.bytes.len() as u64)
            .ok_or(Error::SegmentBounds {
                offset: src_offset,
                size: file_length as u64,
            })?;
        check_reservation_bounds(reservation, reservation_offset, file_length)?;

        // The reservation pages are anonymous zero pages already; open a
        // write window, copy, then drop to the final protection.
        let page = page_size();
        let window_start = round_down(reservation_offset as u64, page as u64) as usize;
        let window_end =
            round_up((reservation_offset + file_length) as u64, page as u64) as usize;
        reservation.protect(window_start, window_end - window_start, Protection::ReadWrite)?;
        unsafe {
            ptr::copy_nonoverlapping(
                self.bytes[src_offset as usize..end as usize].as_ptr(),
                reservation.base().add(reservation_offset),
                file_length,
            );
        }
        reservation.protect(window_start, window_end - window_start, protection)
    }
}

/// One contiguous virtual address reservation.
///
/// Allocated `PROT_NONE`; loadable segments are placed over its pages with
/// `MAP_FIXED` (file sources) or a copy-through-write-window (memory
/// sources). A single `munmap` of the whole range releases every
/// sub-mapping at once.
#[derive(Debug)]
pub struct Reservation {
    base: *mut u8,
    length: usize,
}

unsafe impl Send for Reservation {}

impl Reservation {
    /// Reserve `length` bytes aligned to `alignment` (a power of two at
    /// least the page size). Over-maps by the alignment and trims the
    /// head and tail back to the kernel.
    pub fn allocate(length: usize, alignment: usize) -> Result<Self, Error> {
        let page = page_size();
        debug_assert!(alignment.is_power_of_two());
        debug_assert_eq!(length % page, 0);

        if alignment <= page {
            let base = anonymous_map(ptr::null_mut(), length, Protection::NoAccess, 0)?;
            return Ok(Reservation { base, length });
        }

        let padded = length + alignment;
        let raw = anonymous_map(ptr::null_mut(), padded, Protection::NoAccess, 0)?;
        let aligned = round_up(raw as u64, alignment as u64) as usize;
        let head = aligned - raw as usize;
        let tail = padded - head - length;
        unsafe {
            if head != 0 {
                libc::munmap(raw as *mut libc::c_void, head);
            }
            if tail != 0 {
                libc::munmap((aligned + length) as *mut libc::c_void, tail);
            }
        }
        Ok(Reservation {
            base: aligned as *mut u8,
            length,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Change the protection of a page-aligned sub-range.
    pub fn protect(&self, offset: usize, length: usize, protection: Protection) -> Result<(), Error> {
        debug_assert!(offset + length <= self.length);
        protect(unsafe { self.base.add(offset) }, length, protection)
    }

    /// Zero `length` bytes at `offset`, temporarily opening a write window
    /// if the range is not currently writable.
    ///
    /// Used for the tail of a segment whose in-memory size exceeds its
    /// file size when the surrounding page carries neighboring file bytes.
    pub fn zero(
        &self,
        offset: usize,
        length: usize,
        final_protection: Protection,
    ) -> Result<(), Error> {
        if length == 0 {
            return Ok(());
        }
        let page = page_size();
        let window_start = round_down(offset as u64, page as u64) as usize;
        let window_end = round_up((offset + length) as u64, page as u64) as usize;
        self.protect(window_start, window_end - window_start, Protection::ReadWrite)?;
        unsafe {
            ptr::write_bytes(self.base.add(offset), 0, length);
        }
        self.protect(window_start, window_end - window_start, final_protection)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.length);
        }
    }
}

/// A placement that would land outside the reservation means the caller
/// was fed inconsistent segment fields; refuse it before touching the
/// address space.
fn check_reservation_bounds(
    reservation: &Reservation,
    reservation_offset: usize,
    length: usize,
) -> Result<(), Error> {
    match reservation_offset.checked_add(length) {
        Some(end) if end <= reservation.len() => Ok(()),
        _ => Err(Error::SegmentBounds {
            offset: reservation_offset as u64,
            size: length as u64,
        }),
    }
}

fn anonymous_map(
    addr: *mut libc::c_void,
    length: usize,
    protection: Protection,
    extra_flags: libc::c_int,
) -> Result<*mut u8, Error> {
    let base = unsafe {
        libc::mmap(
            addr,
            length,
            protection.as_posix(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(Error::Reserve(io::Error::last_os_error()));
    }
    Ok(base as *mut u8)
}

fn protect(base: *mut u8, length: usize, protection: Protection) -> Result<(), Error> {
    let rc = unsafe { libc::mprotect(base as *mut libc::c_void, length, protection.as_posix()) };
    if rc != 0 {
        return Err(Error::Protect(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_with(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();
        (f, bytes)
    }

    #[test]
    fn unaligned_range_maps_with_adjustment() {
        let page = page_size();
        let (f, bytes) = file_with(3 * page);
        let mapper = FileMapper::new(f.reopen().unwrap()).unwrap();

        for &(start, len) in &[(1u64, 10usize), (page as u64 - 1, 2), (17, page + 100)] {
            let region = mapper.map(Protection::ReadOnly, start, len).unwrap();
            // Logical pointer sits exactly start % page into the mapping.
            let offset = region.start() as usize - region.address() as usize;
            assert_eq!(offset, (start % page as u64) as usize);
            assert_eq!(region.mapped_len() % page, 0);
            assert!(region.mapped_len() >= offset + len);
            assert_eq!(region.as_slice(), &bytes[start as usize..start as usize + len]);
        }
    }

    #[test]
    fn zero_length_range_is_valid() {
        let (f, _) = file_with(page_size());
        let mapper = FileMapper::new(f.reopen().unwrap()).unwrap();
        let region = mapper.map(Protection::ReadOnly, 8, 0).unwrap();
        assert!(region.is_empty());
    }

    #[test]
    fn memory_mapper_round_trips_bytes() {
        let bytes: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let mapper = MemoryMapper::new(bytes.clone());
        let region = mapper.map(Protection::ReadOnly, 100, 700).unwrap();
        assert_eq!(region.as_slice(), &bytes[100..800]);
    }

    #[test]
    fn memory_mapper_rejects_out_of_bounds() {
        let mapper = MemoryMapper::new(vec![0u8; 100]);
        assert!(matches!(
            mapper.map(Protection::ReadOnly, 90, 20),
            Err(Error::SegmentBounds { .. })
        ));
    }

    #[test]
    fn reservation_honors_alignment() {
        let page = page_size();
        for align_pages in [1usize, 4, 16] {
            let alignment = align_pages * page;
            let r = Reservation::allocate(8 * page, alignment).unwrap();
            assert_eq!(r.base() as usize % alignment, 0);
            assert_eq!(r.len(), 8 * page);
        }
    }

    #[test]
    fn placed_segment_lands_at_fixed_offset() {
        let page = page_size();
        let (f, bytes) = file_with(4 * page);
        let mapper = FileMapper::new(f.reopen().unwrap()).unwrap();

        let r = Reservation::allocate(4 * page, page).unwrap();
        mapper
            .place(&r, page, page as u64, 2 * page, Protection::ReadOnly)
            .unwrap();

        let loaded = unsafe { std::slice::from_raw_parts(r.base().add(page), 2 * page) };
        assert_eq!(loaded, &bytes[page..3 * page]);
    }

    #[test]
    fn place_rejects_phase_mismatch() {
        let page = page_size();
        let (f, _) = file_with(4 * page);
        let mapper = FileMapper::new(f.reopen().unwrap()).unwrap();
        let r = Reservation::allocate(4 * page, page).unwrap();
        let err = mapper
            .place(&r, page, page as u64 + 1, 16, Protection::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, Error::BadSegmentPhase { .. }));
    }

    #[test]
    fn zero_window_restores_protection() {
        let page = page_size();
        let (f, _) = file_with(2 * page);
        let mapper = FileMapper::new(f.reopen().unwrap()).unwrap();
        let r = Reservation::allocate(2 * page, page).unwrap();
        mapper.place(&r, 0, 0, page, Protection::ReadOnly).unwrap();

        r.zero(page / 2, page / 4, Protection::ReadOnly).unwrap();
        let tail = unsafe { std::slice::from_raw_parts(r.base().add(page / 2), page / 4) };
        assert!(tail.iter().all(|&b| b == 0));
        // Bytes before the zeroed window keep their file contents.
        let head = unsafe { std::slice::from_raw_parts(r.base(), page / 2) };
        assert!(head.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }
}
