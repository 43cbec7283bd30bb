//! ELF Image Loading
//!
//! Turns a shared-object-shaped snapshot image into a live memory
//! reservation and resolves the well-known snapshot symbols inside it.
//!
//! Parsing runs as a fixed sequence of stages, each entered only if every
//! previous stage succeeded:
//!
//! 1. read header: validate the fixed-size ELF header
//! 2. read program table: map the program header table
//! 3. load segments: size, reserve, and place every PT_LOAD segment
//! 4. read section table + section string table: map the name tables
//! 5. read sections: locate `.dynstr` and `.dynsym` by name
//!
//! Table mappings are transient: each is dropped as soon as the data it
//! exposes has been consumed. The segment reservation lives as long as
//! the [`LoadedImage`], because resolved symbol addresses point into it.

use log::debug;

use crate::elf::{
    read_cstr, read_entry, ElfHeader, ProgramHeader, SectionHeader, SegmentFlags, Symbol,
    ELFCLASS64, ELFDATA2LSB, ELF_HEADER_SIZE, ELF_MAGIC, EM_TARGET, ET_DYN, EV_CURRENT,
    PROGRAM_HEADER_SIZE, PT_LOAD, SECTION_HEADER_SIZE, SYMBOL_SIZE,
};
use crate::error::Error;
use crate::mapping::{page_size, round_up, Mappable, MappedRegion, Protection, Reservation};
use crate::symbols::{Interest, SymbolNames, SymbolSlot, ALL_SLOTS};

/// The four resolved snapshot pointers. A slot is `None` when the image
/// does not export that symbol.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotPointers {
    pub vm_data: Option<*const u8>,
    pub vm_instructions: Option<*const u8>,
    pub isolate_data: Option<*const u8>,
    pub isolate_instructions: Option<*const u8>,
}

impl SnapshotPointers {
    pub fn get(&self, slot: SymbolSlot) -> Option<*const u8> {
        match slot {
            SymbolSlot::VmData => self.vm_data,
            SymbolSlot::VmInstructions => self.vm_instructions,
            SymbolSlot::IsolateData => self.isolate_data,
            SymbolSlot::IsolateInstructions => self.isolate_instructions,
        }
    }

    fn set(&mut self, slot: SymbolSlot, ptr: *const u8) {
        let dest = match slot {
            SymbolSlot::VmData => &mut self.vm_data,
            SymbolSlot::VmInstructions => &mut self.vm_instructions,
            SymbolSlot::IsolateData => &mut self.isolate_data,
            SymbolSlot::IsolateInstructions => &mut self.isolate_instructions,
        };
        *dest = Some(ptr);
    }
}

/// A fully loaded snapshot image.
///
/// Field order is teardown order, the reverse of acquisition: the
/// dynamic tables (held only until symbol resolution) drop first, then
/// the segment reservation, then the byte source.
pub struct LoadedImage {
    dynamic_string_table: Option<MappedRegion>,
    dynamic_symbol_table: Option<MappedRegion>,
    symbol_count: usize,
    reservation: Reservation,
    #[allow(dead_code)]
    source: Box<dyn Mappable + Send>,
}

impl LoadedImage {
    /// Load the image found at byte `elf_data_offset` of `source`.
    ///
    /// The offset must be page-aligned, which is what allows an image
    /// embedded in a larger container file to be mapped directly.
    pub fn load(source: Box<dyn Mappable + Send>, elf_data_offset: u64) -> Result<Self, Error> {
        if elf_data_offset % page_size() as u64 != 0 {
            return Err(Error::MisalignedImage(elf_data_offset));
        }

        let header = read_header(&*source, elf_data_offset)?;

        let program_table = map_image_range(
            &*source,
            elf_data_offset,
            header.e_phoff,
            header.e_phnum as usize * PROGRAM_HEADER_SIZE,
            "program header table",
        )?;
        let reservation =
            load_segments(&*source, elf_data_offset, program_table.as_slice())?;
        drop(program_table);

        let (dynamic_string_table, dynamic_symbol_table, symbol_count) =
            read_sections(&*source, elf_data_offset, &header)?;

        Ok(LoadedImage {
            dynamic_string_table: Some(dynamic_string_table),
            dynamic_symbol_table: Some(dynamic_symbol_table),
            symbol_count,
            reservation,
            source,
        })
    }

    /// Base address of the segment reservation. All symbol values are
    /// offsets from here.
    pub fn base(&self) -> *const u8 {
        self.reservation.base()
    }

    /// Resolve the four well-known snapshot symbols.
    ///
    /// One full linear pass over the dynamic symbol table regardless of
    /// how many slots are required, since symbol table order is not
    /// guaranteed. Every slot named in `required` must be found, or the
    /// whole resolution fails. The dynamic table mappings are released
    /// afterwards; resolution is a one-shot operation.
    pub fn resolve_symbols(
        &mut self,
        names: &SymbolNames,
        required: Interest,
    ) -> Result<SnapshotPointers, Error> {
        let symbol_table = self
            .dynamic_symbol_table
            .take()
            .ok_or(Error::MissingSection(".dynsym"))?;
        let string_table = self
            .dynamic_string_table
            .take()
            .ok_or(Error::MissingSection(".dynstr"))?;

        let base = self.reservation.base();
        let mut found = SnapshotPointers::default();

        // Entry 0 is the reserved sentinel.
        for index in 1..self.symbol_count {
            let symbol: Symbol = read_entry(symbol_table.as_slice(), index)
                .ok_or(Error::Truncated { context: ".dynsym" })?;
            let name = read_cstr(string_table.as_slice(), symbol.st_name as usize)
                .ok_or(Error::Truncated { context: ".dynstr" })?;
            for slot in ALL_SLOTS {
                if name == names.for_slot(slot).as_bytes() {
                    let address = unsafe { base.add(symbol.st_value as usize) };
                    debug!(
                        "resolved {} at base+{:#x}",
                        names.for_slot(slot),
                        symbol.st_value
                    );
                    found.set(slot, address as *const u8);
                }
            }
        }

        for slot in ALL_SLOTS {
            if required.contains(slot.interest()) && found.get(slot).is_none() {
                return Err(Error::MissingSymbol(names.for_slot(slot)));
            }
        }
        Ok(found)
    }
}

/// Map a segment flag triple to a mapping protection.
///
/// Exactly R, R+W, and R+X are supported; everything else is rejected.
pub fn protection_for_flags(raw: u32) -> Result<Protection, Error> {
    let flags = SegmentFlags::from_bits(raw).ok_or(Error::UnsupportedFlags(raw))?;
    if flags == SegmentFlags::READ {
        Ok(Protection::ReadOnly)
    } else if flags == SegmentFlags::READ | SegmentFlags::WRITE {
        Ok(Protection::ReadWrite)
    } else if flags == SegmentFlags::READ | SegmentFlags::EXECUTE {
        Ok(Protection::ReadExecute)
    } else {
        Err(Error::UnsupportedFlags(raw))
    }
}

/// Map a byte range of the image, bounds-checked against the source.
fn map_image_range(
    source: &(dyn Mappable + Send),
    elf_data_offset: u64,
    offset: u64,
    length: usize,
    context: &'static str,
) -> Result<MappedRegion, Error> {
    let start = elf_data_offset
        .checked_add(offset)
        .ok_or(Error::Truncated { context })?;
    match start.checked_add(length as u64) {
        Some(end) if end <= source.source_len() => {
            source.map(Protection::ReadOnly, start, length)
        }
        _ => Err(Error::Truncated { context }),
    }
}

fn read_header(source: &(dyn Mappable + Send), elf_data_offset: u64) -> Result<ElfHeader, Error> {
    let region = map_image_range(source, elf_data_offset, 0, ELF_HEADER_SIZE, "ELF header")?;
    let header: ElfHeader =
        read_entry(region.as_slice(), 0).ok_or(Error::Truncated { context: "ELF header" })?;

    if header.e_ident[0..4] != ELF_MAGIC {
        return Err(Error::BadMagic);
    }
    if header.e_ident[4] != ELFCLASS64 {
        return Err(Error::WrongClass(header.e_ident[4]));
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(Error::WrongEndianness(header.e_ident[5]));
    }
    if header.e_ident[6] != EV_CURRENT || header.e_version != 1 {
        return Err(Error::WrongVersion);
    }
    if header.e_type != ET_DYN {
        return Err(Error::WrongObjectType(header.e_type));
    }
    if header.e_machine != EM_TARGET {
        return Err(Error::WrongArchitecture {
            found: header.e_machine,
            expected: EM_TARGET,
        });
    }
    // The reader only understands tables whose entries are exactly the
    // sizes compiled in here.
    if header.e_ehsize as usize != ELF_HEADER_SIZE {
        return Err(Error::BadEntrySize {
            table: "ELF header",
            found: header.e_ehsize,
            expected: ELF_HEADER_SIZE,
        });
    }
    if header.e_phentsize as usize != PROGRAM_HEADER_SIZE {
        return Err(Error::BadEntrySize {
            table: "program header table",
            found: header.e_phentsize,
            expected: PROGRAM_HEADER_SIZE,
        });
    }
    if header.e_shentsize as usize != SECTION_HEADER_SIZE {
        return Err(Error::BadEntrySize {
            table: "section header table",
            found: header.e_shentsize,
            expected: SECTION_HEADER_SIZE,
        });
    }

    debug!(
        "ELF header ok: machine {}, {} segments, {} sections",
        header.e_machine, header.e_phnum, header.e_shnum
    );
    Ok(header)
}

/// Two passes over the program header table: size the whole footprint,
/// reserve it once, then place every PT_LOAD segment at its baked-in
/// relative offset.
///
/// Segments cannot be mapped at independent OS-chosen addresses: pointers
/// inside the snapshot reference each other through base-relative offsets
/// fixed at snapshot-creation time.
fn load_segments(
    source: &(dyn Mappable + Send),
    elf_data_offset: u64,
    program_table: &[u8],
) -> Result<Reservation, Error> {
    let page = page_size() as u64;
    let segment_count = program_table.len() / PROGRAM_HEADER_SIZE;

    // Pass 1: footprint and alignment, validating each segment.
    let mut total_memory: u64 = 0;
    let mut max_alignment: u64 = page;
    let mut loadable = 0usize;
    for index in 0..segment_count {
        let ph: ProgramHeader = read_entry(program_table, index).ok_or(Error::Truncated {
            context: "program header table",
        })?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        loadable += 1;

        if ph.p_align > 1 && !ph.p_align.is_power_of_two() {
            return Err(Error::BadAlignment(ph.p_align));
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(Error::SegmentBounds {
                offset: ph.p_offset,
                size: ph.p_filesz,
            });
        }
        // Every field here comes from the file; all arithmetic on them
        // must be checked.
        let memory_end = ph
            .p_vaddr
            .checked_add(ph.p_memsz)
            .filter(|&end| end <= u64::MAX - page)
            .ok_or(Error::SegmentBounds {
                offset: ph.p_vaddr,
                size: ph.p_memsz,
            })?;
        let file_start = elf_data_offset
            .checked_add(ph.p_offset)
            .ok_or(Error::SegmentBounds {
                offset: ph.p_offset,
                size: ph.p_filesz,
            })?;
        if ph.p_vaddr % page != file_start % page {
            return Err(Error::BadSegmentPhase {
                memory_offset: ph.p_vaddr,
                file_offset: file_start,
            });
        }
        match file_start.checked_add(ph.p_filesz) {
            Some(end) if end <= source.source_len() => {}
            _ => {
                return Err(Error::SegmentBounds {
                    offset: ph.p_offset,
                    size: ph.p_filesz,
                })
            }
        }
        // Reject unsupported flag combinations before reserving anything.
        protection_for_flags(ph.p_flags)?;

        total_memory = total_memory.max(memory_end);
        max_alignment = max_alignment.max(ph.p_align);
    }
    if loadable == 0 {
        return Err(Error::NoLoadableSegments);
    }

    let total_memory = round_up(total_memory, page);
    let reservation = Reservation::allocate(total_memory as usize, max_alignment as usize)?;
    debug!(
        "reserved {:#x} bytes at {:p} for {} segments",
        total_memory,
        reservation.base(),
        loadable
    );

    // Pass 2: place each segment inside the reservation.
    for index in 0..segment_count {
        let ph: ProgramHeader = read_entry(program_table, index).ok_or(Error::Truncated {
            context: "program header table",
        })?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        let protection = protection_for_flags(ph.p_flags)?;
        let memory_offset = ph.p_vaddr as usize;
        let file_length = ph.p_filesz as usize;
        let memory_length = ph.p_memsz as usize;

        if file_length > 0 {
            source.place(
                &reservation,
                memory_offset,
                elf_data_offset + ph.p_offset,
                file_length,
                protection,
            )?;
        }
        if memory_length > file_length {
            zero_fill_tail(
                &reservation,
                memory_offset,
                file_length,
                memory_length,
                protection,
            )?;
        }
        debug!(
            "segment {}: base+{:#x}, file {:#x}, memory {:#x}, {:?}",
            index, memory_offset, file_length, memory_length, protection
        );
    }

    Ok(reservation)
}

/// Stages 4 and 5: map the section header table and its string table,
/// then scan for `.dynstr` and `.dynsym`. The table mappings made here
/// are dropped on return; only the two dynamic tables survive.
fn read_sections(
    source: &(dyn Mappable + Send),
    elf_data_offset: u64,
    header: &ElfHeader,
) -> Result<(MappedRegion, MappedRegion, usize), Error> {
    let section_table = map_image_range(
        source,
        elf_data_offset,
        header.e_shoff,
        header.e_shnum as usize * SECTION_HEADER_SIZE,
        "section header table",
    )?;
    let section_at = |index: usize| -> Result<SectionHeader, Error> {
        read_entry(section_table.as_slice(), index).ok_or(Error::Truncated {
            context: "section header table",
        })
    };

    if header.e_shstrndx as usize >= header.e_shnum as usize {
        return Err(Error::MissingSection(".shstrtab"));
    }
    let names_section = section_at(header.e_shstrndx as usize)?;
    let section_names = map_image_range(
        source,
        elf_data_offset,
        names_section.sh_offset,
        names_section.sh_size as usize,
        ".shstrtab",
    )?;

    let mut dynamic_string_table = None;
    let mut dynamic_symbol_table = None;
    let mut symbol_count = 0usize;
    for index in 0..header.e_shnum as usize {
        let section = section_at(index)?;
        let name = read_cstr(section_names.as_slice(), section.sh_name as usize)
            .ok_or(Error::Truncated { context: ".shstrtab" })?;
        if name == b".dynstr" {
            dynamic_string_table = Some(map_image_range(
                source,
                elf_data_offset,
                section.sh_offset,
                section.sh_size as usize,
                ".dynstr",
            )?);
        } else if name == b".dynsym" {
            symbol_count = section.sh_size as usize / SYMBOL_SIZE;
            dynamic_symbol_table = Some(map_image_range(
                source,
                elf_data_offset,
                section.sh_offset,
                section.sh_size as usize,
                ".dynsym",
            )?);
        }
    }

    match (dynamic_string_table, dynamic_symbol_table) {
        (Some(strings), Some(symbols)) => Ok((strings, symbols, symbol_count)),
        (None, _) => Err(Error::MissingSection(".dynstr")),
        (_, None) => Err(Error::MissingSection(".dynsym")),
    }
}

/// Zero the BSS-style tail of a segment whose in-memory size exceeds its
/// file size.
///
/// Whole pages past the file-backed range reuse the reservation's
/// anonymous zero pages and only need the segment's protection. A partial
/// tail inside the last file-backed page may hold neighboring file bytes
/// and is zeroed explicitly.
fn zero_fill_tail(
    reservation: &Reservation,
    memory_offset: usize,
    file_length: usize,
    memory_length: usize,
    protection: Protection,
) -> Result<(), Error> {
    let page = page_size();
    let file_end = memory_offset + file_length;
    let memory_end = memory_offset + memory_length;

    // Never extend below the segment's own start: rounding down would
    // re-protect bytes of a preceding segment sharing the page.
    let mapped_end = if file_length > 0 {
        round_up(file_end as u64, page as u64) as usize
    } else {
        round_up(memory_offset as u64, page as u64) as usize
    };

    if file_length > 0 && file_end < mapped_end.min(memory_end) {
        reservation.zero(file_end, mapped_end.min(memory_end) - file_end, protection)?;
    }
    if memory_end > mapped_end {
        let anon_end = round_up(memory_end as u64, page as u64) as usize;
        reservation.protect(mapped_end, anon_end - mapped_end, protection)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_triples_map_to_protections() {
        assert_eq!(protection_for_flags(4).unwrap(), Protection::ReadOnly);
        assert_eq!(protection_for_flags(6).unwrap(), Protection::ReadWrite);
        assert_eq!(protection_for_flags(5).unwrap(), Protection::ReadExecute);
    }

    #[test]
    fn unsupported_flag_combinations_rejected() {
        // W+X, X-only, W-only, none, and out-of-range bits.
        for raw in [7u32, 1, 2, 0, 3, 8, 12] {
            assert!(
                matches!(protection_for_flags(raw), Err(Error::UnsupportedFlags(r)) if r == raw),
                "flags {raw:#x} should be rejected"
            );
        }
    }
}
