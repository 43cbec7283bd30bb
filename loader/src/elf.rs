//! ELF64 Object Format
//!
//! Raw structures and constants for the subset of ELF this loader needs:
//! file header, program header table, section header table, and the
//! dynamic symbol/string tables. Snapshot images are always 64-bit
//! little-endian shared objects.

use core::mem::size_of;

use bitflags::bitflags;

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF identification version
pub const EV_CURRENT: u8 = 1;

/// ELF type: shared object
pub const ET_DYN: u16 = 3;

/// Machine type: x86_64
pub const EM_X86_64: u16 = 62;

/// Machine type: AArch64
pub const EM_AARCH64: u16 = 183;

/// Machine type: RISC-V
pub const EM_RISCV: u16 = 243;

/// Machine tag of the architecture this loader was built for. Images for
/// any other architecture are rejected outright.
#[cfg(target_arch = "x86_64")]
pub const EM_TARGET: u16 = EM_X86_64;
#[cfg(target_arch = "aarch64")]
pub const EM_TARGET: u16 = EM_AARCH64;
#[cfg(target_arch = "riscv64")]
pub const EM_TARGET: u16 = EM_RISCV;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

bitflags! {
    /// Segment permission flags from a program header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// ELF64 file header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ElfHeader {
    /// Magic number and other info
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Machine type
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address (unused for snapshots)
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section name string table index
    pub e_shstrndx: u16,
}

/// ELF64 program header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment file offset
    pub p_offset: u64,
    /// Segment virtual address
    pub p_vaddr: u64,
    /// Segment physical address (unused)
    pub p_paddr: u64,
    /// Segment size in file
    pub p_filesz: u64,
    /// Segment size in memory
    pub p_memsz: u64,
    /// Segment alignment
    pub p_align: u64,
}

/// ELF64 section header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SectionHeader {
    /// Section name (string table offset)
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub sh_flags: u64,
    /// Section virtual address
    pub sh_addr: u64,
    /// Section file offset
    pub sh_offset: u64,
    /// Section size
    pub sh_size: u64,
    /// Link to another section
    pub sh_link: u32,
    /// Additional section information
    pub sh_info: u32,
    /// Section alignment
    pub sh_addralign: u64,
    /// Entry size if section holds a table
    pub sh_entsize: u64,
}

/// ELF64 dynamic symbol table entry
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Symbol {
    /// Symbol name (`.dynstr` offset)
    pub st_name: u32,
    /// Type and binding
    pub st_info: u8,
    /// Visibility
    pub st_other: u8,
    /// Defining section index
    pub st_shndx: u16,
    /// Offset from the loaded base
    pub st_value: u64,
    /// Symbol size
    pub st_size: u64,
}

pub const ELF_HEADER_SIZE: usize = size_of::<ElfHeader>();
pub const PROGRAM_HEADER_SIZE: usize = size_of::<ProgramHeader>();
pub const SECTION_HEADER_SIZE: usize = size_of::<SectionHeader>();
pub const SYMBOL_SIZE: usize = size_of::<Symbol>();

/// Read one table entry of type `T` out of a byte slice.
///
/// Returns `None` if the slice cannot hold entry `index`.
pub fn read_entry<T: Copy>(bytes: &[u8], index: usize) -> Option<T> {
    let size = size_of::<T>();
    let offset = index.checked_mul(size)?;
    if offset.checked_add(size)? > bytes.len() {
        return None;
    }
    // SAFETY: bounds checked above; all table entry types are plain
    // repr(C) data with no invalid bit patterns.
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// Read the NUL-terminated string at `offset` in a string table.
pub fn read_cstr(table: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = table.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    Some(&tail[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_sizes_match_format() {
        assert_eq!(ELF_HEADER_SIZE, 64);
        assert_eq!(PROGRAM_HEADER_SIZE, 56);
        assert_eq!(SECTION_HEADER_SIZE, 64);
        assert_eq!(SYMBOL_SIZE, 24);
    }

    #[test]
    fn read_entry_bounds() {
        let bytes = [0u8; 112];
        assert!(read_entry::<ProgramHeader>(&bytes, 0).is_some());
        assert!(read_entry::<ProgramHeader>(&bytes, 1).is_some());
        assert!(read_entry::<ProgramHeader>(&bytes, 2).is_none());
    }

    #[test]
    fn read_cstr_stops_at_nul() {
        let table = b"\0.dynsym\0.dynstr\0";
        assert_eq!(read_cstr(table, 1), Some(&b".dynsym"[..]));
        assert_eq!(read_cstr(table, 9), Some(&b".dynstr"[..]));
        assert_eq!(read_cstr(table, 0), Some(&b""[..]));
        assert_eq!(read_cstr(table, 99), None);
    }
}
