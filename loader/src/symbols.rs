//! Well-Known Snapshot Symbol Names
//!
//! The four data symbols a snapshot image exports, with their
//! per-platform spellings selected once at compile time. Apple targets
//! prefix a leading underscore in the image's own symbol table; the
//! dynamic loader applies that mangling itself, so `dlsym` lookups always
//! use the bare spellings.

use bitflags::bitflags;

/// The spellings of the four snapshot symbols.
#[derive(Debug, Clone, Copy)]
pub struct SymbolNames {
    pub vm_data: &'static str,
    pub vm_instructions: &'static str,
    pub isolate_data: &'static str,
    pub isolate_instructions: &'static str,
}

impl SymbolNames {
    pub fn for_slot(&self, slot: SymbolSlot) -> &'static str {
        match slot {
            SymbolSlot::VmData => self.vm_data,
            SymbolSlot::VmInstructions => self.vm_instructions,
            SymbolSlot::IsolateData => self.isolate_data,
            SymbolSlot::IsolateInstructions => self.isolate_instructions,
        }
    }
}

/// Identifies one of the four output slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSlot {
    VmData,
    VmInstructions,
    IsolateData,
    IsolateInstructions,
}

pub const ALL_SLOTS: [SymbolSlot; 4] = [
    SymbolSlot::VmData,
    SymbolSlot::VmInstructions,
    SymbolSlot::IsolateData,
    SymbolSlot::IsolateInstructions,
];

impl SymbolSlot {
    pub fn interest(self) -> Interest {
        match self {
            SymbolSlot::VmData => Interest::VM_DATA,
            SymbolSlot::VmInstructions => Interest::VM_INSTRUCTIONS,
            SymbolSlot::IsolateData => Interest::ISOLATE_DATA,
            SymbolSlot::IsolateInstructions => Interest::ISOLATE_INSTRUCTIONS,
        }
    }
}

bitflags! {
    /// Which of the four symbols a caller requires to be present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const VM_DATA = 1 << 0;
        const VM_INSTRUCTIONS = 1 << 1;
        const ISOLATE_DATA = 1 << 2;
        const ISOLATE_INSTRUCTIONS = 1 << 3;
    }
}

impl Interest {
    /// The minimum an executable snapshot must provide.
    pub fn isolate_pair() -> Interest {
        Interest::ISOLATE_DATA | Interest::ISOLATE_INSTRUCTIONS
    }
}

/// Spellings as they appear in an image's dynamic symbol table.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const IMAGE_SYMBOLS: SymbolNames = SymbolNames {
    vm_data: "_kDartVmSnapshotData",
    vm_instructions: "_kDartVmSnapshotInstructions",
    isolate_data: "_kDartIsolateSnapshotData",
    isolate_instructions: "_kDartIsolateSnapshotInstructions",
};

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub const IMAGE_SYMBOLS: SymbolNames = SymbolNames {
    vm_data: "kDartVmSnapshotData",
    vm_instructions: "kDartVmSnapshotInstructions",
    isolate_data: "kDartIsolateSnapshotData",
    isolate_instructions: "kDartIsolateSnapshotInstructions",
};

/// Spellings for `dlsym` lookups, identical on every platform.
pub const LIBRARY_SYMBOLS: SymbolNames = SymbolNames {
    vm_data: "kDartVmSnapshotData",
    vm_instructions: "kDartVmSnapshotInstructions",
    isolate_data: "kDartIsolateSnapshotData",
    isolate_instructions: "kDartIsolateSnapshotInstructions",
};
