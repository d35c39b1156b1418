//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Dynamic link editor
pub const MH_DYLINKER: u32 = 0x7;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// x86_64 all
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Local of function starts
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Main entry point (replacement for LC_UNIXTHREAD)
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Incremental-link sidecar tables
pub const LC_INCREMENTAL: u32 = 0x41;

// =============================================================================
// Section Types
// =============================================================================

/// Section types mask
pub const SECTION_TYPE: u32 = 0x0000_00FF;

/// Regular section
pub const S_REGULAR: u32 = 0x0;
/// Section with non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Section with lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
/// Section with symbol stubs
pub const S_SYMBOL_STUBS: u32 = 0x8;
/// Section with only lazy symbol pointers to lazy loaded dylibs
pub const S_LAZY_DYLIB_SYMBOL_POINTERS: u32 = 0x10;

/// Section contains only true machine instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
/// Section contains some machine instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

/// Weak reference desc bit
pub const N_WEAK_REF: u16 = 0x0040;
/// Weak definition desc bit
pub const N_WEAK_DEF: u16 = 0x0080;

/// Extracts the two-level namespace library ordinal from `n_desc`.
#[inline]
pub fn library_ordinal(n_desc: u16) -> u32 {
    ((n_desc >> 8) & 0xFF) as u32
}

// =============================================================================
// Indirect Symbol Table
// =============================================================================

/// Symbol is local
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
/// Symbol is absolute
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

// =============================================================================
// Dyld Info Rebase Opcodes
// =============================================================================

/// Rebase target is a pointer
pub const REBASE_TYPE_POINTER: u8 = 1;

/// Opcode nibble mask
pub const REBASE_OPCODE_MASK: u8 = 0xF0;
/// Immediate nibble mask
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;

/// End of the rebase stream
pub const REBASE_OPCODE_DONE: u8 = 0x00;
/// Set the rebase type from the immediate
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
/// Select segment (immediate) and offset (uleb)
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
/// Advance the cursor by a uleb delta
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
/// Advance the cursor by immediate × pointer size
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
/// Rebase `immediate` consecutive pointers
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
/// Rebase `uleb` consecutive pointers
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
/// Rebase one pointer, then advance by a uleb delta
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
/// Rebase `uleb` pointers with `uleb` padding between them
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

// =============================================================================
// Dyld Info Bind Opcodes
// =============================================================================

/// Bind target is a pointer
pub const BIND_TYPE_POINTER: u8 = 1;

/// Lookup in the main executable
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
/// Flat namespace lookup
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
/// Weak coalesced lookup
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i64 = -3;

/// Symbol flag: weak import
pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
/// Symbol flag: non-weak definition
pub const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

/// Opcode nibble mask
pub const BIND_OPCODE_MASK: u8 = 0xF0;
/// Immediate nibble mask
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;

/// End of a bind stream (separates runs in the lazy stream)
pub const BIND_OPCODE_DONE: u8 = 0x00;
/// Set the dylib ordinal from the immediate
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
/// Set the dylib ordinal from a uleb
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
/// Set a special (negative) dylib ordinal from the immediate
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
/// Set symbol flags from the immediate; a NUL-terminated name follows
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
/// Set the bind type from the immediate
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
/// Set the addend from a sleb
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
/// Select segment (immediate) and offset (uleb)
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
/// Advance the cursor by a uleb delta
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
/// Bind at the cursor and advance one pointer
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
/// Bind, then advance by a uleb delta plus one pointer
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
/// Bind, then advance by immediate × pointer size plus one pointer
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
/// Bind `uleb` slots with `uleb` padding between them
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
/// Threaded rebase/bind; the immediate is a sub-opcode
pub const BIND_OPCODE_THREADED: u8 = 0xD0;

/// Threaded sub-opcode: size the ordinal table from a uleb
pub const BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB: u8 = 0x00;
/// Threaded sub-opcode: apply the chain
pub const BIND_SUBOPCODE_THREADED_APPLY: u8 = 0x01;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is the output of an incremental link
        const INCRLINK = 0x2;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The object file's undefined references are bound by the dynamic linker
        const BINDATLOAD = 0x8;
        /// The shared library init routine is to be run lazily
        const LAZY_INIT = 0x40;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// The static linker does not need to examine dependent dylibs for re-exports
        const NO_REEXPORTED_DYLIBS = 0x100000;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
    }
}

/// Header flag bits that are never valid on an image this tool accepts.
/// The top nibble is reserved for loader-private state such as
/// `MH_DYLIB_IN_CACHE`.
pub const MH_INVALID_FLAG_BITS: u32 =
    MachOFlags::INCRLINK.bits() | MachOFlags::LAZY_INIT.bits() | 0xF000_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_ordinal() {
        assert_eq!(library_ordinal(0x0100), 1);
        assert_eq!(library_ordinal(0x0300), 3);
        assert_eq!(library_ordinal(0x0000), 0);
        // low byte is unrelated desc state
        assert_eq!(library_ordinal(0x0240), 2);
    }

    #[test]
    fn test_invalid_flag_bits() {
        assert_eq!(MH_INVALID_FLAG_BITS & MachOFlags::PIE.bits(), 0);
        assert_ne!(MH_INVALID_FLAG_BITS & MachOFlags::INCRLINK.bits(), 0);
        assert_ne!(MH_INVALID_FLAG_BITS & 0x8000_0000, 0);
    }
}
