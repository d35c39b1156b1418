//! Synthetic image builder shared by the module tests.
//!
//! Constructs a complete little arm64 executable in memory: four segments,
//! stub/GOT/ObjC sections, a symbol table with imports, dyld-info opcode
//! streams with reserved tails, and a full incremental sidecar. The layout
//! constants are exported so tests can assert against exact addresses.

use zerocopy::IntoBytes;

use crate::macho::*;
use crate::sidecar::{
    serialize_sidecar, AtomEntry, Fixup, GlobalSymbol, InputEntry, InputKind, PatchSpace, Sidecar,
};

pub(crate) const BASE: u64 = 0x1_0000_0000;
pub(crate) const FILE_SIZE: usize = 0x8000;

pub(crate) const TEXT_ADDR: u64 = BASE + 0x1000;
pub(crate) const TEXT_OFFSET: u64 = 0x1000;
pub(crate) const TEXT_SIZE: u64 = 0x100;
pub(crate) const TEXT_PATCH_OFFSET: u64 = 0x80;
pub(crate) const TEXT_PATCH_SPACE: u32 = 0x80;

pub(crate) const STUBS_ADDR: u64 = BASE + 0x2000;
pub(crate) const GOT_ADDR: u64 = BASE + 0x4000;
pub(crate) const CLASSLIST_ADDR: u64 = BASE + 0x4100;
pub(crate) const OBJC_CONST_ADDR: u64 = BASE + 0x4200;
pub(crate) const CLASSNAME_ADDR: u64 = BASE + 0x3000;
pub(crate) const LA_PTR_ADDR: u64 = BASE + 0x5000;
pub(crate) const OBJC_DATA_ADDR: u64 = BASE + 0x5100;
pub(crate) const CLASSREFS_ADDR: u64 = BASE + 0x5200;

pub(crate) const SYMOFF: u32 = 0x6000;
pub(crate) const STROFF: u32 = 0x6100;
pub(crate) const STRSIZE: u32 = 0x100;
pub(crate) const STRING_POOL_USED: u64 = 77;
pub(crate) const INDIRECT_OFF: u32 = 0x6200;
// declared dyld-info sizes cover the used prefix; each reserved tail is
// described by the matching patch-space entry
pub(crate) const REBASE_OFF: u32 = 0x6220;
pub(crate) const REBASE_USED: u64 = 10;
pub(crate) const REBASE_RESERVED: u32 = 22;
pub(crate) const BIND_OFF: u32 = 0x6240;
pub(crate) const LAZY_BIND_OFF: u32 = 0x6260;
pub(crate) const SIDECAR_OFF: u32 = 0x6300;

pub(crate) const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

pub(crate) struct ImageFixture {
    pub bytes: Vec<u8>,
}

impl ImageFixture {
    /// Builds the default fixture.
    pub fn build() -> Self {
        Self::build_with(|_| {})
    }

    /// Builds the fixture with the sidecar adjusted before serialization.
    pub fn build_with(tweak: impl FnOnce(&mut Sidecar)) -> Self {
        let mut bytes = vec![0u8; FILE_SIZE];

        let mut sidecar = default_sidecar();
        tweak(&mut sidecar);
        let (incr_cmd, sidecar_blob) = serialize_sidecar(&sidecar, SIDECAR_OFF);
        bytes[SIDECAR_OFF as usize..SIDECAR_OFF as usize + sidecar_blob.len()]
            .copy_from_slice(&sidecar_blob);

        let bind_stream = bind_stream();
        let lazy_stream = lazy_bind_stream();

        // -- load commands --
        let mut cmds: Vec<u8> = Vec::new();

        cmds.extend_from_slice(text_segment().as_bytes());
        cmds.extend_from_slice(text_section().as_bytes());
        cmds.extend_from_slice(stubs_section().as_bytes());
        cmds.extend_from_slice(classname_section().as_bytes());

        cmds.extend_from_slice(data_const_segment().as_bytes());
        cmds.extend_from_slice(got_section().as_bytes());
        cmds.extend_from_slice(classlist_section().as_bytes());
        cmds.extend_from_slice(objc_const_section().as_bytes());

        cmds.extend_from_slice(data_segment().as_bytes());
        cmds.extend_from_slice(la_ptr_section().as_bytes());
        cmds.extend_from_slice(objc_data_section().as_bytes());
        cmds.extend_from_slice(classrefs_section().as_bytes());

        cmds.extend_from_slice(linkedit_segment().as_bytes());

        // LC_LOAD_DYLINKER
        cmds.extend_from_slice(&LC_LOAD_DYLINKER.to_le_bytes());
        cmds.extend_from_slice(&32u32.to_le_bytes());
        cmds.extend_from_slice(&12u32.to_le_bytes());
        cmds.extend_from_slice(b"/usr/lib/dyld\0\0\0\0\0\0\0");

        // LC_LOAD_DYLIB libSystem
        let dylib_name = LIBSYSTEM.as_bytes();
        let dylib_cmdsize = crate::util::align_up((24 + dylib_name.len() + 1) as u64, 8) as u32;
        cmds.extend_from_slice(&LC_LOAD_DYLIB.to_le_bytes());
        cmds.extend_from_slice(&dylib_cmdsize.to_le_bytes());
        cmds.extend_from_slice(&24u32.to_le_bytes()); // name offset
        cmds.extend_from_slice(&2u32.to_le_bytes()); // timestamp
        cmds.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // current version
        cmds.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // compat version
        cmds.extend_from_slice(dylib_name);
        cmds.resize(cmds.len() + dylib_cmdsize as usize - 24 - dylib_name.len(), 0);

        // LC_MAIN
        let entry = EntryPointCommand {
            cmd: LC_MAIN,
            cmdsize: EntryPointCommand::SIZE as u32,
            entryoff: TEXT_OFFSET,
            stacksize: 0,
        };
        cmds.extend_from_slice(entry.as_bytes());

        // LC_SYMTAB
        let symtab = SymtabCommand {
            symoff: SYMOFF,
            nsyms: 6,
            stroff: STROFF,
            strsize: STRSIZE,
            ..Default::default()
        };
        cmds.extend_from_slice(symtab.as_bytes());

        // LC_DYSYMTAB
        let dysymtab = DysymtabCommand {
            indirectsymoff: INDIRECT_OFF,
            nindirectsyms: 5,
            ..Default::default()
        };
        cmds.extend_from_slice(dysymtab.as_bytes());

        // LC_DYLD_INFO_ONLY
        let dyld_info = DyldInfoCommand {
            rebase_off: REBASE_OFF,
            rebase_size: REBASE_USED as u32,
            bind_off: BIND_OFF,
            bind_size: bind_stream.len() as u32,
            lazy_bind_off: LAZY_BIND_OFF,
            lazy_bind_size: lazy_stream.len() as u32,
            ..Default::default()
        };
        cmds.extend_from_slice(dyld_info.as_bytes());

        // LC_UUID
        let uuid = UuidCommand {
            uuid: [0x42; 16],
            ..Default::default()
        };
        cmds.extend_from_slice(uuid.as_bytes());

        // LC_INCREMENTAL, padded to keep the command array 8-aligned
        let mut incr = incr_cmd;
        incr.cmdsize = crate::util::align_up(IncrementalCommand::SIZE as u64, 8) as u32;
        cmds.extend_from_slice(incr.as_bytes());
        cmds.resize(cmds.len() + incr.cmdsize as usize - IncrementalCommand::SIZE, 0);

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: MH_EXECUTE,
            ncmds: 12,
            sizeofcmds: cmds.len() as u32,
            flags: (MachOFlags::NOUNDEFS
                | MachOFlags::DYLDLINK
                | MachOFlags::TWOLEVEL
                | MachOFlags::PIE)
                .bits(),
            reserved: 0,
        };
        bytes[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        bytes[MachHeader64::SIZE..MachHeader64::SIZE + cmds.len()].copy_from_slice(&cmds);

        // -- section contents --
        for b in &mut bytes[TEXT_OFFSET as usize..(TEXT_OFFSET + TEXT_PATCH_OFFSET) as usize] {
            *b = 0xAA;
        }
        // class list slot 0 -> class record
        put_u64(&mut bytes, 0x4100, OBJC_DATA_ADDR);
        // class record data field -> read-only content
        put_u64(&mut bytes, 0x5100 + 32, OBJC_CONST_ADDR);
        // read-only content name field -> class name
        put_u64(&mut bytes, 0x4200 + 24, CLASSNAME_ADDR);
        bytes[0x3000..0x3004].copy_from_slice(b"Foo\0");
        // class refs slot 0 -> class record (named by _OBJC_CLASS_$_Foo)
        put_u64(&mut bytes, 0x5200, OBJC_DATA_ADDR);

        // -- symbol table --
        let symbols = [
            sym(2, N_SECT | N_EXT, 1, 0, TEXT_ADDR),                       // _main
            sym(8, N_SECT | N_EXT, 5, 0, OBJC_DATA_ADDR),                  // _OBJC_CLASS_$_Foo
            sym(26, N_UNDF | N_EXT, 0, 1 << 8, 0),                         // _printf
            sym(34, N_UNDF | N_EXT, 0, 1 << 8, 0),                         // dyld_stub_binder
            sym(51, N_UNDF | N_EXT, 0, (1 << 8) | N_WEAK_REF, 0),          // _maybe
            sym(58, N_UNDF | N_EXT, 0, 1 << 8, 0),                         // _NSClassFromString
        ];
        let mut offset = SYMOFF as usize;
        for symbol in &symbols {
            bytes[offset..offset + Nlist64::SIZE].copy_from_slice(symbol.as_bytes());
            offset += Nlist64::SIZE;
        }

        // -- string pool: pad, names, reserved tail --
        let strings = b" \0_main\0_OBJC_CLASS_$_Foo\0_printf\0dyld_stub_binder\0_maybe\0_NSClassFromString\0";
        assert_eq!(strings.len() as u64, STRING_POOL_USED);
        bytes[STROFF as usize..STROFF as usize + strings.len()].copy_from_slice(strings);

        // -- indirect symbol table --
        // stubs: _printf, dyld_stub_binder; got: _maybe, local; lazy: _printf
        let indirect: [u32; 5] = [2, 3, 4, INDIRECT_SYMBOL_LOCAL, 2];
        let mut offset = INDIRECT_OFF as usize;
        for value in indirect {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            offset += 4;
        }

        // -- dyld info streams --
        let rebase = rebase_stream();
        assert_eq!(rebase.len() as u64, REBASE_USED);
        bytes[REBASE_OFF as usize..REBASE_OFF as usize + rebase.len()].copy_from_slice(&rebase);
        bytes[BIND_OFF as usize..BIND_OFF as usize + bind_stream.len()]
            .copy_from_slice(&bind_stream);
        bytes[LAZY_BIND_OFF as usize..LAZY_BIND_OFF as usize + lazy_stream.len()]
            .copy_from_slice(&lazy_stream);

        Self { bytes }
    }
}

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn sym(n_strx: u32, n_type: u8, n_sect: u8, n_desc: u16, n_value: u64) -> Nlist64 {
    Nlist64 {
        n_strx,
        n_type,
        n_sect,
        n_desc,
        n_value,
    }
}

fn segment(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64, nsects: u32) -> SegmentCommand64 {
    let mut seg = SegmentCommand64 {
        cmdsize: (SegmentCommand64::SIZE + nsects as usize * Section64::SIZE) as u32,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        nsects,
        ..Default::default()
    };
    seg.set_name(name);
    seg
}

fn section(
    name: &str,
    segment: &str,
    addr: u64,
    size: u64,
    offset: u32,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
) -> Section64 {
    let mut sect = Section64 {
        addr,
        size,
        offset,
        flags,
        reserved1,
        reserved2,
        ..Default::default()
    };
    sect.set_name(name);
    let mut seg_name = [0u8; 16];
    let bytes = segment.as_bytes();
    seg_name[..bytes.len()].copy_from_slice(bytes);
    sect.segname = seg_name;
    sect
}

fn text_segment() -> SegmentCommand64 {
    segment("__TEXT", BASE, 0x4000, 0, 0x4000, 3)
}

fn text_section() -> Section64 {
    section(
        "__text",
        "__TEXT",
        TEXT_ADDR,
        TEXT_SIZE,
        TEXT_OFFSET as u32,
        S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
        0,
        0,
    )
}

fn stubs_section() -> Section64 {
    section("__stubs", "__TEXT", STUBS_ADDR, 24, 0x2000, S_SYMBOL_STUBS, 0, 12)
}

fn classname_section() -> Section64 {
    section("__objc_classname", "__TEXT", CLASSNAME_ADDR, 0x20, 0x3000, S_REGULAR, 0, 0)
}

fn data_const_segment() -> SegmentCommand64 {
    segment("__DATA_CONST", BASE + 0x4000, 0x1000, 0x4000, 0x1000, 3)
}

fn got_section() -> Section64 {
    section("__got", "__DATA_CONST", GOT_ADDR, 16, 0x4000, S_NON_LAZY_SYMBOL_POINTERS, 2, 0)
}

fn classlist_section() -> Section64 {
    section("__objc_classlist", "__DATA_CONST", CLASSLIST_ADDR, 8, 0x4100, S_REGULAR, 0, 0)
}

fn objc_const_section() -> Section64 {
    section("__objc_const", "__DATA_CONST", OBJC_CONST_ADDR, 0x100, 0x4200, S_REGULAR, 0, 0)
}

fn data_segment() -> SegmentCommand64 {
    segment("__DATA", BASE + 0x5000, 0x1000, 0x5000, 0x1000, 3)
}

fn la_ptr_section() -> Section64 {
    section("__la_symbol_ptr", "__DATA", LA_PTR_ADDR, 8, 0x5000, S_LAZY_SYMBOL_POINTERS, 4, 0)
}

fn objc_data_section() -> Section64 {
    section("__objc_data", "__DATA", OBJC_DATA_ADDR, 0x50, 0x5100, S_REGULAR, 0, 0)
}

fn classrefs_section() -> Section64 {
    section("__objc_classrefs", "__DATA", CLASSREFS_ADDR, 8, 0x5200, S_REGULAR, 0, 0)
}

fn linkedit_segment() -> SegmentCommand64 {
    segment("__LINKEDIT", BASE + 0x6000, 0x2000, 0x6000, 0x2000, 0)
}

fn rebase_stream() -> Vec<u8> {
    vec![
        REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
        // __objc_classlist slot in __DATA_CONST (segment 1, offset 0x100)
        REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
        0x80,
        0x02,
        REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
        // class record in __DATA (segment 2, offset 0x100)
        REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2,
        0x80,
        0x02,
        REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1,
        REBASE_OPCODE_DONE,
    ]
}

fn bind_stream() -> Vec<u8> {
    let mut stream = vec![
        BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
        BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | BIND_SYMBOL_FLAGS_WEAK_IMPORT,
    ];
    stream.extend_from_slice(b"_maybe\0");
    stream.extend_from_slice(&[
        BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER,
        // __got slot 0 in __DATA_CONST (segment 1, offset 0)
        BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
        0x00,
        BIND_OPCODE_DO_BIND,
        BIND_OPCODE_DONE,
    ]);
    stream
}

fn lazy_bind_stream() -> Vec<u8> {
    let mut stream = vec![
        // __la_symbol_ptr slot 0 in __DATA (segment 2, offset 0)
        BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2,
        0x00,
        BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1,
        BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
    ];
    stream.extend_from_slice(b"_printf\0");
    stream.push(BIND_OPCODE_DO_BIND);
    stream.push(BIND_OPCODE_DONE);
    stream
}

fn default_sidecar() -> Sidecar {
    Sidecar {
        strings: vec!["a.o".into(), "b.o".into(), "_main".into(), "_helper".into()],
        inputs: vec![
            InputEntry {
                path_index: 0,
                mod_time: 100,
                kind: InputKind::Relocatable,
                atoms: vec![AtomEntry {
                    name_index: 2,
                    file_offset: TEXT_OFFSET,
                    size: 0x40,
                }],
            },
            InputEntry {
                path_index: 1,
                mod_time: 100,
                kind: InputKind::Relocatable,
                atoms: vec![AtomEntry {
                    name_index: 3,
                    file_offset: TEXT_OFFSET + 0x40,
                    size: 0x20,
                }],
            },
        ],
        fixups: vec![Fixup {
            address: TEXT_ADDR + 0x40,
            name_index: 3,
        }],
        global_symbols: vec![GlobalSymbol {
            name_index: 2,
            referenced_files: vec![0, 1],
        }],
        patch_space: vec![
            PatchSpace {
                sectname: "__text".into(),
                patch_offset: TEXT_PATCH_OFFSET,
                patch_space: TEXT_PATCH_SPACE,
            },
            PatchSpace {
                sectname: "__stubs".into(),
                patch_offset: 24,
                patch_space: 0,
            },
            PatchSpace {
                sectname: "__got".into(),
                patch_offset: 16,
                patch_space: 0,
            },
            PatchSpace {
                sectname: "__la_symbol_ptr".into(),
                patch_offset: 8,
                patch_space: 0,
            },
            PatchSpace {
                sectname: "__symbol_table".into(),
                patch_offset: 96,
                patch_space: 64,
            },
            PatchSpace {
                sectname: "__rebase".into(),
                patch_offset: REBASE_USED,
                patch_space: REBASE_RESERVED,
            },
            PatchSpace {
                sectname: "__binding".into(),
                patch_offset: 14,
                patch_space: 18,
            },
            PatchSpace {
                sectname: "__lazy_binding".into(),
                patch_offset: 14,
                patch_space: 18,
            },
            // stale copy; the live reservation is synthesized from the
            // Mach-O string table
            PatchSpace {
                sectname: "__string_pool".into(),
                patch_offset: 0,
                patch_space: 0,
            },
        ],
    }
}
