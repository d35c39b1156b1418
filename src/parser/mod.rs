//! Reconstruction of the previous link's model from a produced binary.
//!
//! A single forward pass over the load commands populates segments, the
//! symbol table, the dyld-info command, and the incremental sidecar; the
//! dyld-info opcode streams are interpreted afterwards (they stop at
//! boundaries the sidecar's patch-space table defines), then the indirect
//! symbol table is walked to resurrect stub atoms, and finally the ObjC
//! class-ref slots are matched back to symbol names.

mod dyld_info;
mod indirect;
mod objc;
mod symtab;

pub use dyld_info::{encode_binding_info, encode_rebase_info};
pub(crate) use dyld_info::DyldInfoContext;

use std::collections::{HashMap, HashSet};

use tracing::debug;
use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::image::{validate_header, Arch};
use crate::macho::*;
use crate::sidecar::{parse_sidecar, Fixup, PatchSpace, Sidecar};

// =============================================================================
// Model Types
// =============================================================================

/// A segment's virtual-memory extent, in load-command order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBoundary {
    /// Segment start address
    pub start: u64,
    /// Segment size in bytes
    pub size: u64,
}

/// Where a section (or pseudo-section such as `__rebase`) lives.
///
/// The canonical way the patcher locates a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBoundary {
    /// Virtual address
    pub address: u64,
    /// File offset
    pub file_offset: u64,
    /// Size in bytes
    pub size: u64,
}

/// A dylib the previous link bound against, synthesized from its load
/// command so the resolver can treat reconstructed imports uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibFile {
    /// Install name from the load command
    pub install_name: String,
    /// One-based position among the dylib load commands
    pub ordinal: u32,
    /// Current version
    pub current_version: u32,
    /// Compatibility version
    pub compatibility_version: u32,
}

impl DylibFile {
    /// The leaf of the install name.
    pub fn leaf_name(&self) -> &str {
        self.install_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.install_name)
    }

    /// The leaf with any extension chain removed ("libSystem.B.dylib" →
    /// "libSystem").
    pub fn short_name(&self) -> &str {
        let leaf = self.leaf_name();
        leaf.split('.').next().unwrap_or(leaf)
    }
}

/// A stand-in for one symbol imported from a dylib, reconstructed from the
/// indirect symbol table. Contributes no bytes; participates in resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubAtom {
    /// Imported symbol name
    pub name: String,
    /// Dylib ordinal the import binds to
    pub ordinal: u32,
    /// Address of the slot in the image
    pub address: u64,
    /// Weak-import flag from the symbol's desc
    pub weak_import: bool,
    /// Compatibility version of the providing dylib
    pub compat_version: u32,
}

/// A pointer-sized placeholder for one `__objc_classrefs` slot whose class
/// could be named through the symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjCClassRefAtom {
    /// Class symbol name
    pub name: String,
    /// Offset of the slot within `__objc_classrefs`
    pub section_offset: u64,
}

/// One rebase the dynamic loader will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RebaseEntry {
    /// Rebase type (pointer, text absolute, ...)
    pub kind: u8,
    /// Target address
    pub address: u64,
}

/// One binding the dynamic loader will perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingEntry {
    /// Bind type
    pub kind: u8,
    /// Library ordinal; special ordinals are small negatives
    pub ordinal: i64,
    /// Target symbol name
    pub symbol: String,
    /// Weak-import flag
    pub weak_import: bool,
    /// Address of the bound slot
    pub address: u64,
    /// Addend applied to the resolved value
    pub addend: i64,
}

/// A dylib load command as found in the image.
#[derive(Debug, Clone)]
pub(crate) struct DylibRef {
    pub install_name: String,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// A section header together with where it lives in the file, so the
/// patcher can rewrite fields (reserved1) in place.
#[derive(Debug, Clone)]
pub(crate) struct SectionRecord {
    pub sect: Section64,
    pub header_offset: usize,
}

// =============================================================================
// Parsed Image
// =============================================================================

/// Everything reconstructed from the previous link, in one pass.
///
/// Views into the image are integer offsets; the buffer itself stays with
/// the facade.
#[derive(Debug)]
pub struct ParsedImage {
    /// Architecture the image was validated against
    pub arch: Arch,
    /// The Mach-O header
    pub header: MachHeader64,
    /// `__TEXT.vmaddr`
    pub base_address: u64,
    /// True when ASLR may slide the image
    pub slidable: bool,
    /// True when the image carries an LC_MAIN command
    pub has_entry_point: bool,

    /// Symbol table command, when present
    pub symtab: Option<SymtabCommand>,
    /// Dynamic symbol table command, when present
    pub dysymtab: Option<DysymtabCommand>,
    /// Dyld info command, when present
    pub dyld_info: Option<DyldInfoCommand>,
    pub(crate) dyld_info_cmd_offset: Option<usize>,
    pub(crate) uuid_payload_offset: Option<usize>,

    pub(crate) segments: Vec<SegmentCommand64>,
    /// Segment extents in load-command order (index = dyld segment index)
    pub segment_boundaries: Vec<SegmentBoundary>,
    pub(crate) sections: Vec<SectionRecord>,
    pub(crate) section_header_offsets: HashMap<String, usize>,
    /// Section and pseudo-section extents by name
    pub section_boundaries: HashMap<String, SectionBoundary>,
    pub(crate) dylib_commands: Vec<DylibRef>,

    /// Mach-O string-pool contents: name → offset within the pool
    pub string_pool: HashMap<String, u32>,
    /// Used prefix of the string pool in bytes
    pub current_buffer_used: u32,
    /// Number of live symbol records
    pub symbol_count: u32,
    pub(crate) dylib_symbol_map: HashMap<String, Nlist64>,
    /// type byte → symbol name → record offset within the symbol table
    pub sym_to_section_offset: HashMap<u8, HashMap<String, u64>>,
    /// type byte → offset of the first record of that type
    pub symbol_type_to_offset: HashMap<u8, u32>,
    pub(crate) symbol_address_to_index: HashMap<u64, u32>,

    /// The decoded sidecar tables
    pub sidecar: Sidecar,
    /// Input path → index into `sidecar.inputs`
    pub inputs_by_path: HashMap<String, usize>,
    /// Symbol name → recorded fixups
    pub fixups_by_name: HashMap<String, Vec<Fixup>>,
    /// Patch reservations by section name, including the synthesized
    /// `__string_pool` entry
    pub patch_space: HashMap<String, PatchSpace>,

    /// Rebases recorded by the previous link
    pub rebase_info: Vec<RebaseEntry>,
    /// Rebase target addresses for membership checks
    pub rebase_addresses: HashSet<u64>,
    /// Non-lazy bindings
    pub binding_info: Vec<BindingEntry>,
    /// Weak bindings
    pub weak_binding_info: Vec<BindingEntry>,
    /// Lazy bindings
    pub lazy_binding_info: Vec<BindingEntry>,

    /// Reconstructed stub atoms
    pub stub_atoms: Vec<StubAtom>,
    /// Names with a reconstructed stub
    pub stub_names: HashSet<String>,
    /// Synthesized dylib stand-ins, one per referenced dylib
    pub dylib_files: Vec<DylibFile>,
    /// Install name → ordinal
    pub dylib_to_ordinal: HashMap<String, u32>,
    /// Short dylib name → ordinal
    pub dylib_name_to_ordinal: HashMap<String, u32>,

    /// ObjC class name → slot offset within `__objc_classlist`
    pub objc_class_index_map: HashMap<String, u32>,
    /// Reconstructed class-ref proxies
    pub objc_class_ref_atoms: Vec<ObjCClassRefAtom>,
}

impl ParsedImage {
    fn new(arch: Arch, header: MachHeader64) -> Self {
        Self {
            arch,
            header,
            base_address: 0,
            slidable: false,
            has_entry_point: false,
            symtab: None,
            dysymtab: None,
            dyld_info: None,
            dyld_info_cmd_offset: None,
            uuid_payload_offset: None,
            segments: Vec::new(),
            segment_boundaries: Vec::new(),
            sections: Vec::new(),
            section_header_offsets: HashMap::new(),
            section_boundaries: HashMap::new(),
            dylib_commands: Vec::new(),
            string_pool: HashMap::new(),
            current_buffer_used: 0,
            symbol_count: 0,
            dylib_symbol_map: HashMap::new(),
            sym_to_section_offset: HashMap::new(),
            symbol_type_to_offset: HashMap::new(),
            symbol_address_to_index: HashMap::new(),
            sidecar: Sidecar::default(),
            inputs_by_path: HashMap::new(),
            fixups_by_name: HashMap::new(),
            patch_space: HashMap::new(),
            rebase_info: Vec::new(),
            rebase_addresses: HashSet::new(),
            binding_info: Vec::new(),
            weak_binding_info: Vec::new(),
            lazy_binding_info: Vec::new(),
            stub_atoms: Vec::new(),
            stub_names: HashSet::new(),
            dylib_files: Vec::new(),
            dylib_to_ordinal: HashMap::new(),
            dylib_name_to_ordinal: HashMap::new(),
            objc_class_index_map: HashMap::new(),
            objc_class_ref_atoms: Vec::new(),
        }
    }

    /// True when the sidecar recorded at least one input, i.e. the image can
    /// seed an incremental update at all.
    pub fn can_incremental_update(&self) -> bool {
        !self.sidecar.inputs.is_empty()
    }
}

// =============================================================================
// Walker
// =============================================================================

/// Parses a produced binary into the previous link's model.
pub fn parse_image(data: &[u8], arch: Arch) -> Result<ParsedImage> {
    let header = validate_header(data, arch)?;
    let mut walker = Walker {
        data,
        arch,
        image: ParsedImage::new(arch, header),
        linkedit: None,
        incremental_cmd: None,
        objc_classrefs_section: None,
        objc_data_section: None,
        objc_class_addresses: Vec::new(),
        objc_class_section_offsets: HashMap::new(),
    };
    walker.walk()?;
    walker.merge_patch_space()?;
    walker.parse_dyld_info()?;
    indirect::parse_indirect_symbol_table(
        walker.data,
        walker.arch,
        walker.linkedit.as_ref(),
        &mut walker.image,
    )?;
    walker.parse_objc()?;
    Ok(walker.image)
}

struct Walker<'a> {
    data: &'a [u8],
    arch: Arch,
    image: ParsedImage,
    linkedit: Option<SegmentCommand64>,
    incremental_cmd: Option<IncrementalCommand>,
    objc_classrefs_section: Option<Section64>,
    objc_data_section: Option<Section64>,
    objc_class_addresses: Vec<u64>,
    objc_class_section_offsets: HashMap<u64, u32>,
}

impl<'a> Walker<'a> {
    /// Scans for LC_LOAD_DYLINKER to decide whether an executable is
    /// static, and enforces the flag rule for static executables.
    fn check_static_executable(&self) -> Result<bool> {
        if self.image.header.filetype != MH_EXECUTE {
            return Ok(false);
        }
        let mut offset = MachHeader64::SIZE;
        let end = MachHeader64::SIZE + self.image.header.sizeofcmds as usize;
        let mut is_static = true;
        for _ in 0..self.image.header.ncmds {
            if offset + LoadCommand::SIZE > end {
                break;
            }
            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::malformed(offset, "unreadable load command"))?
                .0;
            if lc.cmd == LC_LOAD_DYLINKER {
                is_static = false;
            }
            if lc.cmdsize == 0 {
                break;
            }
            offset += lc.cmdsize as usize;
        }
        if is_static {
            let flags = self.image.header.flags;
            let allowed = MachOFlags::NOUNDEFS.bits();
            let allowed_pie = allowed | MachOFlags::PIE.bits();
            if flags != allowed && flags != allowed_pie {
                return Err(Error::unsupported(
                    "invalid bits in mach_header flags for static executable",
                ));
            }
        }
        Ok(is_static)
    }

    fn walk(&mut self) -> Result<()> {
        let header = self.image.header;
        self.image.slidable = match header.filetype {
            MH_EXECUTE => header.flag_bits().contains(MachOFlags::PIE),
            _ => true,
        };
        let is_static = self.check_static_executable()?;

        let end_of_commands = MachHeader64::SIZE + header.sizeofcmds as usize;
        let end_of_file = self.data.len();
        let mask = self.arch.load_command_size_mask();

        let mut offset = MachHeader64::SIZE;
        for index in 0..header.ncmds {
            if offset + LoadCommand::SIZE > end_of_commands {
                return Err(Error::malformed(
                    offset,
                    format!("load command #{index} extends beyond the load commands"),
                ));
            }
            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::malformed(offset, "unreadable load command"))?
                .0;
            if (lc.cmdsize as usize) < LoadCommand::SIZE || (lc.cmdsize & mask) != 0 {
                return Err(Error::malformed(
                    offset,
                    format!("load command #{index} has an unaligned size"),
                ));
            }
            let end_of_cmd = offset + lc.cmdsize as usize;
            if end_of_cmd > end_of_commands {
                return Err(Error::malformed(
                    offset,
                    format!("load command #{index} extends beyond the load commands"),
                ));
            }
            if end_of_cmd > end_of_file {
                return Err(Error::malformed(
                    offset,
                    format!("load command #{index} extends beyond the file"),
                ));
            }

            match lc.cmd {
                LC_SEGMENT_64 => self.handle_segment(offset, lc.cmdsize as usize)?,
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    let cmd = DyldInfoCommand::read_from_prefix(&self.data[offset..])
                        .map_err(|_| Error::malformed(offset, "unreadable dyld info command"))?
                        .0;
                    self.image.dyld_info = Some(cmd);
                    self.image.dyld_info_cmd_offset = Some(offset);
                }
                LC_MAIN => {
                    if header.filetype != MH_EXECUTE {
                        return Err(Error::malformed(
                            offset,
                            "LC_MAIN can only be used in MH_EXECUTE file types",
                        ));
                    }
                    self.image.has_entry_point = true;
                }
                LC_SYMTAB => {
                    let cmd = SymtabCommand::read_from_prefix(&self.data[offset..])
                        .map_err(|_| Error::malformed(offset, "unreadable symtab command"))?
                        .0;
                    symtab::parse_symbol_table(
                        self.data,
                        &cmd,
                        self.linkedit.as_ref(),
                        self.arch,
                        &mut self.image,
                    )?;
                }
                LC_DYSYMTAB => {
                    if is_static && !self.image.slidable {
                        return Err(Error::malformed(
                            offset,
                            "LC_DYSYMTAB should not be used in a static executable",
                        ));
                    }
                    let cmd = DysymtabCommand::read_from_prefix(&self.data[offset..])
                        .map_err(|_| Error::malformed(offset, "unreadable dysymtab command"))?
                        .0;
                    self.image.dysymtab = Some(cmd);
                }
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB
                | LC_LOAD_UPWARD_DYLIB | LC_LAZY_LOAD_DYLIB => {
                    self.handle_dylib(offset, lc.cmdsize as usize)?;
                }
                LC_UUID => {
                    self.image.uuid_payload_offset = Some(offset + LoadCommand::SIZE);
                }
                LC_INCREMENTAL => {
                    if (lc.cmdsize as usize) < IncrementalCommand::SIZE {
                        return Err(Error::malformed(offset, "short LC_INCREMENTAL command"));
                    }
                    let cmd = IncrementalCommand::read_from_prefix(&self.data[offset..])
                        .map_err(|_| Error::malformed(offset, "unreadable incremental command"))?
                        .0;
                    self.image.sidecar = parse_sidecar(self.data, &cmd)?;
                    self.incremental_cmd = Some(cmd);
                }
                _ => {}
            }

            offset = end_of_cmd;
        }

        if self.incremental_cmd.is_none() {
            return Err(Error::SidecarMissing);
        }
        self.image.inputs_by_path = self.image.sidecar.inputs_by_path()?;
        self.image.fixups_by_name = self.image.sidecar.fixups_by_name()?;
        Ok(())
    }

    fn handle_segment(&mut self, offset: usize, cmdsize: usize) -> Result<()> {
        let seg = SegmentCommand64::read_from_prefix(&self.data[offset..])
            .map_err(|_| Error::malformed(offset, "unreadable segment command"))?
            .0;
        if SegmentCommand64::SIZE + seg.nsects as usize * Section64::SIZE > cmdsize {
            return Err(Error::malformed(offset, "segment sections exceed command size"));
        }

        self.image.segment_boundaries.push(SegmentBoundary {
            start: seg.vmaddr,
            size: seg.vmsize,
        });

        let seg_name = seg.name().to_owned();
        let mut sect_offset = offset + SegmentCommand64::SIZE;
        for _ in 0..seg.nsects {
            let sect = Section64::read_from_prefix(&self.data[sect_offset..])
                .map_err(|_| Error::malformed(sect_offset, "unreadable section header"))?
                .0;
            let name = sect.name().to_owned();
            self.image.section_boundaries.insert(
                name.clone(),
                SectionBoundary {
                    address: sect.addr,
                    file_offset: sect.offset as u64,
                    size: sect.size,
                },
            );
            self.image
                .section_header_offsets
                .insert(name.clone(), sect_offset);

            match (seg_name.as_str(), name.as_str()) {
                // __objc_classname only noted; names resolve through
                // __objc_data
                ("__DATA_CONST", "__objc_classlist") => {
                    objc::parse_class_list(
                        self.data,
                        &sect,
                        self.arch,
                        &mut self.objc_class_addresses,
                        &mut self.objc_class_section_offsets,
                    )?;
                }
                ("__DATA", "__objc_classrefs") => {
                    self.objc_classrefs_section = Some(sect);
                }
                ("__DATA", "__objc_data") => {
                    self.objc_data_section = Some(sect);
                }
                _ => {}
            }

            self.image.sections.push(SectionRecord {
                sect,
                header_offset: sect_offset,
            });
            sect_offset += Section64::SIZE;
        }

        match seg_name.as_str() {
            "__TEXT" => self.image.base_address = seg.vmaddr,
            "__LINKEDIT" => self.linkedit = Some(seg),
            _ => {}
        }
        self.image.segments.push(seg);
        Ok(())
    }

    fn handle_dylib(&mut self, offset: usize, cmdsize: usize) -> Result<()> {
        let cmd = DylibCommand::read_from_prefix(&self.data[offset..])
            .map_err(|_| Error::malformed(offset, "unreadable dylib command"))?
            .0;
        let name_offset = cmd.dylib.name_offset as usize;
        if name_offset >= cmdsize {
            return Err(Error::malformed(offset, "dylib name offset out of range"));
        }
        let raw = &self.data[offset + name_offset..offset + cmdsize];
        let len = crate::util::memchr_null(raw);
        let install_name = String::from_utf8_lossy(&raw[..len]).into_owned();
        debug!(ordinal = self.image.dylib_commands.len() + 1, name = %install_name, "dylib");
        self.image.dylib_commands.push(DylibRef {
            install_name,
            current_version: cmd.dylib.current_version,
            compatibility_version: cmd.dylib.compatibility_version,
        });
        Ok(())
    }

    /// Folds the sidecar's patch-space table into the by-name map. The
    /// `__string_pool` reservation is synthesized from the Mach-O string
    /// table itself, so a stale copy in the sidecar is skipped.
    fn merge_patch_space(&mut self) -> Result<()> {
        let entries = self.image.sidecar.patch_space.clone();
        for entry in entries {
            if entry.sectname == "__string_pool" {
                continue;
            }
            if let Some(boundary) = self.image.section_boundaries.get(&entry.sectname) {
                // dyld-info pseudo-regions are recorded later; this check
                // covers real sections only
                if self.image.section_header_offsets.contains_key(&entry.sectname)
                    && (entry.patch_offset > boundary.size
                        || entry.patch_offset + entry.patch_space as u64 > boundary.size)
                {
                    return Err(Error::malformed(
                        boundary.file_offset as usize,
                        format!(
                            "patch space for '{}' exceeds the section",
                            entry.sectname
                        ),
                    ));
                }
            }
            self.image.patch_space.insert(entry.sectname.clone(), entry);
        }
        Ok(())
    }

    fn parse_dyld_info(&mut self) -> Result<()> {
        let Some(cmd) = self.image.dyld_info else {
            return Ok(());
        };
        let ctx = DyldInfoContext {
            data: self.data,
            segments: &self.image.segments,
            pointer_size: self.arch.pointer_size(),
            base_address: self.image.base_address,
        };

        if cmd.rebase_off != 0 && cmd.rebase_size != 0 {
            // prior rebases occupy only the used prefix; the tail is
            // reserved patch space
            let used = self
                .image
                .patch_space
                .get("__rebase")
                .map(|p| p.patch_offset)
                .unwrap_or(cmd.rebase_size as u64);
            let stop = cmd.rebase_off as u64 + used.min(cmd.rebase_size as u64);
            let (rebases, addresses) =
                ctx.parse_rebase(cmd.rebase_off as usize, stop as usize)?;
            self.image.rebase_info = rebases;
            self.image.rebase_addresses = addresses;
            self.image.section_boundaries.insert(
                "__rebase".into(),
                SectionBoundary {
                    address: self.image.base_address + cmd.rebase_off as u64,
                    file_offset: cmd.rebase_off as u64,
                    size: cmd.rebase_size as u64,
                },
            );
        }
        if cmd.bind_off != 0 && cmd.bind_size != 0 {
            self.image.binding_info =
                ctx.parse_bindings(cmd.bind_off as usize, cmd.bind_size as usize, false)?;
            self.image.section_boundaries.insert(
                "__binding".into(),
                SectionBoundary {
                    address: self.image.base_address + cmd.bind_off as u64,
                    file_offset: cmd.bind_off as u64,
                    size: cmd.bind_size as u64,
                },
            );
        }
        if cmd.weak_bind_off != 0 && cmd.weak_bind_size != 0 {
            self.image.weak_binding_info =
                ctx.parse_bindings(cmd.weak_bind_off as usize, cmd.weak_bind_size as usize, false)?;
        }
        if cmd.lazy_bind_off != 0 && cmd.lazy_bind_size != 0 {
            self.image.lazy_binding_info =
                ctx.parse_bindings(cmd.lazy_bind_off as usize, cmd.lazy_bind_size as usize, true)?;
            self.image.section_boundaries.insert(
                "__lazy_binding".into(),
                SectionBoundary {
                    address: self.image.base_address + cmd.lazy_bind_off as u64,
                    file_offset: cmd.lazy_bind_off as u64,
                    size: cmd.lazy_bind_size as u64,
                },
            );
        }
        Ok(())
    }

    fn parse_objc(&mut self) -> Result<()> {
        if let Some(sect) = self.objc_data_section {
            self.image.objc_class_index_map = objc::parse_objc_data(
                self.data,
                &sect,
                self.arch,
                self.image.base_address,
                &self.objc_class_addresses,
                &self.objc_class_section_offsets,
            )?;
        }
        if let Some(sect) = self.objc_classrefs_section {
            self.image.objc_class_ref_atoms = objc::parse_class_refs(
                self.data,
                &sect,
                self.arch,
                &self.image.symbol_address_to_index,
                self.image.symtab.as_ref(),
                self.image.symbol_count,
            )?;
        }
        Ok(())
    }
}
