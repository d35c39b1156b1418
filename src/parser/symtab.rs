//! Symbol table and string pool parsing.
//!
//! Besides validating that both tables live inside `__LINKEDIT`, this pass
//! builds the reverse maps the patcher relies on: name → pool offset,
//! type → name → record offset, type → first record offset, and
//! value → symbol index. The first empty string in the pool marks the
//! boundary between the used prefix and the reserved tail, which becomes
//! the synthesized `__string_pool` patch reservation.

use zerocopy::FromBytes;

use crate::error::{Error, Result};
use crate::image::Arch;
use crate::macho::*;
use crate::sidecar::PatchSpace;
use crate::util::memchr_null;

use super::{ParsedImage, SectionBoundary};

pub(crate) fn parse_symbol_table(
    data: &[u8],
    cmd: &SymtabCommand,
    linkedit: Option<&SegmentCommand64>,
    arch: Arch,
    image: &mut ParsedImage,
) -> Result<()> {
    let linkedit = linkedit.ok_or_else(|| {
        Error::malformed(0, "LC_SYMTAB appears before the __LINKEDIT segment")
    })?;
    let linkedit_end = linkedit.fileoff + linkedit.filesize;

    // String pool containment and alignment
    let stroff = cmd.stroff as u64;
    let strsize = cmd.strsize as u64;
    if stroff < linkedit.fileoff {
        return Err(Error::malformed(cmd.stroff as usize, "string pool not in __LINKEDIT"));
    }
    if stroff + strsize > linkedit_end || stroff + strsize > data.len() as u64 {
        return Err(Error::malformed(
            cmd.stroff as usize,
            "string pool extends beyond __LINKEDIT",
        ));
    }
    if stroff % 4 != 0 {
        return Err(Error::malformed(cmd.stroff as usize, "string pool start not aligned"));
    }

    // Scan the used prefix: NUL-terminated names until the first empty
    // string. The cursor advances past each terminator.
    let pool_start = stroff as usize;
    let pool_end = (stroff + strsize) as usize;
    let mut p = pool_start;
    while p < pool_end {
        let len = memchr_null(&data[p..pool_end]);
        if len == 0 {
            break;
        }
        let name = String::from_utf8_lossy(&data[p..p + len]).into_owned();
        image.string_pool.insert(name, (p - pool_start) as u32);
        p += len + 1;
    }
    let used = (p - pool_start) as u64;
    image.current_buffer_used = used as u32;
    image.patch_space.insert(
        "__string_pool".into(),
        PatchSpace {
            sectname: "__string_pool".into(),
            patch_offset: used,
            patch_space: (strsize - used) as u32,
        },
    );
    image.section_boundaries.insert(
        "__string_pool".into(),
        SectionBoundary {
            address: image.base_address + stroff,
            file_offset: stroff,
            size: strsize,
        },
    );

    // Symbol table containment, overlap, and alignment
    let nlist_size = Nlist64::SIZE as u64;
    let mut symbol_count = cmd.nsyms;
    if symbol_count != 0 {
        let symoff = cmd.symoff as u64;
        if symoff < linkedit.fileoff {
            return Err(Error::malformed(cmd.symoff as usize, "symbol table not in __LINKEDIT"));
        }
        if symoff + symbol_count as u64 * nlist_size > stroff {
            return Err(Error::malformed(
                cmd.symoff as usize,
                "symbol table overlaps string pool",
            ));
        }
        if symoff % arch.pointer_size() != 0 {
            return Err(Error::malformed(
                cmd.symoff as usize,
                "symbol table start not pointer aligned",
            ));
        }

        for index in 0..cmd.nsyms {
            let record_offset = cmd.symoff as usize + index as usize * Nlist64::SIZE;
            let sym = Nlist64::read_from_prefix(&data[record_offset..])
                .map_err(|_| Error::malformed(record_offset, "unreadable nlist record"))?
                .0;
            if sym.n_strx == 0 {
                // the live records end at the first unnamed slot; the rest
                // of the table is reserved
                symbol_count = index;
                break;
            }
            let name = symbol_name_at(data, cmd, sym.n_strx)?;

            if sym.is_import() {
                image.dylib_symbol_map.insert(name.clone(), sym);
            }
            image
                .sym_to_section_offset
                .entry(sym.n_type)
                .or_default()
                .insert(name, index as u64 * nlist_size);
            image
                .symbol_type_to_offset
                .entry(sym.n_type)
                .or_insert(index * Nlist64::SIZE as u32);
            if sym.n_value != 0 {
                image.symbol_address_to_index.insert(sym.n_value, index);
            }
        }
    }
    image.symbol_count = symbol_count;
    image.section_boundaries.insert(
        "__symbol_table".into(),
        SectionBoundary {
            address: image.base_address + cmd.symoff as u64,
            file_offset: cmd.symoff as u64,
            size: cmd.nsyms as u64 * nlist_size,
        },
    );
    image.symtab = Some(*cmd);
    Ok(())
}

/// Fetches the symbol record at `index`.
pub(crate) fn symbol_at(
    data: &[u8],
    cmd: &SymtabCommand,
    index: u32,
    symbol_count: u32,
) -> Result<Nlist64> {
    if index >= symbol_count {
        return Err(Error::malformed(
            cmd.symoff as usize,
            format!("symbol index {index} out of range"),
        ));
    }
    let offset = cmd.symoff as usize + index as usize * Nlist64::SIZE;
    Ok(Nlist64::read_from_prefix(&data[offset..])
        .map_err(|_| Error::malformed(offset, "unreadable nlist record"))?
        .0)
}

/// Resolves a symbol's name through the Mach-O string pool.
pub(crate) fn symbol_name_at(data: &[u8], cmd: &SymtabCommand, n_strx: u32) -> Result<String> {
    if n_strx >= cmd.strsize {
        return Err(Error::malformed(
            cmd.stroff as usize,
            "malformed nlist string offset",
        ));
    }
    let start = cmd.stroff as usize + n_strx as usize;
    let end = cmd.stroff as usize + cmd.strsize as usize;
    let len = memchr_null(&data[start..end]);
    Ok(String::from_utf8_lossy(&data[start..start + len]).into_owned())
}
