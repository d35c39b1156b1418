//! Sidecar table decoding.
//!
//! Each region is bounds-checked against both its declared size and the end
//! of the image before any record inside it is touched. Records are walked
//! with explicit cursors; the trailing variable-length arrays make struct
//! mapping impossible.

use crate::error::{Error, Result};
use crate::macho::IncrementalCommand;
use crate::util::{memchr_null, read_u32_le_at, read_u64_le_at};

use super::{
    AtomEntry, Fixup, GlobalSymbol, InputEntry, InputKind, PatchSpace, Sidecar,
    ATOM_ENTRY_SIZE, FIXUP_ENTRY_SIZE, INPUT_ENTRY_PREFIX_SIZE, PATCH_SPACE_ENTRY_SIZE,
};

/// Decodes all five sidecar tables.
///
/// Order matters: the string pool is decoded first because inputs and fixups
/// resolve names through it.
pub fn parse_sidecar(data: &[u8], cmd: &IncrementalCommand) -> Result<Sidecar> {
    let strings = parse_strings(data, cmd)?;
    let inputs = parse_inputs(data, cmd, &strings)?;
    let fixups = parse_fixups(data, cmd, &strings)?;
    let global_symbols = parse_global_symbols(data, cmd)?;
    let patch_space = parse_patch_space(data, cmd)?;
    Ok(Sidecar {
        strings,
        inputs,
        fixups,
        global_symbols,
        patch_space,
    })
}

fn region(data: &[u8], off: u32, size: u32, what: &str) -> Result<(usize, usize)> {
    let start = off as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or_else(|| Error::malformed(start, format!("{what} region overflows")))?;
    if end > data.len() {
        return Err(Error::malformed(
            start,
            format!("{what} region extends beyond the file"),
        ));
    }
    Ok((start, end))
}

/// Decodes the incremental string pool: NUL-terminated names concatenated,
/// terminated by an empty string or the end of the region. The cursor
/// advances past each terminator.
fn parse_strings(data: &[u8], cmd: &IncrementalCommand) -> Result<Vec<String>> {
    let (start, end) = region(data, cmd.strtab_off, cmd.strtab_size, "string pool")?;
    let mut strings = Vec::new();
    let mut p = start;
    while p < end {
        let len = memchr_null(&data[p..end]);
        if len == 0 {
            break;
        }
        strings.push(String::from_utf8_lossy(&data[p..p + len]).into_owned());
        p += len + 1;
    }
    Ok(strings)
}

/// Decodes the input-entry table. Relocatable entries carry a trailing atom
/// array; dylib, archive, and other entries are just the fixed prefix.
fn parse_inputs(
    data: &[u8],
    cmd: &IncrementalCommand,
    strings: &[String],
) -> Result<Vec<InputEntry>> {
    let (start, end) = region(data, cmd.inputs_off, cmd.inputs_size, "input table")?;
    let mut inputs = Vec::with_capacity(cmd.file_count as usize);
    let mut p = start;
    for index in 0..cmd.file_count {
        if end - p < INPUT_ENTRY_PREFIX_SIZE {
            return Err(Error::malformed(
                p,
                format!("input entry #{index} truncated"),
            ));
        }
        let path_index = read_u32_le_at(data, p);
        let mod_time = read_u64_le_at(data, p + 4);
        let raw_kind = read_u32_le_at(data, p + 12);
        p += INPUT_ENTRY_PREFIX_SIZE;

        if path_index as usize >= strings.len() {
            return Err(Error::malformed(
                p,
                format!("input entry #{index} path index {path_index} out of range"),
            ));
        }
        let kind = InputKind::from_u32(raw_kind).ok_or_else(|| {
            Error::malformed(p, format!("input entry #{index} has bad kind {raw_kind}"))
        })?;

        let mut atoms = Vec::new();
        if kind == InputKind::Relocatable {
            if end - p < 4 {
                return Err(Error::malformed(
                    p,
                    format!("input entry #{index} missing atom count"),
                ));
            }
            let atom_count = read_u32_le_at(data, p) as usize;
            p += 4;
            if (end - p) / ATOM_ENTRY_SIZE < atom_count {
                return Err(Error::malformed(
                    p,
                    format!("input entry #{index} atom list truncated"),
                ));
            }
            atoms.reserve(atom_count);
            for _ in 0..atom_count {
                atoms.push(AtomEntry {
                    name_index: read_u32_le_at(data, p),
                    file_offset: read_u64_le_at(data, p + 4),
                    size: read_u32_le_at(data, p + 12),
                });
                p += ATOM_ENTRY_SIZE;
            }
        }

        inputs.push(InputEntry {
            path_index,
            mod_time,
            kind,
            atoms,
        });
    }
    Ok(inputs)
}

/// Decodes the fixup table: a u32 count followed by packed
/// `{address, name_index}` records.
fn parse_fixups(
    data: &[u8],
    cmd: &IncrementalCommand,
    strings: &[String],
) -> Result<Vec<Fixup>> {
    let (start, end) = region(data, cmd.fixups_off, cmd.fixups_size, "fixup table")?;
    if start == end {
        return Ok(Vec::new());
    }
    if end - start < 4 {
        return Err(Error::malformed(start, "fixup table smaller than its count"));
    }
    let count = read_u32_le_at(data, start) as usize;
    let mut p = start + 4;
    if (end - p) / FIXUP_ENTRY_SIZE < count {
        return Err(Error::malformed(p, "fixup table truncated"));
    }
    let mut fixups = Vec::with_capacity(count);
    for _ in 0..count {
        let address = read_u64_le_at(data, p);
        let name_index = read_u32_le_at(data, p + 8);
        if name_index as usize >= strings.len() {
            return Err(Error::malformed(
                p,
                format!("fixup name index {name_index} out of range"),
            ));
        }
        fixups.push(Fixup {
            address,
            name_index,
        });
        p += FIXUP_ENTRY_SIZE;
    }
    Ok(fixups)
}

/// Decodes the global-symbol table.
///
/// A conforming producer writes complete records or none, so a trailing
/// fragment that cannot hold one is a malformed image rather than a
/// terminator.
fn parse_global_symbols(data: &[u8], cmd: &IncrementalCommand) -> Result<Vec<GlobalSymbol>> {
    let (start, end) = region(data, cmd.symtab_off, cmd.symtab_size, "global symbols")?;
    let mut symbols = Vec::new();
    let mut p = start;
    while p < end {
        if end - p < 8 {
            return Err(Error::malformed(p, "truncated global-symbol record"));
        }
        let name_index = read_u32_le_at(data, p);
        let referenced_count = read_u32_le_at(data, p + 4) as usize;
        p += 8;
        if (end - p) / 4 < referenced_count {
            return Err(Error::malformed(p, "global-symbol file list truncated"));
        }
        let mut referenced_files = Vec::with_capacity(referenced_count);
        for _ in 0..referenced_count {
            referenced_files.push(read_u32_le_at(data, p));
            p += 4;
        }
        symbols.push(GlobalSymbol {
            name_index,
            referenced_files,
        });
    }
    Ok(symbols)
}

/// Decodes the patch-space table: fixed 29-byte records.
///
/// The record count is `size / 29`; a non-zero remainder means the producer
/// and this reader disagree about the layout, which is fatal.
fn parse_patch_space(data: &[u8], cmd: &IncrementalCommand) -> Result<Vec<PatchSpace>> {
    let (start, end) = region(data, cmd.patch_space_off, cmd.patch_space_size, "patch space")?;
    let size = end - start;
    if size % PATCH_SPACE_ENTRY_SIZE != 0 {
        return Err(Error::malformed(
            start,
            format!("patch-space table size {size} is not a whole number of records"),
        ));
    }
    let count = size / PATCH_SPACE_ENTRY_SIZE;
    let mut entries = Vec::with_capacity(count);
    let mut p = start;
    for _ in 0..count {
        let raw_name = &data[p..p + 17];
        let len = memchr_null(raw_name).min(16);
        let sectname = String::from_utf8_lossy(&raw_name[..len]).into_owned();
        entries.push(PatchSpace {
            sectname,
            patch_offset: read_u64_le_at(data, p + 17),
            patch_space: read_u32_le_at(data, p + 25),
        });
        p += PATCH_SPACE_ENTRY_SIZE;
    }
    Ok(entries)
}
