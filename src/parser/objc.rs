//! ObjC metadata reconstruction.
//!
//! The class list in `__DATA_CONST` points at class metadata in `__objc_data`,
//! whose read-only content in `__objc_const` carries the class-name pointer
//! into `__objc_classname`. Chasing that chain produces the
//! class-name → classlist-slot map the patcher needs to keep class-list
//! entries in their original slots when a new class is added. Class-ref
//! slots in `__objc_classrefs` are matched back to symbol names through the
//! value → symbol-index map.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::image::Arch;
use crate::macho::{Section64, SymtabCommand};
use crate::util::{read_cstr, read_u64_le_at};

use super::symtab::{symbol_at, symbol_name_at};
use super::ObjCClassRefAtom;

// The runtime's class record layouts are fixed; only the field offsets are
// needed, parameterized on pointer width in this one place.

/// Offset of `data` in the class record: isa, superclass, method cache,
/// vtable precede it.
#[inline]
pub(crate) fn class_data_offset(pointer_size: u64) -> u64 {
    4 * pointer_size
}

/// Offset of `name` in the read-only content: flags (u32), instanceStart
/// (u32), instanceSize (pointer-padded), ivarLayout precede it.
#[inline]
pub(crate) fn ro_name_offset(pointer_size: u64) -> u64 {
    8 + 2 * pointer_size
}

fn read_pointer(data: &[u8], offset: u64) -> Result<u64> {
    let offset = offset as usize;
    if offset + 8 > data.len() {
        return Err(Error::malformed(offset, "objc pointer out of bounds"));
    }
    Ok(read_u64_le_at(data, offset))
}

/// Records the class metadata addresses from `__objc_classlist`, in slot
/// order and indexed by address.
pub(crate) fn parse_class_list(
    data: &[u8],
    sect: &Section64,
    arch: Arch,
    addresses: &mut Vec<u64>,
    section_offsets: &mut HashMap<u64, u32>,
) -> Result<()> {
    let pointer_size = arch.pointer_size();
    let count = sect.size / pointer_size;
    for index in 0..count {
        let address = read_pointer(data, sect.offset as u64 + index * pointer_size)?;
        addresses.push(address);
        section_offsets.insert(address, (index * pointer_size) as u32);
    }
    Ok(())
}

/// Chases every class-list address through `__objc_data` and `__objc_const`
/// to its name, producing class-name → classlist-slot-offset.
pub(crate) fn parse_objc_data(
    data: &[u8],
    sect: &Section64,
    arch: Arch,
    base_address: u64,
    class_addresses: &[u64],
    class_section_offsets: &HashMap<u64, u32>,
) -> Result<HashMap<String, u32>> {
    let pointer_size = arch.pointer_size();
    let section_start = sect.offset as u64;
    let section_end = section_start + sect.size;

    let mut map = HashMap::with_capacity(class_addresses.len());
    for &class_address in class_addresses {
        let class_offset = class_address.checked_sub(base_address).ok_or_else(|| {
            Error::malformed(0, format!("objc class address {class_address:#x} below base"))
        })?;
        if class_offset < section_start || class_offset >= section_end {
            return Err(Error::malformed(
                class_offset as usize,
                "objc class record outside __objc_data",
            ));
        }
        // __objc_const
        let ro_address = read_pointer(data, class_offset + class_data_offset(pointer_size))?;
        let ro_offset = ro_address.checked_sub(base_address).ok_or_else(|| {
            Error::malformed(0, format!("objc class data {ro_address:#x} below base"))
        })?;
        // __objc_classname
        let name_address = read_pointer(data, ro_offset + ro_name_offset(pointer_size))?;
        let name_offset = name_address.checked_sub(base_address).ok_or_else(|| {
            Error::malformed(0, format!("objc class name {name_address:#x} below base"))
        })?;
        let name = read_cstr(data, name_offset as usize)?;

        let slot_offset = class_section_offsets.get(&class_address).copied().ok_or_else(
            || Error::malformed(class_offset as usize, "objc class missing from class list"),
        )?;
        map.insert(name, slot_offset);
    }
    Ok(map)
}

/// Creates a proxy atom for each `__objc_classrefs` slot whose target
/// address names a symbol.
pub(crate) fn parse_class_refs(
    data: &[u8],
    sect: &Section64,
    arch: Arch,
    symbol_address_to_index: &HashMap<u64, u32>,
    symtab: Option<&SymtabCommand>,
    symbol_count: u32,
) -> Result<Vec<ObjCClassRefAtom>> {
    let Some(symtab) = symtab else {
        return Ok(Vec::new());
    };
    let pointer_size = arch.pointer_size();
    let count = sect.size / pointer_size;

    let mut atoms = Vec::new();
    for index in 0..count {
        let address = read_pointer(data, sect.offset as u64 + index * pointer_size)?;
        let Some(&sym_index) = symbol_address_to_index.get(&address) else {
            continue;
        };
        let sym = symbol_at(data, symtab, sym_index, symbol_count)?;
        let name = symbol_name_at(data, symtab, sym.n_strx)?;
        atoms.push(ObjCClassRefAtom {
            name,
            section_offset: index * pointer_size,
        });
    }
    Ok(atoms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets_64bit() {
        assert_eq!(class_data_offset(8), 32);
        assert_eq!(ro_name_offset(8), 24);
    }

    #[test]
    fn test_field_offsets_parameterized() {
        // a 32-bit target would chase the same chain at narrower offsets
        assert_eq!(class_data_offset(4), 16);
        assert_eq!(ro_name_offset(4), 16);
    }
}
