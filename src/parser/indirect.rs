//! Indirect symbol table walking and stub/proxy reconstruction.
//!
//! Every `__got`-style pointer section and symbol-stub section indexes the
//! indirect symbol table. Walking the used portion of each (the reserved
//! patch tail holds no live slots) resurrects one stub atom per imported
//! symbol, plus a synthesized dylib stand-in for the providing library, so
//! the resolver treats reconstructed imports exactly like freshly parsed
//! ones.

use tracing::debug;

use crate::error::{Error, Result};
use crate::image::Arch;
use crate::macho::*;
use crate::util::read_u32_le_at;

use super::symtab::{symbol_at, symbol_name_at};
use super::{DylibFile, ParsedImage, SectionBoundary, StubAtom};

pub(crate) fn parse_indirect_symbol_table(
    data: &[u8],
    arch: Arch,
    linkedit: Option<&SegmentCommand64>,
    image: &mut ParsedImage,
) -> Result<()> {
    if let (Some(dysymtab), Some(linkedit)) = (image.dysymtab, linkedit) {
        walk_indirect_sections(data, arch, &dysymtab, linkedit, image)?;
    }

    // Every import left in the dylib symbol map has no stub (referenced
    // through the GOT of another image, or only by name). It still needs its
    // dylib registered so ordinals resolve.
    let mut leftovers: Vec<(String, Nlist64)> = image
        .dylib_symbol_map
        .iter()
        .map(|(name, sym)| (name.clone(), *sym))
        .collect();
    leftovers.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, sym) in leftovers {
        let ordinal = sym.ordinal();
        if ordinal == 0 || ordinal as usize > image.dylib_commands.len() {
            debug!(symbol = %name, ordinal, "import without a resolvable dylib ordinal");
            continue;
        }
        register_dylib(image, ordinal);
    }
    Ok(())
}

fn walk_indirect_sections(
    data: &[u8],
    arch: Arch,
    dysymtab: &DysymtabCommand,
    linkedit: &SegmentCommand64,
    image: &mut ParsedImage,
) -> Result<()> {
    let table_offset = dysymtab.indirectsymoff as u64;
    let table_count = dysymtab.nindirectsyms;
    if table_count == 0 {
        return Ok(());
    }

    let linkedit_end = linkedit.fileoff + linkedit.filesize;
    if table_offset < linkedit.fileoff {
        return Err(Error::malformed(
            table_offset as usize,
            "indirect symbol table not in __LINKEDIT",
        ));
    }
    if table_offset + table_count as u64 * 4 > linkedit_end
        || table_offset + table_count as u64 * 4 > data.len() as u64
    {
        return Err(Error::malformed(
            table_offset as usize,
            "indirect symbol table not in __LINKEDIT",
        ));
    }
    if table_offset % arch.pointer_size() != 0 {
        return Err(Error::malformed(
            table_offset as usize,
            "indirect symbol table not pointer aligned",
        ));
    }
    image.section_boundaries.insert(
        "__ind_sym_tab".into(),
        SectionBoundary {
            address: image.base_address + table_offset,
            file_offset: table_offset,
            size: table_count as u64 * 4,
        },
    );

    let symtab = image
        .symtab
        .ok_or_else(|| Error::malformed(0, "indirect symbols without a symbol table"))?;
    let pointer_size = arch.pointer_size();

    let sections: Vec<Section64> = image.sections.iter().map(|r| r.sect).collect();
    for sect in sections {
        let (element_size, start) = match sect.section_type() {
            S_SYMBOL_STUBS => (sect.reserved2 as u64, sect.reserved1),
            S_NON_LAZY_SYMBOL_POINTERS => (pointer_size, sect.reserved1),
            _ => continue,
        };
        if element_size == 0 {
            continue;
        }
        let name = sect.name().to_owned();
        let reserved = image
            .patch_space
            .get(&name)
            .map(|p| p.patch_space as u64)
            .unwrap_or(0);
        if reserved > sect.size {
            return Err(Error::malformed(
                sect.offset as usize,
                format!("patch space for '{name}' larger than the section"),
            ));
        }
        let count = (sect.size - reserved) / element_size;

        for index in 0..count {
            let slot = start as u64 + index;
            if slot >= table_count as u64 {
                return Err(Error::malformed(
                    table_offset as usize,
                    "indirect symbol index out of range",
                ));
            }
            let sym_index = read_u32_le_at(data, (table_offset + slot * 4) as usize);
            if sym_index == INDIRECT_SYMBOL_LOCAL
                || sym_index == (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)
            {
                continue;
            }
            let sym = symbol_at(data, &symtab, sym_index, image.symbol_count)?;
            let symbol_name = symbol_name_at(data, &symtab, sym.n_strx)?;
            if symbol_name == "dyld_stub_binder" {
                continue;
            }
            let address = sect.addr + index * pointer_size;
            let ordinal = sym.ordinal();
            if ordinal == 0 || ordinal as usize > image.dylib_commands.len() {
                return Err(Error::malformed(
                    table_offset as usize,
                    format!("stub '{symbol_name}' has dylib ordinal {ordinal} out of range"),
                ));
            }
            let dylib = register_dylib(image, ordinal);
            debug!(
                section = %name,
                symbol = %symbol_name,
                address,
                ordinal,
                "reconstructed stub"
            );
            image.stub_atoms.push(StubAtom {
                name: symbol_name.clone(),
                ordinal,
                address,
                weak_import: sym.is_weak_import(),
                compat_version: dylib.compatibility_version,
            });
            image.stub_names.insert(symbol_name.clone());
            image.dylib_symbol_map.remove(&symbol_name);
        }
    }
    Ok(())
}

/// Synthesizes (once) the dylib stand-in for `ordinal` and registers it in
/// the ordinal maps.
fn register_dylib(image: &mut ParsedImage, ordinal: u32) -> DylibFile {
    let command = &image.dylib_commands[ordinal as usize - 1];
    let file = DylibFile {
        install_name: command.install_name.clone(),
        ordinal,
        current_version: command.current_version,
        compatibility_version: command.compatibility_version,
    };
    if !image.dylib_to_ordinal.contains_key(&file.install_name) {
        image
            .dylib_to_ordinal
            .insert(file.install_name.clone(), ordinal);
        image
            .dylib_name_to_ordinal
            .insert(file.short_name().to_owned(), ordinal);
        image.dylib_files.push(file.clone());
    }
    file
}
