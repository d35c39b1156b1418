//! Sidecar table encoding.
//!
//! Emits the five regions in the layout order of the load command's offset
//! fields (inputs, fixups, global symbols, patch space, strings). Parsing a
//! serialized sidecar and serializing it again reproduces every region
//! byte-for-byte.

use crate::macho::IncrementalCommand;

use super::{InputKind, PatchSpace, Sidecar, PATCH_SPACE_ENTRY_SIZE};

/// Serializes the string pool region.
pub fn serialize_strings(sidecar: &Sidecar) -> Vec<u8> {
    let mut out = Vec::new();
    for name in &sidecar.strings {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    out
}

/// Serializes the input-entry region.
pub fn serialize_inputs(sidecar: &Sidecar) -> Vec<u8> {
    let mut out = Vec::new();
    for input in &sidecar.inputs {
        out.extend_from_slice(&input.path_index.to_le_bytes());
        out.extend_from_slice(&input.mod_time.to_le_bytes());
        out.extend_from_slice(&(input.kind as u32).to_le_bytes());
        if input.kind == InputKind::Relocatable {
            out.extend_from_slice(&(input.atoms.len() as u32).to_le_bytes());
            for atom in &input.atoms {
                out.extend_from_slice(&atom.name_index.to_le_bytes());
                out.extend_from_slice(&atom.file_offset.to_le_bytes());
                out.extend_from_slice(&atom.size.to_le_bytes());
            }
        }
    }
    out
}

/// Serializes the fixup region, count-prefixed.
pub fn serialize_fixups(sidecar: &Sidecar) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(sidecar.fixups.len() as u32).to_le_bytes());
    for fixup in &sidecar.fixups {
        out.extend_from_slice(&fixup.address.to_le_bytes());
        out.extend_from_slice(&fixup.name_index.to_le_bytes());
    }
    out
}

/// Serializes the global-symbol region.
pub fn serialize_global_symbols(sidecar: &Sidecar) -> Vec<u8> {
    let mut out = Vec::new();
    for symbol in &sidecar.global_symbols {
        out.extend_from_slice(&symbol.name_index.to_le_bytes());
        out.extend_from_slice(&(symbol.referenced_files.len() as u32).to_le_bytes());
        for file_index in &symbol.referenced_files {
            out.extend_from_slice(&file_index.to_le_bytes());
        }
    }
    out
}

/// Serializes one patch-space record into its packed 29-byte form.
pub fn serialize_patch_space_entry(entry: &PatchSpace, out: &mut Vec<u8>) {
    let mut name = [0u8; 17];
    let bytes = entry.sectname.as_bytes();
    let len = bytes.len().min(16);
    name[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&name);
    out.extend_from_slice(&entry.patch_offset.to_le_bytes());
    out.extend_from_slice(&entry.patch_space.to_le_bytes());
}

/// Serializes the patch-space region.
pub fn serialize_patch_space(sidecar: &Sidecar) -> Vec<u8> {
    let mut out = Vec::with_capacity(sidecar.patch_space.len() * PATCH_SPACE_ENTRY_SIZE);
    for entry in &sidecar.patch_space {
        serialize_patch_space_entry(entry, &mut out);
    }
    out
}

/// Serializes the whole sidecar into a contiguous blob starting at
/// `base_offset`, returning the load command that addresses it.
///
/// Regions are laid out in command field order: inputs, fixups, global
/// symbols, patch space, strings.
pub fn serialize_sidecar(sidecar: &Sidecar, base_offset: u32) -> (IncrementalCommand, Vec<u8>) {
    let inputs = serialize_inputs(sidecar);
    let fixups = serialize_fixups(sidecar);
    let symbols = serialize_global_symbols(sidecar);
    let patches = serialize_patch_space(sidecar);
    let strings = serialize_strings(sidecar);

    let mut cmd = IncrementalCommand {
        file_count: sidecar.inputs.len() as u32,
        ..Default::default()
    };
    let mut blob = Vec::with_capacity(
        inputs.len() + fixups.len() + symbols.len() + patches.len() + strings.len(),
    );

    cmd.inputs_off = base_offset;
    cmd.inputs_size = inputs.len() as u32;
    blob.extend_from_slice(&inputs);

    cmd.fixups_off = base_offset + blob.len() as u32;
    cmd.fixups_size = fixups.len() as u32;
    blob.extend_from_slice(&fixups);

    cmd.symtab_off = base_offset + blob.len() as u32;
    cmd.symtab_size = symbols.len() as u32;
    blob.extend_from_slice(&symbols);

    cmd.patch_space_off = base_offset + blob.len() as u32;
    cmd.patch_space_size = patches.len() as u32;
    blob.extend_from_slice(&patches);

    cmd.strtab_off = base_offset + blob.len() as u32;
    cmd.strtab_size = strings.len() as u32;
    blob.extend_from_slice(&strings);

    (cmd, blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_space_entry_is_29_bytes() {
        let entry = PatchSpace {
            sectname: "__text".into(),
            patch_offset: 0x100,
            patch_space: 0x40,
        };
        let mut out = Vec::new();
        serialize_patch_space_entry(&entry, &mut out);
        assert_eq!(out.len(), PATCH_SPACE_ENTRY_SIZE);
        assert_eq!(&out[..6], b"__text");
        assert_eq!(out[6], 0);
    }

    #[test]
    fn test_empty_sidecar_regions() {
        let (cmd, blob) = serialize_sidecar(&Sidecar::default(), 0x400);
        assert_eq!(cmd.file_count, 0);
        assert_eq!(cmd.inputs_size, 0);
        // the fixup region always carries its count word
        assert_eq!(cmd.fixups_size, 4);
        assert_eq!(cmd.inputs_off, 0x400);
        assert_eq!(blob.len(), 4);
    }
}
