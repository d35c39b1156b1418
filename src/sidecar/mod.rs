//! The incremental sidecar: five self-describing tables embedded in the
//! produced binary that record every fact needed to repeat or partially redo
//! the previous link.
//!
//! The tables are addressed by the `LC_INCREMENTAL` load command and parsed
//! in a fixed order — strings first (inputs and fixups reference them), patch
//! space last (the dyld-info pass consults it afterwards). All records are
//! packed little-endian with trailing variable-length arrays, so they are
//! decoded by explicit cursor arithmetic rather than struct mapping.

mod reader;
mod writer;

pub use reader::*;
pub use writer::*;

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Size of one packed patch-space record: 17-byte name + u64 + u32.
pub const PATCH_SPACE_ENTRY_SIZE: usize = 29;

/// Size of the fixed input-entry prefix: u32 name index + u64 mtime + u32 kind.
pub const INPUT_ENTRY_PREFIX_SIZE: usize = 16;

/// Size of one packed atom record: u32 name index + u64 file offset + u32 size.
pub const ATOM_ENTRY_SIZE: usize = 16;

/// Size of one packed fixup record: u64 address + u32 name index.
pub const FIXUP_ENTRY_SIZE: usize = 12;

/// The kind of an input file recorded by the previous link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InputKind {
    /// Relocatable object file; carries an atom list.
    Relocatable = 0,
    /// Dynamic library.
    Dylib = 1,
    /// Static archive.
    Archive = 2,
    /// Anything else (linker scripts, order files).
    Other = 3,
}

impl InputKind {
    /// Decodes the on-disk discriminant.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(InputKind::Relocatable),
            1 => Some(InputKind::Dylib),
            2 => Some(InputKind::Archive),
            3 => Some(InputKind::Other),
            _ => None,
        }
    }
}

/// One atom contributed by a relocatable input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomEntry {
    /// Index of the atom name in the incremental string pool
    pub name_index: u32,
    /// File offset of the atom's bytes in the image
    pub file_offset: u64,
    /// Size of the atom in bytes
    pub size: u32,
}

/// One input file of the previous link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    /// Index of the input path in the incremental string pool
    pub path_index: u32,
    /// Modification time recorded when the input was last consumed
    pub mod_time: u64,
    /// Input kind
    pub kind: InputKind,
    /// Atoms, present only for relocatable inputs
    pub atoms: Vec<AtomEntry>,
}

/// A previously emitted relocation tying an absolute address to a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Absolute address in the image
    pub address: u64,
    /// Index of the target symbol name in the incremental string pool
    pub name_index: u32,
}

/// The set of input files that reference a global symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSymbol {
    /// Index of the symbol name in the incremental string pool
    pub name_index: u32,
    /// Indices of the referencing input files
    pub referenced_files: Vec<u32>,
}

/// Reserved scratch space inside a section.
///
/// Starting at `section file offset + patch_offset`, `patch_space` bytes are
/// reserved for incremental appends. The writer must never exceed this
/// window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpace {
    /// Section name (up to 16 characters)
    pub sectname: String,
    /// Offset of the first reserved byte, relative to the section start
    pub patch_offset: u64,
    /// Remaining reserved bytes
    pub patch_space: u32,
}

/// The decoded sidecar: the five tables in their on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sidecar {
    /// The incremental string pool, in index order
    pub strings: Vec<String>,
    /// Input files, in the order the previous link consumed them
    pub inputs: Vec<InputEntry>,
    /// All recorded fixups, in table order
    pub fixups: Vec<Fixup>,
    /// Global symbols with their referencing files
    pub global_symbols: Vec<GlobalSymbol>,
    /// Patch-space reservations, in table order
    pub patch_space: Vec<PatchSpace>,
}

impl Sidecar {
    /// Looks up a pooled string by index.
    pub fn string(&self, index: u32) -> Result<&str> {
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::malformed(0, format!("string index {index} out of range"))
            })
    }

    /// Builds the path → input map.
    pub fn inputs_by_path(&self) -> Result<HashMap<String, usize>> {
        let mut map = HashMap::with_capacity(self.inputs.len());
        for (index, input) in self.inputs.iter().enumerate() {
            map.insert(self.string(input.path_index)?.to_owned(), index);
        }
        Ok(map)
    }

    /// Groups fixups by target symbol name.
    pub fn fixups_by_name(&self) -> Result<HashMap<String, Vec<Fixup>>> {
        let mut map: HashMap<String, Vec<Fixup>> = HashMap::new();
        for fixup in &self.fixups {
            let name = self.string(fixup.name_index)?;
            map.entry(name.to_owned()).or_default().push(*fixup);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_kind_decoding() {
        assert_eq!(InputKind::from_u32(0), Some(InputKind::Relocatable));
        assert_eq!(InputKind::from_u32(2), Some(InputKind::Archive));
        assert_eq!(InputKind::from_u32(7), None);
    }

    #[test]
    fn test_sidecar_maps() {
        let sidecar = Sidecar {
            strings: vec!["a.o".into(), "_foo".into()],
            inputs: vec![InputEntry {
                path_index: 0,
                mod_time: 100,
                kind: InputKind::Relocatable,
                atoms: vec![],
            }],
            fixups: vec![
                Fixup { address: 0x1000, name_index: 1 },
                Fixup { address: 0x2000, name_index: 1 },
            ],
            global_symbols: vec![],
            patch_space: vec![],
        };
        let inputs = sidecar.inputs_by_path().unwrap();
        assert_eq!(inputs["a.o"], 0);
        let fixups = sidecar.fixups_by_name().unwrap();
        assert_eq!(fixups["_foo"].len(), 2);
    }

    #[test]
    fn test_bad_string_index() {
        let sidecar = Sidecar {
            strings: vec!["a.o".into()],
            fixups: vec![Fixup { address: 0, name_index: 9 }],
            ..Default::default()
        };
        assert!(sidecar.fixups_by_name().is_err());
    }
}
