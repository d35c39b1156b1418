//! The write half of an incremental session.
//!
//! Every write lands inside a reserved patch window, so bytes of atoms the
//! new link did not touch keep their file offsets and vm addresses. A write
//! that would overflow its window returns `IncrementalImpossible` for that
//! section and leaves the image exactly as it was; the driver downgrades to
//! a full link.

use std::collections::HashMap;

use tracing::debug;
use zerocopy::IntoBytes;

use crate::error::{Error, Result};
use crate::incremental::{Incremental, SessionState};
use crate::macho::{DyldInfoCommand, Nlist64, Section64};
use crate::parser::{encode_binding_info, encode_rebase_info, BindingEntry, DylibFile, RebaseEntry};
use crate::util::write_u32_le_at;

impl Incremental {
    fn require_decided(&self) -> Result<()> {
        match self.state {
            SessionState::Decided | SessionState::Patched => Ok(()),
            SessionState::Opened => Err(Error::InvalidState {
                reason: "writes require the arbiter to have run",
            }),
        }
    }

    /// Splices `bytes` into the reserved patch window of `section`.
    ///
    /// Returns the file offset the bytes were written at. The window's
    /// `patch_offset` advances and its `patch_space` shrinks by the same
    /// amount, so consecutive appends are laid out back to back.
    pub fn patch_section(&mut self, section: &str, bytes: &[u8]) -> Result<u64> {
        self.require_decided()?;
        let boundary = *self
            .model
            .section_boundaries
            .get(section)
            .ok_or_else(|| Error::impossible(section))?;
        let patch = self
            .model
            .patch_space
            .get_mut(section)
            .ok_or_else(|| Error::impossible(section))?;
        if (bytes.len() as u64) > patch.patch_space as u64 {
            return Err(Error::impossible(section));
        }
        let file_offset = boundary.file_offset + patch.patch_offset;
        let start = file_offset as usize;
        let image = self.image.as_mut_slice();
        if start + bytes.len() > image.len() {
            return Err(Error::malformed(start, "patch window outside the image"));
        }
        image[start..start + bytes.len()].copy_from_slice(bytes);
        patch.patch_offset += bytes.len() as u64;
        patch.patch_space -= bytes.len() as u32;
        debug!(section, len = bytes.len(), file_offset, "patched");
        self.state = SessionState::Patched;
        Ok(file_offset)
    }

    /// Returns the pool offset of `name`, appending it to the string pool's
    /// patch window first if the previous link never emitted it.
    pub fn add_unique_string(&mut self, name: &str) -> Result<u32> {
        if let Some(&offset) = self.model.string_pool.get(name) {
            return Ok(offset);
        }
        let offset = self.model.current_buffer_used;
        let mut bytes = Vec::with_capacity(name.len() + 1);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        self.patch_section("__string_pool", &bytes)?;
        self.model.current_buffer_used += bytes.len() as u32;
        self.model.string_pool.insert(name.to_owned(), offset);
        self.appended_strings.push(name.to_owned());
        Ok(offset)
    }

    /// Registers a symbol record appended into the symbol table's reserved
    /// tail, returning its record offset.
    pub fn add_sym_section_offset(&mut self, n_type: u8, name: &str) -> u64 {
        let offset = self.model.symbol_count as u64 * Nlist64::SIZE as u64;
        self.model.symbol_count += 1;
        self.model
            .sym_to_section_offset
            .entry(n_type)
            .or_default()
            .insert(name.to_owned(), offset);
        offset
    }

    /// Rewrites the symbol record for `name` in place.
    pub fn update_symbol_record(&mut self, n_type: u8, name: &str, record: &Nlist64) -> Result<()> {
        self.require_decided()?;
        let symtab = self.model.symtab.ok_or(Error::InvalidState {
            reason: "image has no symbol table",
        })?;
        let relative = self
            .sym_section_offset(n_type, name)
            .ok_or_else(|| Error::malformed(0, format!("no symbol record for '{name}'")))?;
        let offset = symtab.symoff as usize + relative as usize;
        let image = self.image.as_mut_slice();
        if offset + Nlist64::SIZE > image.len() {
            return Err(Error::malformed(offset, "symbol record outside the image"));
        }
        image[offset..offset + Nlist64::SIZE].copy_from_slice(record.as_bytes());
        self.state = SessionState::Patched;
        Ok(())
    }

    /// Rewrites `reserved1` (the indirect-table base index) of a pointer or
    /// stub section's header.
    pub fn update_indirect_symbol_index(&mut self, section: &str, index: u32) -> Result<()> {
        self.require_decided()?;
        let header_offset = *self
            .model
            .section_header_offsets
            .get(section)
            .ok_or_else(|| Error::unsupported(format!("no section named '{section}'")))?;
        let field = header_offset + Section64::RESERVED1_OFFSET;
        let image = self.image.as_mut_slice();
        if field + 4 > image.len() {
            return Err(Error::malformed(field, "section header outside the image"));
        }
        write_u32_le_at(image, field, index);
        for record in &mut self.model.sections {
            if record.header_offset == header_offset {
                record.sect.reserved1 = index;
            }
        }
        self.state = SessionState::Patched;
        Ok(())
    }

    /// Rewrites one indirect-symbol-table slot.
    pub fn write_indirect_symbol(&mut self, slot: u32, symbol_index: u32) -> Result<()> {
        self.require_decided()?;
        let dysymtab = self.model.dysymtab.ok_or(Error::InvalidState {
            reason: "image has no indirect symbol table",
        })?;
        if slot >= dysymtab.nindirectsyms {
            return Err(Error::malformed(
                dysymtab.indirectsymoff as usize,
                format!("indirect slot {slot} out of range"),
            ));
        }
        let offset = dysymtab.indirectsymoff as usize + slot as usize * 4;
        write_u32_le_at(self.image.as_mut_slice(), offset, symbol_index);
        self.state = SessionState::Patched;
        Ok(())
    }

    /// Regenerates the rebase opcode stream for `entries` and appends it
    /// after the used prefix of the rebase region, bumping the load
    /// command's `rebase_size`.
    pub fn write_rebase_info(&mut self, entries: &[RebaseEntry]) -> Result<()> {
        let stream = encode_rebase_info(
            entries,
            &self.model.segments,
            self.model.arch.pointer_size(),
        )?;
        self.append_dyld_info("__rebase", &stream)?;
        self.update_dyld_info_command(|cmd| cmd.rebase_size += stream.len() as u32)
    }

    /// Regenerates and appends non-lazy binding info.
    pub fn write_bindings(&mut self, entries: &[BindingEntry]) -> Result<()> {
        let stream = encode_binding_info(
            entries,
            &self.model.segments,
            self.model.arch.pointer_size(),
            false,
        )?;
        self.append_dyld_info("__binding", &stream)?;
        self.update_dyld_info_command(|cmd| cmd.bind_size += stream.len() as u32)
    }

    /// Regenerates and appends lazy binding info.
    pub fn write_lazy_bindings(&mut self, entries: &[BindingEntry]) -> Result<()> {
        let stream = encode_binding_info(
            entries,
            &self.model.segments,
            self.model.arch.pointer_size(),
            true,
        )?;
        self.append_dyld_info("__lazy_binding", &stream)?;
        self.update_dyld_info_command(|cmd| cmd.lazy_bind_size += stream.len() as u32)
    }

    fn append_dyld_info(&mut self, region: &str, stream: &[u8]) -> Result<()> {
        if self.model.dyld_info.is_none() {
            return Err(Error::InvalidState {
                reason: "image has no dyld info command",
            });
        }
        self.patch_section(region, stream)?;
        Ok(())
    }

    fn update_dyld_info_command(&mut self, apply: impl FnOnce(&mut DyldInfoCommand)) -> Result<()> {
        let offset = self.model.dyld_info_cmd_offset.ok_or(Error::InvalidState {
            reason: "image has no dyld info command",
        })?;
        let mut cmd = self.model.dyld_info.unwrap();
        apply(&mut cmd);
        self.model.dyld_info = Some(cmd);
        let image = self.image.as_mut_slice();
        image[offset..offset + DyldInfoCommand::SIZE].copy_from_slice(cmd.as_bytes());
        Ok(())
    }

    /// Rewrites the LC_UUID payload. The driver computes the UUID; the
    /// patcher only places it.
    pub fn set_uuid(&mut self, uuid: &[u8; 16]) -> Result<()> {
        self.require_decided()?;
        let offset = self.model.uuid_payload_offset.ok_or(Error::InvalidState {
            reason: "image has no LC_UUID command",
        })?;
        self.image.as_mut_slice()[offset..offset + 16].copy_from_slice(uuid);
        self.state = SessionState::Patched;
        Ok(())
    }

    /// Assigns `dylib` the next free ordinal in the driver's map, or
    /// returns the one it already holds.
    pub fn update_dylib_ordinal(map: &mut HashMap<String, u32>, dylib: &DylibFile) -> u32 {
        if let Some(&ordinal) = map.get(&dylib.install_name) {
            return ordinal;
        }
        let ordinal = map.len() as u32 + 1;
        map.insert(dylib.install_name.clone(), ordinal);
        ordinal
    }
}
