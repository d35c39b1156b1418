//! The incremental session facade.
//!
//! [`Incremental`] owns the mapped output image and the reconstructed model
//! of the previous link, and walks the session through its states:
//!
//! ```text
//! Idle → Opened (image mapped, model parsed)
//!      → Decided (arbiter ran)
//!      → Patched (writes issued)
//!      → Closed (unmap + close)
//! ```
//!
//! Everything the driver queries — stub atoms, boundaries, rebases,
//! bindings, ordinals, lookup helpers — is served from here; the write API
//! lives in the `patcher` module as further methods on this type.

use std::collections::HashMap;

use tracing::info;

use crate::arbiter::{arbitrate, Decision, InputFile, Options};
use crate::error::{Error, Result};
use crate::image::{Arch, ImageBuffer};
use crate::parser::{
    parse_image, BindingEntry, DylibFile, ObjCClassRefAtom, ParsedImage, RebaseEntry,
    SectionBoundary, SegmentBoundary, StubAtom,
};
use crate::sidecar::{Fixup, PatchSpace, Sidecar};

/// Where an incremental session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Image mapped and model parsed
    Opened,
    /// The arbiter classified the inputs
    Decided,
    /// At least one write was issued
    Patched,
}

/// An open incremental session over a previously produced binary.
#[derive(Debug)]
pub struct Incremental {
    pub(crate) image: ImageBuffer,
    pub(crate) model: ParsedImage,
    pub(crate) state: SessionState,
    decision: Option<Decision>,
    pub(crate) appended_strings: Vec<String>,
}

impl Incremental {
    /// Opens the output image named by the driver's options and
    /// reconstructs the previous link's model.
    ///
    /// Any error tells the driver to run a full link instead; see
    /// [`Error::requires_full_link`].
    pub fn open(options: &Options) -> Result<Self> {
        let image = ImageBuffer::open(&options.output_path)?;
        Self::from_image(image, options.arch)
    }

    /// Opens a session over in-memory bytes.
    pub fn open_buffer(bytes: Vec<u8>, arch: Arch) -> Result<Self> {
        Self::from_image(ImageBuffer::from_vec(bytes), arch)
    }

    fn from_image(image: ImageBuffer, arch: Arch) -> Result<Self> {
        let model = parse_image(image.as_slice(), arch)?;
        info!(
            inputs = model.sidecar.inputs.len(),
            stubs = model.stub_atoms.len(),
            base = format_args!("{:#x}", model.base_address),
            "incremental model reconstructed"
        );
        Ok(Self {
            image,
            model,
            state: SessionState::Opened,
            decision: None,
            appended_strings: Vec::new(),
        })
    }

    /// Runs the validity arbiter over the driver's declared inputs.
    pub fn decide(&mut self, inputs: &[InputFile]) -> Result<&Decision> {
        if self.state != SessionState::Opened {
            return Err(Error::InvalidState {
                reason: "arbiter already ran for this session",
            });
        }
        let decision = arbitrate(&self.model, inputs);
        self.state = SessionState::Decided;
        self.decision = Some(decision);
        Ok(self.decision.as_ref().unwrap())
    }

    /// The arbiter's verdict, when it has run.
    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Flushes and releases the mapped image.
    pub fn close(self) -> Result<()> {
        self.image.close()
    }

    // ========================================================================
    // Model views
    // ========================================================================

    /// The whole reconstructed model.
    pub fn parsed(&self) -> &ParsedImage {
        &self.model
    }

    /// The image bytes.
    pub fn image_bytes(&self) -> &[u8] {
        self.image.as_slice()
    }

    /// `__TEXT.vmaddr` of the image.
    pub fn base_address(&self) -> u64 {
        self.model.base_address
    }

    /// True when the sidecar recorded inputs to arbitrate against.
    pub fn can_incremental_update(&self) -> bool {
        self.model.can_incremental_update()
    }

    /// True when the image carries an entry point the driver must not
    /// regenerate.
    pub fn has_valid_entry_point(&self) -> bool {
        self.model.has_entry_point
    }

    /// Reconstructed stub atoms, one per imported symbol with a slot.
    pub fn stub_atoms(&self) -> &[StubAtom] {
        &self.model.stub_atoms
    }

    /// True when a stub for `name` was reconstructed.
    pub fn contains_stub_name(&self, name: &str) -> bool {
        self.model.stub_names.contains(name)
    }

    /// Reconstructed ObjC class-ref proxies.
    pub fn objc_class_ref_atoms(&self) -> &[ObjCClassRefAtom] {
        &self.model.objc_class_ref_atoms
    }

    /// Slot offset of a class in `__objc_classlist`.
    pub fn objc_class_section_offset(&self, class_name: &str) -> Option<u32> {
        self.model.objc_class_index_map.get(class_name).copied()
    }

    /// Segment extents in dyld index order.
    pub fn segment_boundaries(&self) -> &[SegmentBoundary] {
        &self.model.segment_boundaries
    }

    /// Boundary of a section or pseudo-section.
    pub fn section_boundary(&self, name: &str) -> Option<&SectionBoundary> {
        self.model.section_boundaries.get(name)
    }

    /// Start address of a section.
    pub fn section_start_address(&self, name: &str) -> Option<u64> {
        self.section_boundary(name).map(|b| b.address)
    }

    /// File offset of a section.
    pub fn section_file_offset(&self, name: &str) -> Option<u64> {
        self.section_boundary(name).map(|b| b.file_offset)
    }

    /// File offset of the next free byte in a section's patch window.
    pub fn section_patch_file_offset(&self, name: &str) -> Option<u64> {
        let boundary = self.section_boundary(name)?;
        let patch = self.model.patch_space.get(name)?;
        Some(boundary.file_offset + patch.patch_offset)
    }

    /// Patch reservation for a section.
    pub fn patch_space(&self, name: &str) -> Option<&PatchSpace> {
        self.model.patch_space.get(name)
    }

    /// Rebases recorded by the previous link.
    pub fn rebase_info(&self) -> &[RebaseEntry] {
        &self.model.rebase_info
    }

    /// True when `address` was rebased by the previous link.
    pub fn contains_rebase_address(&self, address: u64) -> bool {
        self.model.rebase_addresses.contains(&address)
    }

    /// Non-lazy bindings.
    pub fn binding_info(&self) -> &[BindingEntry] {
        &self.model.binding_info
    }

    /// Weak bindings.
    pub fn weak_binding_info(&self) -> &[BindingEntry] {
        &self.model.weak_binding_info
    }

    /// Lazy bindings.
    pub fn lazy_binding_info(&self) -> &[BindingEntry] {
        &self.model.lazy_binding_info
    }

    /// Synthesized dylib stand-ins.
    pub fn dylib_files(&self) -> &[DylibFile] {
        &self.model.dylib_files
    }

    /// Install name → ordinal for every referenced dylib.
    pub fn dylib_ordinals(&self) -> &HashMap<String, u32> {
        &self.model.dylib_to_ordinal
    }

    /// Ordinal for a dylib's short name ("libSystem").
    pub fn dylib_ordinal_for_name(&self, short_name: &str) -> Option<u32> {
        self.model.dylib_name_to_ordinal.get(short_name).copied()
    }

    /// The decoded sidecar tables.
    pub fn sidecar(&self) -> &Sidecar {
        &self.model.sidecar
    }

    /// Fixups recorded against `atom_name`.
    pub fn find_relocations(&self, atom_name: &str) -> &[Fixup] {
        self.model
            .fixups_by_name
            .get(atom_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Record offset of `name` within the symbol table, among records of
    /// `n_type`.
    pub fn sym_section_offset(&self, n_type: u8, name: &str) -> Option<u64> {
        self.model.sym_to_section_offset.get(&n_type)?.get(name).copied()
    }

    /// Offset of the first symbol record with `n_type`.
    pub fn symbol_offset_for_type(&self, n_type: u8) -> Option<u32> {
        self.model.symbol_type_to_offset.get(&n_type).copied()
    }

    /// Offset of `name` in the Mach-O string pool.
    pub fn symbol_index_in_strings(&self, name: &str) -> Option<u32> {
        self.model.string_pool.get(name).copied()
    }

    /// Strings appended to the pool during this session.
    pub fn appended_strings(&self) -> &[String] {
        &self.appended_strings
    }
}
