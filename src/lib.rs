//! relink - the incremental-link core of a Mach-O static linker.
//!
//! This library lets a linker driver reuse a previously produced
//! executable or dylib as the starting point of the next link, patching
//! only the bytes that correspond to inputs that actually changed. The
//! previous link records everything needed for that inside the image
//! itself: an auxiliary load command plus five self-describing tables (the
//! "sidecar"), and reserved patch space in every variable-length section.
//!
//! # Features
//!
//! - Memory-mapped, in-place access to the output image
//! - Full reconstruction of the prior link's model: inputs, atoms, fixups,
//!   stub atoms, rebases, bindings, dylib ordinals, ObjC class tables
//! - mtime-based arbitration of which inputs must be re-linked
//! - Patch-window splicing that preserves every untouched atom's address
//!
//! # Example
//!
//! ```no_run
//! use relink::{Arch, Incremental, InputFile, Options};
//!
//! fn main() -> relink::Result<()> {
//!     let options = Options {
//!         output_path: "build/app".into(),
//!         arch: Arch::Arm64,
//!         inputs: vec![InputFile {
//!             path: "main.o".into(),
//!             mod_time: 1_700_000_000,
//!             from_file_list: true,
//!         }],
//!     };
//!
//!     let mut session = match Incremental::open(&options) {
//!         Ok(session) => session,
//!         Err(e) if e.requires_full_link() => {
//!             // fall back to the from-scratch path
//!             return Ok(());
//!         }
//!         Err(e) => return Err(e),
//!     };
//!
//!     let decision = session.decide(&options.inputs)?;
//!     println!("unchanged inputs: {:?}", decision.unchanged);
//!     session.close()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arbiter;
pub mod error;
pub mod image;
pub mod incremental;
pub mod macho;
pub mod parser;
mod patcher;
pub mod sidecar;
pub mod util;

#[cfg(test)]
pub(crate) mod testfix;

// Re-export main types
pub use arbiter::{Decision, InputFile, InputState, Options};
pub use error::{Error, Result};
pub use image::{Arch, ImageBuffer};
pub use incremental::{Incremental, SessionState};
pub use parser::{
    BindingEntry, DylibFile, ObjCClassRefAtom, ParsedImage, RebaseEntry, SectionBoundary,
    SegmentBoundary, StubAtom,
};
pub use sidecar::{Fixup, InputEntry, InputKind, PatchSpace, Sidecar};
