//! Validity arbitration: which inputs of the previous link are still good.
//!
//! Every input the driver declares is compared against the sidecar record
//! from the previous link. An input missing from the sidecar is new, one
//! whose on-disk mtime moved forward is changed, and the rest are unchanged
//! and can be dropped from the driver's to-parse list.

use std::path::PathBuf;

use tracing::info;

use crate::image::Arch;
use crate::parser::ParsedImage;

/// Driver-side options the incremental core consumes.
#[derive(Debug, Clone)]
pub struct Options {
    /// Path of the output image to reuse
    pub output_path: PathBuf,
    /// Target architecture
    pub arch: Arch,
    /// Input files of the current link, with their on-disk mtimes
    pub inputs: Vec<InputFile>,
}

/// One input file as the driver sees it.
#[derive(Debug, Clone)]
pub struct InputFile {
    /// Path as given on the command line
    pub path: String,
    /// Modification time the driver observed on disk
    pub mod_time: u64,
    /// True when the input came from the file list (only those participate
    /// in incremental arbitration)
    pub from_file_list: bool,
}

/// How one input compares to the previous link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// Recorded with the same mtime; the driver can skip re-parsing it
    Unchanged,
    /// Recorded, but the file is newer on disk
    Changed,
    /// Not recorded by the previous link
    New,
}

/// The arbiter's verdict for a whole link invocation.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Inputs the driver can drop from its to-parse list
    pub unchanged: Vec<String>,
    /// Inputs that must be re-parsed
    pub changed: Vec<String>,
    /// Inputs the previous link never saw
    pub new_files: Vec<String>,
    /// True when the image already carries an entry point and the driver
    /// must not synthesize a new one
    pub suppress_entry_point: bool,
}

impl Decision {
    /// Classification for a single path.
    pub fn state_of(&self, path: &str) -> Option<InputState> {
        if self.unchanged.iter().any(|p| p == path) {
            Some(InputState::Unchanged)
        } else if self.changed.iter().any(|p| p == path) {
            Some(InputState::Changed)
        } else if self.new_files.iter().any(|p| p == path) {
            Some(InputState::New)
        } else {
            None
        }
    }

    /// True when nothing changed and the patcher has no work.
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && self.new_files.is_empty()
    }
}

/// Classifies each declared input against the parsed image's sidecar.
pub fn arbitrate(image: &ParsedImage, inputs: &[InputFile]) -> Decision {
    let mut decision = Decision {
        suppress_entry_point: image.has_entry_point,
        ..Default::default()
    };
    for input in inputs {
        if !input.from_file_list {
            continue;
        }
        let Some(&index) = image.inputs_by_path.get(&input.path) else {
            info!(path = %input.path, "incremental: new file");
            decision.new_files.push(input.path.clone());
            continue;
        };
        let recorded = image.sidecar.inputs[index].mod_time;
        if input.mod_time > recorded {
            info!(path = %input.path, "incremental: changed file");
            decision.changed.push(input.path.clone());
            continue;
        }
        decision.unchanged.push(input.path.clone());
    }
    decision
}
