//! Error types for the incremental-link core.
//!
//! Every failure the core can hit maps onto one variant of [`Error`]. Most of
//! them abort the incremental path but are recoverable at the driver level by
//! falling back to a full link; [`Error::requires_full_link`] encodes that
//! classification.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for incremental-link operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Structural Errors ====================
    #[error("malformed image at offset {offset:#x}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("architecture mismatch: expected {expected}, found cputype {found:#x}")]
    ArchMismatch { expected: &'static str, found: u32 },

    #[error("unsupported image: {reason}")]
    UnsupportedImage { reason: String },

    // ==================== Incremental Decisions ====================
    /// The image carries no LC_INCREMENTAL command. Not a defect in the
    /// image; the caller must run a full link.
    #[error("image has no incremental sidecar")]
    SidecarMissing,

    /// The sidecar is valid but the reserved patch window of a section
    /// cannot absorb the new content. The caller must run a full link.
    #[error("patch space exhausted in section '{section}'")]
    IncrementalImpossible { section: String },

    /// A write operation was issued outside the session state that permits
    /// it.
    #[error("invalid session state: {reason}")]
    InvalidState { reason: &'static str },
}

/// A specialized Result type for incremental-link operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if the driver should retry this link as a full link.
    ///
    /// Everything except plain I/O failure falls in this class: a malformed
    /// or foreign image, a missing sidecar, and exhausted patch space all
    /// leave the from-scratch path available.
    #[inline]
    pub fn requires_full_link(&self) -> bool {
        !matches!(self, Error::Io { .. })
    }

    /// Creates a malformed-image error with a formatted reason.
    #[inline]
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-image error.
    #[inline]
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Error::UnsupportedImage {
            reason: reason.into(),
        }
    }

    /// Creates an I/O error tagged with the path it occurred on.
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a patch-space-exhaustion decision for the named section.
    #[inline]
    pub fn impossible(section: impl Into<String>) -> Self {
        Error::IncrementalImpossible {
            section: section.into(),
        }
    }
}
