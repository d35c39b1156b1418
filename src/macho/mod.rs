//! Mach-O file format handling.
//!
//! On-disk structures and constants for the subset of Mach-O this crate
//! reads and rewrites: headers, segments/sections, symbol tables, dyld info,
//! dylib references, and the incremental sidecar load command.

mod constants;
mod structs;

pub use constants::*;
pub use structs::*;
