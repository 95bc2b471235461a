//! percival: a raw PE image analyzer.
//!
//! Given the on-disk bytes of a PE file and the base address at which the
//! OS loader mapped it, reconstruct the module's static structure
//! (sections, data directories, exports with cross-module forwarding,
//! standard/delayed/bound imports, TLS callbacks, base relocations,
//! entry points), queryable by virtual address. API-set name redirection
//! is normalized throughout, and relocation deltas are applied to the
//! in-memory copy so pointer tables read correctly at the runtime base.
//!
//! Parsing is partial-tolerant: a corrupt directory is logged and
//! abandoned without failing the rest of the image.
#![allow(clippy::upper_case_acronyms)]

pub mod addr;
pub mod apiset;
pub mod aspace;
pub mod pe;
pub mod registry;
pub mod symbols;
pub mod util;

#[cfg(any(test, doctest, feature = "test"))]
pub mod testutil;

pub use addr::{Raw, Rva, Va};

/// Analyzer knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// scan the whole file image for string literals.
    pub load_strings:      bool,
    /// minimum run length (in characters) for a string literal.
    pub string_min_length: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            load_strings:      true,
            string_min_length: 4,
        }
    }
}
