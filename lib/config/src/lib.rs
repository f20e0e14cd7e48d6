//! Build-time configuration for the device framework.
//!
//! Every constant is generated from the `flags.json` file at the workspace
//! root. A board selects its section through the target architecture; hosts
//! and unlisted targets fall back to the `default` section.

#![no_std]
#![deny(missing_docs)]

/// Generated board flags.
#[allow(missing_docs)]
pub mod build_flags {
    include!(concat!(env!("OUT_DIR"), "/build_flags.rs"));
}

pub use build_flags::*;
