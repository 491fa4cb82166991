#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod analysis;

/// Re-export of the `iced_x86` crate.
pub use iced_x86;
/// Re-export of the `pelite` crate.
pub use pelite;
