//! Recovery of the value decryptors found in a memory dump.
//!
//! The pipeline goes from code to decryptor parameters in three steps:
//! 1. [`TraceWindow::build`] decodes a window of instructions and records, for each of them, the
//!    most recent writer of every location written so far;
//! 2. [`analyze`] slices the window backwards from a target location, keeping only the
//!    instructions contributing to its final value and finding the location the encrypted value
//!    was loaded from;
//! 3. [`synthesize`] reads the keys, rotation and shift amounts and source offset off the slice.
//!
//! [`DecryptorScanner`] drives the pipeline over a whole image, locating each window with byte
//! signatures.

pub mod decryptor;
pub mod image;
pub mod locator;
pub mod location;
pub mod signature;
pub mod slicer;
pub mod trace;

#[cfg(test)]
mod test;

pub use decryptor::{Decryptor, Decryptor32, Decryptor64, KeyWidth, SynthesisError, synthesize};
pub use image::{ImageView, InstructionSource, WithBase};
pub use locator::{DecryptorScanner, DecryptorSet, ExtractionError, ScanError};
pub use location::Location;
pub use signature::{Signature, SignatureError};
pub use slicer::{Slice, SliceError, analyze};
pub use trace::{InstructionTrace, RenderState, TraceWindow, WriteSnapshot};
