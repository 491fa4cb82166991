//! Views over a dumped executable image, and decoding instructions out of them.
//!
//! A dump is either a mapped PE image, in which case only its executable sections are searched,
//! or a flat buffer of bytes that were read starting at a known virtual address ([`WithBase`]).

use iced_x86::{Decoder, DecoderOptions, Instruction};
use pelite::{
    image::IMAGE_SCN_MEM_EXECUTE,
    pe64::{Pe, PeView},
};

/// Immutable view over the dumped bytes of an executable image.
pub trait ImageView {
    /// The virtual address the image was dumped from.
    fn base_va(&self) -> u64;

    /// Iterate over the regions that may contain code, as their start virtual address and bytes.
    fn code_regions(&self) -> impl Iterator<Item = (u64, &[u8])>;

    /// The bytes from `va` up to the end of the region containing it, or [`None`] if `va` is not
    /// part of the dump.
    fn bytes_at(&self, va: u64) -> Option<&[u8]>;
}

impl ImageView for PeView<'_> {
    fn base_va(&self) -> u64 {
        Pe::optional_header(*self).ImageBase
    }

    fn code_regions(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.section_headers()
            .iter()
            .filter(|s| s.Characteristics & IMAGE_SCN_MEM_EXECUTE != 0)
            .filter_map(|s| {
                let bytes = self.get_section_bytes(s).ok()?;
                Some((self.base_va() + s.VirtualAddress as u64, bytes))
            })
    }

    fn bytes_at(&self, va: u64) -> Option<&[u8]> {
        Pe::read(self, va, 1, 1).ok()
    }
}

/// A flat dump: a single run of bytes read starting at virtual address `base`.
///
/// Used for raw memory dumps that do not parse as a mapped PE image. The whole buffer is treated
/// as code.
#[derive(Debug, Clone, Copy)]
pub struct WithBase<T: AsRef<[u8]>> {
    bytes: T,
    base: u64,
}

impl<T: AsRef<[u8]>> WithBase<T> {
    /// Wrap the dumped `bytes`, the first of which lives at virtual address `base`.
    pub fn new(bytes: T, base: u64) -> Self {
        Self { bytes, base }
    }

    /// The virtual address one past the last dumped byte, saturating at [`u64::MAX`].
    pub fn end_va(&self) -> u64 {
        self.base.saturating_add(self.bytes.as_ref().len() as u64)
    }
}

impl<T: AsRef<[u8]>> ImageView for WithBase<T> {
    fn base_va(&self) -> u64 {
        self.base
    }

    fn code_regions(&self) -> impl Iterator<Item = (u64, &[u8])> {
        std::iter::once((self.base, self.bytes.as_ref()))
    }

    fn bytes_at(&self, va: u64) -> Option<&[u8]> {
        let offset = usize::try_from(va.checked_sub(self.base)?).ok()?;
        self.bytes.as_ref().get(offset..).filter(|b| !b.is_empty())
    }
}

/// A deterministic, side-effect-free source of decoded instructions.
pub trait InstructionSource {
    /// Decode the instruction at virtual address `va`.
    ///
    /// Returns [`None`] if the bytes at `va` are unreadable or do not form a valid instruction.
    fn decode_at(&self, va: u64) -> Option<Instruction>;
}

impl<I: ImageView> InstructionSource for I {
    fn decode_at(&self, va: u64) -> Option<Instruction> {
        let bytes = self.bytes_at(va)?;
        let instr = Decoder::with_ip(64, bytes, va, DecoderOptions::NONE).decode();
        (!instr.is_invalid()).then_some(instr)
    }
}
