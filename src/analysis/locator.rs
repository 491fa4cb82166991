//! Locates the five decryptors protecting the engine's name and object fields and recovers them.
//!
//! All of them are found relative to two byte signatures:
//! - the *anchor*, a `test r8, r8; setnz al; test al, al` sequence sitting right before a
//!   conditional branch. The fall-through path decrypts the index and number of a name, storing
//!   them to adjacent stack slots. The branch target decrypts the outer and class pointers of an
//!   object, one after the other, each ending with its third `XOR`.
//! - the *object index* signature, a call whose result is stored and null-checked before the
//!   object's encrypted index is loaded and decrypted, again ending with the third `XOR`.

use iced_x86::{FlowControl, Instruction, Mnemonic, OpKind};

use super::{
    Decryptor, Decryptor32, Decryptor64, ImageView, InstructionSource, KeyWidth, Location,
    Signature, SliceError, SynthesisError, TraceWindow, analyze, synthesize,
};

macro_rules! signature {
    (@byte ?) => {
        None
    };
    (@byte $b:literal) => {
        Some($b)
    };
    ($($byte:tt)+) => {
        Signature::from_pattern(vec![$(signature!(@byte $byte)),+])
    };
}

/// Default anchor signature: `test r8, r8; setnz al; test al, al`.
pub fn default_anchor_signature() -> Signature {
    signature!(0x4D 0x85 0xC0 0x0F 0x95 0xC0 0x84 0xC0)
}

/// Default object index signature: `call ?; mov [rdi+?], rax; test rax, rax; jz ?; mov eax, [rax+?]`.
pub fn default_object_index_signature() -> Signature {
    signature!(
        0xE8 ? ? ? ? 0x48 0x89 0x87 ? ? ? ? 0x48 0x85 0xC0 0x0F 0x84 ? ? ? ? 0x8B 0x40
    )
}

/// Error encountered while extracting a single decryptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// No instruction of the kind `what` was found within the search window after `start`.
    InstructionNotFound { start: u64, what: &'static str },
    /// The instruction at this address does not have the expected operand kind.
    UnexpectedOperand(u64),
    Slice(SliceError),
    Synthesis(SynthesisError),
}

impl From<SliceError> for ExtractionError {
    fn from(value: SliceError) -> Self {
        Self::Slice(value)
    }
}

impl From<SynthesisError> for ExtractionError {
    fn from(value: SynthesisError) -> Self {
        Self::Synthesis(value)
    }
}

impl std::fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstructionNotFound { start, what } => {
                write!(f, "no {what} found after {start:x}")
            }
            Self::UnexpectedOperand(va) => {
                write!(f, "instruction at {va:x} has an unexpected destination operand")
            }
            Self::Slice(e) => write!(f, "slicing failed: {e}"),
            Self::Synthesis(e) => write!(f, "synthesis failed: {e}"),
        }
    }
}

impl std::error::Error for ExtractionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Slice(e) => Some(e),
            Self::Synthesis(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned by [`DecryptorScanner::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The anchor signature does not appear in the image.
    AnchorNotFound,
    /// None of the anchor signature matches led to the name and object pointer decryptors.
    NoCandidateMatched { tried: usize },
    /// The object index signature does not appear in the image.
    ObjectIndexSignatureNotFound,
    /// The object index decryptor could not be extracted.
    ObjectIndex(ExtractionError),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnchorNotFound => write!(f, "decryptor anchor signature not found"),
            Self::NoCandidateMatched { tried } => {
                write!(f, "none of the {tried} anchor matches led to valid decryptors")
            }
            Self::ObjectIndexSignatureNotFound => {
                write!(f, "object index signature not found")
            }
            Self::ObjectIndex(e) => write!(f, "object index decryptor: {e}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ObjectIndex(e) => Some(e),
            _ => None,
        }
    }
}

/// The five decryptors recovered by [`DecryptorScanner::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptorSet {
    pub fname_index: Decryptor32,
    pub fname_number: Decryptor32,
    pub object_index: Decryptor32,
    pub object_class: Decryptor64,
    pub object_outer: Decryptor64,
}

impl std::fmt::Display for DecryptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fname_index.is_valid() && self.fname_number.is_valid() {
            writeln!(f, "FName index decryptor:\n{}", self.fname_index)?;
            writeln!(f, "FName number decryptor:\n{}", self.fname_number)?;
        }
        if self.object_index.is_valid()
            && self.object_class.is_valid()
            && self.object_outer.is_valid()
        {
            writeln!(f, "Object index decryptor:\n{}", self.object_index)?;
            writeln!(f, "Object class decryptor:\n{}", self.object_class)?;
            writeln!(f, "Object outer decryptor:\n{}", self.object_outer)?;
        }
        Ok(())
    }
}

struct AnchorDecryptors {
    fname_index: Decryptor32,
    fname_number: Decryptor32,
    object_class: Decryptor64,
    object_outer: Decryptor64,
}

/// Decode linearly from `start` and return the first instruction before `end` satisfying `pred`.
///
/// The search stops silently at the first address that cannot be decoded.
pub fn find_instruction(
    source: &impl InstructionSource,
    start: u64,
    end: u64,
    mut pred: impl FnMut(&Instruction) -> bool,
) -> Option<Instruction> {
    let mut va = start;
    while va < end {
        let instr = source.decode_at(va)?;
        if pred(&instr) {
            return Some(instr);
        }
        va = instr.next_ip();
    }
    None
}

/// Returns `true` for binary arithmetic mnemonics (additions, subtractions, comparisons,
/// multiplications and divisions).
pub fn is_binary_arithmetic(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Add
            | Mnemonic::Adc
            | Mnemonic::Adcx
            | Mnemonic::Adox
            | Mnemonic::Sub
            | Mnemonic::Sbb
            | Mnemonic::Cmp
            | Mnemonic::Inc
            | Mnemonic::Dec
            | Mnemonic::Neg
            | Mnemonic::Mul
            | Mnemonic::Imul
            | Mnemonic::Div
            | Mnemonic::Idiv
            | Mnemonic::Xadd
    )
}

/// Finds and recovers the decryptors of an executable image, producing a [`DecryptorSet`] on
/// success.
#[derive(Debug, Clone)]
pub struct DecryptorScanner {
    window_size: u64,
    xor_chain_len: usize,
    anchor: Signature,
    object_index_signature: Signature,
    trace_slices: bool,
}

impl Default for DecryptorScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl DecryptorScanner {
    /// Create a new [`DecryptorScanner`] with the default configuration.
    pub fn new() -> Self {
        Self {
            window_size: 0x100,
            xor_chain_len: 3,
            anchor: default_anchor_signature(),
            object_index_signature: default_object_index_signature(),
            trace_slices: false,
        }
    }

    /// Set the maximum distance in bytes from the start of a search to the instruction it looks
    /// for.
    ///
    /// The default value is 0x100.
    pub fn window_size(self, window_size: u64) -> Self {
        Self {
            window_size,
            ..self
        }
    }

    /// Set the number of `XOR` instructions after which a pointer or object index decryptor is
    /// considered complete.
    ///
    /// The default value is 3.
    pub fn xor_chain_len(self, xor_chain_len: usize) -> Self {
        Self {
            xor_chain_len,
            ..self
        }
    }

    /// Set the signature preceding the name and object pointer decryptors.
    pub fn anchor_signature(self, anchor: Signature) -> Self {
        Self { anchor, ..self }
    }

    /// Set the signature preceding the object index decryptor.
    pub fn object_index_signature(self, object_index_signature: Signature) -> Self {
        Self {
            object_index_signature,
            ..self
        }
    }

    /// Log the annotated listing of every analyzed window with trace level.
    pub fn trace_slices(self, trace_slices: bool) -> Self {
        Self {
            trace_slices,
            ..self
        }
    }

    /// Recover the decryptor computing the final value of `target` over the instructions from
    /// `start` up to and including the one at `end`.
    pub fn extract<T: KeyWidth>(
        &self,
        source: &impl InstructionSource,
        start: u64,
        end: u64,
        target: Location,
    ) -> Result<Decryptor<T>, ExtractionError> {
        let mut window = TraceWindow::build(source, start, end);
        let slice = analyze(&mut window, target);

        if self.trace_slices {
            log::trace!("slice of {target} in {start:x}..={end:x}:\n{}", window.listing());
        }

        let decryptor = synthesize::<T>(&slice?)?;
        log::debug!("recovered {}-bit decryptor at {start:x}: {decryptor:x?}", T::BITS);
        Ok(decryptor)
    }

    /// Find the last `XOR` of the chain starting after the instruction at `start`.
    fn xor_chain_end(
        &self,
        source: &impl InstructionSource,
        start: u64,
    ) -> Result<Instruction, ExtractionError> {
        let not_found = |what| ExtractionError::InstructionNotFound { start, what };

        let limit = start.saturating_add(self.window_size);
        let mut end = source.decode_at(start).ok_or(not_found("instruction"))?;
        for _ in 0..self.xor_chain_len {
            end = find_instruction(source, end.next_ip(), limit, |i| {
                i.mnemonic() == Mnemonic::Xor
            })
            .ok_or(not_found("xor"))?;
        }
        Ok(end)
    }

    /// Recover the name index and number decryptors, given the address of the conditional branch
    /// following the anchor.
    pub fn fname_decryptors(
        &self,
        source: &impl InstructionSource,
        branch_va: u64,
    ) -> Result<(Decryptor32, Decryptor32), ExtractionError> {
        let limit = branch_va.saturating_add(self.window_size);
        let store = find_instruction(source, branch_va, limit, |i| {
            is_binary_arithmetic(i.mnemonic())
        })
        .ok_or(ExtractionError::InstructionNotFound {
            start: branch_va,
            what: "binary arithmetic instruction",
        })?;

        if store.op0_kind() != OpKind::Memory {
            return Err(ExtractionError::UnexpectedOperand(store.ip()));
        }
        let base = store.memory_base();
        let displacement = store.memory_displacement64() as i64;

        let index = self.extract::<i32>(
            source,
            branch_va,
            store.ip(),
            Location::Memory {
                base,
                displacement,
                size: 4,
            },
        )?;
        let number = self.extract::<i32>(
            source,
            branch_va,
            store.ip(),
            Location::Memory {
                base,
                displacement: displacement.wrapping_add(4),
                size: 4,
            },
        )?;
        Ok((index, number))
    }

    /// Recover the object class and outer pointer decryptors, in that order, given the address of
    /// the first instruction of the outer pointer decryptor.
    pub fn class_outer_decryptors(
        &self,
        source: &impl InstructionSource,
        start: u64,
    ) -> Result<(Decryptor64, Decryptor64), ExtractionError> {
        let outer_end = self.xor_chain_end(source, start)?;
        let outer_target = Location::of_operand(&outer_end, 0)
            .ok_or(ExtractionError::UnexpectedOperand(outer_end.ip()))?;
        let outer = self.extract::<i64>(source, start, outer_end.ip(), outer_target)?;

        let class_start = outer_end.ip();
        let class_end = self.xor_chain_end(source, class_start)?;
        let class_target = Location::of_operand(&class_end, 0)
            .ok_or(ExtractionError::UnexpectedOperand(class_end.ip()))?;
        let class = self.extract::<i64>(source, class_start, class_end.ip(), class_target)?;

        Ok((class, outer))
    }

    /// Recover the object index decryptor, given the address of the object index signature.
    pub fn object_index_decryptor(
        &self,
        source: &impl InstructionSource,
        start: u64,
    ) -> Result<Decryptor32, ExtractionError> {
        let end = self.xor_chain_end(source, start)?;
        let target =
            Location::of_operand(&end, 0).ok_or(ExtractionError::UnexpectedOperand(end.ip()))?;
        self.extract::<i32>(source, start, end.ip(), target)
    }

    fn anchor_decryptors(
        &self,
        source: &impl InstructionSource,
        anchor_va: u64,
    ) -> Result<AnchorDecryptors, ExtractionError> {
        let limit = anchor_va.saturating_add(self.window_size);
        let branch = find_instruction(source, anchor_va, limit, |i| {
            i.flow_control() == FlowControl::ConditionalBranch
        })
        .ok_or(ExtractionError::InstructionNotFound {
            start: anchor_va,
            what: "conditional branch",
        })?;

        let (fname_index, fname_number) = self.fname_decryptors(source, branch.ip())?;
        let (object_class, object_outer) =
            self.class_outer_decryptors(source, branch.near_branch_target())?;

        Ok(AnchorDecryptors {
            fname_index,
            fname_number,
            object_class,
            object_outer,
        })
    }

    /// Scan the executable image `image` for all five decryptors.
    ///
    /// Every match of the anchor signature is tried in address order until one leads to both the
    /// name and object pointer decryptors.
    pub fn scan<
        #[cfg(feature = "rayon")] I: ImageView + Sync,
        #[cfg(not(feature = "rayon"))] I: ImageView,
    >(
        &self,
        image: &I,
    ) -> Result<DecryptorSet, ScanError> {
        let anchor_vas = self.anchor.find_in_image(image);
        log::debug!("found {} decryptor anchor candidates", anchor_vas.len());
        if anchor_vas.is_empty() {
            return Err(ScanError::AnchorNotFound);
        }

        let try_anchor = |&va: &u64| match self.anchor_decryptors(image, va) {
            Ok(found) => Some(found),
            Err(e) => {
                log::debug!("anchor {va:x} rejected: {e}");
                None
            }
        };

        #[cfg(feature = "rayon")]
        let found = {
            use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
            anchor_vas.par_iter().find_map_first(try_anchor)
        };
        #[cfg(not(feature = "rayon"))]
        let found = anchor_vas.iter().find_map(try_anchor);

        let found = found.ok_or(ScanError::NoCandidateMatched {
            tried: anchor_vas.len(),
        })?;

        let object_index_va = *self
            .object_index_signature
            .find_in_image(image)
            .first()
            .ok_or(ScanError::ObjectIndexSignatureNotFound)?;
        let object_index =
            self.object_index_decryptor(image, object_index_va).map_err(ScanError::ObjectIndex)?;

        Ok(DecryptorSet {
            fname_index: found.fname_index,
            fname_number: found.fname_number,
            object_index,
            object_class: found.object_class,
            object_outer: found.object_outer,
        })
    }
}
