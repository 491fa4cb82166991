//! Decoding of straight-line instruction windows into write-snapshot traces.
//!
//! Every [`InstructionTrace`] records, for each [`Location`] written so far in the window, the
//! index of the instruction that wrote it last, *including* the writes performed by the traced
//! instruction itself. Snapshots are copied forward from one instruction to the next and are never
//! modified afterwards, so the state of the window before any instruction stays queryable while
//! the slicer walks backwards through it.

use fxhash::FxBuildHasher;
use iced_x86::{FastFormatter, Instruction, InstructionInfoFactory, OpAccess};
use indexmap::IndexMap;
use smallvec::SmallVec;

use super::{InstructionSource, Location};

/// Maps a location to the index of the instruction in the window that last wrote it.
pub type WriteSnapshot = IndexMap<Location, usize, FxBuildHasher>;

/// Returns `true` if the operand access reads the operand, possibly conditionally.
pub(crate) fn reads(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// Returns `true` if the operand access writes the operand, possibly conditionally.
pub(crate) fn writes(access: OpAccess) -> bool {
    matches!(
        access,
        OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
    )
}

/// An explicit instruction operand, reduced to what the data-flow analysis needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracedOperand {
    /// The storage the operand refers to, if it is a register or memory operand.
    pub location: Option<Location>,
    /// How the instruction accesses the operand.
    pub access: OpAccess,
}

/// How an instruction should be presented in an annotated listing of its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// Part of the slice.
    Needed,
    /// Part of the slice, and reads a value originating outside the window.
    Unknown,
    /// Not part of the slice.
    Irrelevant,
}

impl RenderState {
    /// Single character marker used by [`TraceWindow::listing`].
    pub fn marker(self) -> char {
        match self {
            Self::Needed => '+',
            Self::Unknown => '?',
            Self::Irrelevant => ' ',
        }
    }
}

/// A decoded instruction together with its write-snapshot and slicing marks.
#[derive(Debug, Clone)]
pub struct InstructionTrace {
    instruction: Instruction,
    operands: SmallVec<[TracedOperand; 4]>,
    last_written: WriteSnapshot,
    pub(crate) needed: bool,
    pub(crate) unknown_value: bool,
}

impl InstructionTrace {
    /// The decoded instruction.
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    /// The explicit operands of the instruction, in operand-list order.
    pub fn operands(&self) -> &[TracedOperand] {
        &self.operands
    }

    /// The write-snapshot of the window after this instruction executed.
    pub fn snapshot(&self) -> &WriteSnapshot {
        &self.last_written
    }

    /// Whether the last slice computed over the window contains this instruction.
    pub fn is_needed(&self) -> bool {
        self.needed
    }

    /// Whether this instruction reads a value that was not written inside the window.
    pub fn has_unknown_value(&self) -> bool {
        self.unknown_value
    }

    /// How the instruction is presented in [`TraceWindow::listing`], according to the last slice.
    ///
    /// An instruction reading a value from outside the window is [`RenderState::Unknown`] even
    /// though it is also needed.
    pub fn render_state(&self) -> RenderState {
        if self.unknown_value {
            RenderState::Unknown
        }
        else if self.needed {
            RenderState::Needed
        }
        else {
            RenderState::Irrelevant
        }
    }

    /// Find the index of the instruction that last wrote `location`, as of this instruction.
    ///
    /// An exact match of the location is tried first. Failing that, all snapshot entries that
    /// overlap `location` are considered and the most recent writer among them is returned.
    pub fn last_writer(&self, location: &Location) -> Option<usize> {
        if let Some(&index) = self.last_written.get(location) {
            return Some(index);
        }
        self.last_written
            .iter()
            .filter(|(written, _)| written.same_location(location))
            .map(|(_, &index)| index)
            .max()
    }
}

/// An ordered window of [`InstructionTrace`]s over straight-line code.
#[derive(Debug, Clone, Default)]
pub struct TraceWindow {
    pub(crate) traces: Vec<InstructionTrace>,
}

impl TraceWindow {
    /// Decode the instructions from `start` up to and including the instruction at `end`.
    ///
    /// `end` is the address of the *last* instruction to include, not an exclusive byte bound.
    /// Decoding stops silently at the first failure, so the window may be shorter than requested.
    pub fn build(source: &impl InstructionSource, start: u64, end: u64) -> Self {
        let mut window = Self::default();
        let mut info_factory = InstructionInfoFactory::new();

        let mut va = start;
        while va <= end {
            let Some(instr) = source.decode_at(va)
            else {
                log::trace!("decoding stopped at {va:x}, window truncated");
                break;
            };
            window.push_with(instr, &mut info_factory);

            match va.checked_add(instr.len() as u64) {
                Some(next) if next > va => va = next,
                _ => break,
            }
        }
        window
    }

    /// Build a window from already-decoded instructions.
    pub fn from_instructions(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        let mut window = Self::default();
        let mut info_factory = InstructionInfoFactory::new();
        for instr in instructions {
            window.push_with(instr, &mut info_factory);
        }
        window
    }

    /// Append an instruction to the window, computing its write-snapshot.
    pub fn push(&mut self, instruction: Instruction) {
        self.push_with(instruction, &mut InstructionInfoFactory::new());
    }

    fn push_with(&mut self, instruction: Instruction, info_factory: &mut InstructionInfoFactory) {
        let info = info_factory.info(&instruction);
        let operands: SmallVec<[TracedOperand; 4]> = (0..instruction.op_count())
            .map(|op| TracedOperand {
                location: Location::of_operand(&instruction, op),
                access: info.op_access(op),
            })
            .collect();

        let index = self.traces.len();
        let mut last_written = self.traces.last().map(|t| t.last_written.clone()).unwrap_or_default();
        for operand in operands.iter().filter(|o| writes(o.access)) {
            if let Some(location) = operand.location {
                last_written.insert(location, index);
            }
        }

        self.traces.push(InstructionTrace {
            instruction,
            operands,
            last_written,
            needed: false,
            unknown_value: false,
        });
    }

    pub fn traces(&self) -> &[InstructionTrace] {
        &self.traces
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Iterate over the instructions of the last computed slice, in program order.
    pub fn needed(&self) -> impl Iterator<Item = &InstructionTrace> {
        self.traces.iter().filter(|t| t.needed)
    }

    /// Clear the marks left by a previous slice.
    pub fn clear_marks(&mut self) {
        for trace in &mut self.traces {
            trace.needed = false;
            trace.unknown_value = false;
        }
    }

    /// Render the window as an annotated listing, one instruction per line, prefixed by the
    /// [`RenderState::marker`] of each instruction.
    pub fn listing(&self) -> String {
        let mut formatter = FastFormatter::new();
        let mut listing = String::new();
        let mut disasm = String::new();

        for trace in &self.traces {
            disasm.clear();
            formatter.format(&trace.instruction, &mut disasm);
            listing += &format!(
                "{} {:x}\t{disasm}\n",
                trace.render_state().marker(),
                trace.instruction.ip()
            );
        }
        listing
    }
}
