//! Backward data-flow slicing over a [`TraceWindow`].
//!
//! Starting from the last writer of a target location, the slicer recursively marks every
//! instruction whose output is read by an already marked instruction. Reads that have no writer
//! inside the window are the points where values enter the computation from outside of it: for a
//! decryptor, this should be exactly one location, the encrypted value.

use iced_x86::Instruction;

use super::{
    Location, TraceWindow,
    trace::{InstructionTrace, reads},
};

/// Error returned by [`analyze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceError {
    /// The target location is never written inside the window.
    UnresolvedTarget(Location),
    /// The target's value is fully determined by instructions inside the window.
    NoExternalOrigin,
    /// The target depends on several external locations that do not alias each other.
    InconsistentUnknowns(Vec<Location>),
}

impl std::fmt::Display for SliceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedTarget(loc) => write!(f, "{loc} is never written in the window"),
            Self::NoExternalOrigin => write!(f, "value does not depend on any external location"),
            Self::InconsistentUnknowns(locs) => {
                write!(f, "value depends on multiple unrelated external locations:")?;
                for loc in locs {
                    write!(f, " {loc}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for SliceError {}

/// The minimal ordered set of instructions producing a value, and where that value comes from.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Indices of the sliced instructions in their [`TraceWindow`], in program order.
    pub indices: Vec<usize>,
    /// The sliced instructions, in program order.
    pub instructions: Vec<Instruction>,
    /// The single location read from outside the window.
    pub external: Location,
}

struct Slicer<'a> {
    traces: &'a mut [InstructionTrace],
    unknowns: Vec<Location>,
    /// Number of calls to `mark_needed`, including memoized ones.
    #[cfg(test)]
    visits: usize,
}

impl<'a> Slicer<'a> {
    fn new(traces: &'a mut [InstructionTrace]) -> Self {
        Self {
            traces,
            unknowns: Vec::new(),
            #[cfg(test)]
            visits: 0,
        }
    }

    /// Mark instruction `index` and, recursively, the writers of everything it reads.
    ///
    /// Recursion only ever goes to strictly smaller indices or stops on an already marked
    /// instruction, so it is bounded by the window length.
    fn mark_needed(&mut self, index: usize) {
        #[cfg(test)]
        {
            self.visits += 1;
        }

        let trace = &mut self.traces[index];
        if trace.needed {
            return;
        }
        trace.needed = true;

        let read_locations: Vec<Location> = trace
            .operands()
            .iter()
            .filter(|op| reads(op.access))
            .filter_map(|op| op.location)
            .collect();

        for location in read_locations {
            match self.traces[index].last_writer(&location) {
                None => self.mark_unknown(index, location),
                Some(0) if index == 0 => self.mark_unknown(index, location),
                // Read-modify-write: the snapshot names this instruction, so the value read is
                // the one from before it.
                Some(writer) if writer == index => {
                    if let Some(prev) = self.traces[index - 1].last_writer(&location) {
                        self.mark_needed(prev);
                    }
                }
                Some(writer) => self.mark_needed(writer),
            }
        }
    }

    fn mark_unknown(&mut self, index: usize, location: Location) {
        self.unknowns.push(location);
        self.traces[index].unknown_value = true;
    }
}

/// Compute the backward slice of `target`'s final value over `window`.
///
/// The target is looked up in the snapshot of the last instruction of the window. Marks left by
/// a previous call are cleared first; after this returns, the window's traces describe this slice
/// (see [`InstructionTrace::render_state`]) whether or not it succeeded.
pub fn analyze(window: &mut TraceWindow, target: Location) -> Result<Slice, SliceError> {
    window.clear_marks();

    let writer = window
        .traces
        .last()
        .and_then(|t| t.last_writer(&target))
        .ok_or(SliceError::UnresolvedTarget(target))?;

    let mut slicer = Slicer::new(&mut window.traces);
    slicer.mark_needed(writer);

    let mut unknowns: Vec<Location> = Vec::with_capacity(slicer.unknowns.len());
    for loc in slicer.unknowns {
        if !unknowns.contains(&loc) {
            unknowns.push(loc);
        }
    }

    let external = *unknowns.first().ok_or(SliceError::NoExternalOrigin)?;
    let consistent = unknowns
        .iter()
        .enumerate()
        .all(|(i, a)| unknowns[i + 1..].iter().all(|b| a.same_location(b)));
    if !consistent {
        log::warn!("slice of {target} reads multiple unrelated external locations: {unknowns:?}");
        return Err(SliceError::InconsistentUnknowns(unknowns));
    }

    let (indices, instructions): (Vec<usize>, Vec<Instruction>) = window
        .traces
        .iter()
        .enumerate()
        .filter(|(_, t)| t.needed)
        .map(|(i, t)| (i, *t.instruction()))
        .unzip();

    Ok(Slice {
        indices,
        instructions,
        external,
    })
}
