//! Storage locations tracked by the data-flow analysis.

use iced_x86::{Instruction, OpKind, Register};

/// A storage unit whose writers and readers are tracked across an instruction window.
///
/// The derived [`PartialEq`] and [`Hash`] implementations are *structural* and are what snapshot
/// maps are keyed on. Aliasing between distinct memory locations is handled separately by
/// [`Location::same_location`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// A register, compared by its exact identifier.
    Register(Register),
    /// The byte range `[displacement, displacement + size)` relative to the value of `base`.
    Memory {
        base: Register,
        displacement: i64,
        size: u8,
    },
}

impl Location {
    /// Resolve the location referenced by operand `op` of `instr`.
    ///
    /// Only register and memory operands have a location. Memory operands are keyed on their base
    /// register and displacement alone; index registers and scales are ignored.
    pub fn of_operand(instr: &Instruction, op: u32) -> Option<Self> {
        match instr.op_kind(op) {
            OpKind::Register => Some(Self::Register(instr.op_register(op))),
            OpKind::Memory => Some(Self::Memory {
                base: instr.memory_base(),
                displacement: instr.memory_displacement64() as i64,
                size: instr.memory_size().size() as u8,
            }),
            _ => None,
        }
    }

    /// Returns `true` if `self` and `other` may refer to the same storage.
    ///
    /// Registers are the same location if their identifiers are equal. Memory locations are the
    /// same location if they share a base register and their byte ranges intersect. A register
    /// is never the same location as a memory range.
    ///
    /// This relation is symmetric but not transitive.
    pub fn same_location(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Register(a), Self::Register(b)) => a == b,
            (
                Self::Memory {
                    base: a_base,
                    displacement: a_disp,
                    size: a_size,
                },
                Self::Memory {
                    base: b_base,
                    displacement: b_disp,
                    size: b_size,
                },
            ) => {
                a_base == b_base
                    && a_disp.wrapping_add(*a_size as i64) > *b_disp
                    && b_disp.wrapping_add(*b_size as i64) > *a_disp
            }
            _ => false,
        }
    }

    /// Returns `true` for [`Location::Memory`].
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory { .. })
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(r) => write!(f, "{r:?}"),
            Self::Memory {
                base,
                displacement,
                size,
            } => {
                let sign = if *displacement < 0 { '-' } else { '+' };
                write!(
                    f,
                    "[{base:?} {sign} 0x{:x}] ({size} bytes)",
                    displacement.unsigned_abs()
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::Register;

    use super::Location;

    fn mem(base: Register, displacement: i64, size: u8) -> Location {
        Location::Memory {
            base,
            displacement,
            size,
        }
    }

    #[test]
    fn overlapping_ranges_are_the_same_location() {
        let a = mem(Register::RCX, 0, 4);
        let b = mem(Register::RCX, 2, 4);
        assert!(a.same_location(&b));
        assert!(b.same_location(&a));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let a = mem(Register::RCX, 0, 4);
        let b = mem(Register::RCX, 4, 4);
        assert!(!a.same_location(&b));
        assert!(!b.same_location(&a));
    }

    #[test]
    fn contained_range_overlaps() {
        let dword = mem(Register::RSP, 0x20, 4);
        let byte = mem(Register::RSP, 0x23, 1);
        assert!(dword.same_location(&byte));
        assert!(byte.same_location(&dword));
        assert!(!byte.same_location(&mem(Register::RSP, 0x24, 1)));
    }

    #[test]
    fn different_bases_never_overlap() {
        let a = mem(Register::RCX, 0x10, 8);
        let b = mem(Register::RDX, 0x10, 8);
        assert!(!a.same_location(&b));
    }

    #[test]
    fn overlap_is_not_transitive() {
        let a = mem(Register::RBX, 0, 4);
        let b = mem(Register::RBX, 3, 4);
        let c = mem(Register::RBX, 6, 4);
        assert!(a.same_location(&b));
        assert!(b.same_location(&c));
        assert!(!a.same_location(&c));
    }

    #[test]
    fn registers_compare_by_id() {
        let eax = Location::Register(Register::EAX);
        assert!(eax.same_location(&Location::Register(Register::EAX)));
        assert!(!eax.same_location(&Location::Register(Register::RAX)));
        assert!(!eax.same_location(&mem(Register::EAX, 0, 4)));
        assert!(!mem(Register::EAX, 0, 4).same_location(&eax));
    }

    #[test]
    fn display() {
        assert_eq!(mem(Register::RCX, 0x10, 4).to_string(), "[RCX + 0x10] (4 bytes)");
        assert_eq!(mem(Register::RBP, -8, 8).to_string(), "[RBP - 0x8] (8 bytes)");
        assert_eq!(Location::Register(Register::R8D).to_string(), "R8D");
    }
}
