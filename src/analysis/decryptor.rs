//! Fixed-shape rotate/XOR/shift decryptors and their synthesis from instruction slices.
//!
//! The protected values are stored encrypted and decrypted inline with a short sequence of
//! instructions of the form
//!
//! ```text
//! r = rotate(encrypted ^ xor_key[0], rotate_amount)
//! decrypted = r ^ (r << shift_amount) ^ xor_key[1]
//! ```
//!
//! For 32-bit values the keys appear as `XOR reg, imm32` immediates. 64-bit keys cannot be encoded
//! as XOR immediates, so they are first loaded into a register with `MOV reg, imm64`.

use std::fmt::{Debug, LowerHex};
use std::ops::BitXor;

use iced_x86::{Instruction, Mnemonic};

use super::{Location, Slice};

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
}

/// Integer width of a [`Decryptor`]. Implemented for [`i32`] and [`i64`].
pub trait KeyWidth:
    sealed::Sealed
    + Copy
    + Default
    + Eq
    + Debug
    + LowerHex
    + BitXor<Output = Self>
    + Send
    + Sync
    + 'static
{
    /// Size of the integer in bits.
    const BITS: u32;
    /// Mnemonic of the instructions that carry the XOR keys as immediate operands.
    const KEY_MNEMONIC: Mnemonic;

    /// Truncate a decoded immediate to this width.
    fn from_immediate(imm: u64) -> Self;

    fn rotate_left(self, n: u32) -> Self;

    fn rotate_right(self, n: u32) -> Self;

    fn wrapping_shl(self, n: u32) -> Self;
}

macro_rules! key_width_impl {
    ($t:ty, $key_mnemonic:ident) => {
        impl KeyWidth for $t {
            const BITS: u32 = <$t>::BITS;
            const KEY_MNEMONIC: Mnemonic = Mnemonic::$key_mnemonic;

            #[inline]
            fn from_immediate(imm: u64) -> Self {
                imm as $t
            }
            #[inline]
            fn rotate_left(self, n: u32) -> Self {
                <$t>::rotate_left(self, n)
            }
            #[inline]
            fn rotate_right(self, n: u32) -> Self {
                <$t>::rotate_right(self, n)
            }
            #[inline]
            fn wrapping_shl(self, n: u32) -> Self {
                <$t>::wrapping_shl(self, n)
            }
        }
    };
}

key_width_impl!(i32, Xor);
key_width_impl!(i64, Mov);

/// Parameters of a rotate/XOR/shift decryption routine.
///
/// See the module-level documentation for the formula these parameters plug into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decryptor<T: KeyWidth> {
    /// Whether the value is rotated right (`ROR`) rather than left (`ROL`).
    pub rotate_right: bool,
    /// The key XORed in before the rotation and the one XORed in last.
    pub xor_key: [T; 2],
    pub rotate_amount: u8,
    pub shift_amount: u8,
    /// Offset of the encrypted value in its owning structure.
    pub source_offset: u8,
}

pub type Decryptor32 = Decryptor<i32>;
pub type Decryptor64 = Decryptor<i64>;

impl<T: KeyWidth> Decryptor<T> {
    /// Returns `true` if all the parameters that are never zero in practice were found.
    ///
    /// A zero rotation amount is accepted.
    pub fn is_valid(&self) -> bool {
        self.xor_key[0] != T::default()
            && self.xor_key[1] != T::default()
            && self.shift_amount != 0
            && self.source_offset != 0
    }

    /// Decrypt a value protected by this routine.
    pub fn decrypt(&self, encrypted: T) -> T {
        let keyed = encrypted ^ self.xor_key[0];
        let rotated = if self.rotate_right {
            keyed.rotate_right(self.rotate_amount as u32)
        }
        else {
            keyed.rotate_left(self.rotate_amount as u32)
        };
        rotated ^ rotated.wrapping_shl(self.shift_amount as u32) ^ self.xor_key[1]
    }
}

impl<T: KeyWidth> std::fmt::Display for Decryptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ROR: {}", self.rotate_right)?;
        writeln!(f, "XOR key: {:x}, {:x}", self.xor_key[0], self.xor_key[1])?;
        writeln!(f, "ROR value: {}", self.rotate_amount)?;
        writeln!(f, "SHR/SHL value: {}", self.shift_amount)?;
        writeln!(f, "Offset: {}", self.source_offset)
    }
}

/// Error returned by [`synthesize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisError {
    /// The encrypted value is read from this register rather than from memory.
    NonMemoryOrigin(Location),
    /// The displacement of the encrypted value does not fit in the 8-bit offset field.
    OffsetOutOfRange(i64),
}

impl std::fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonMemoryOrigin(loc) => {
                write!(f, "encrypted value is read from {loc}, not from memory")
            }
            Self::OffsetOutOfRange(disp) => {
                write!(f, "source displacement {disp:#x} does not fit in 8 bits")
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

/// Read the 8-bit amount of a shift or rotate instruction, truncating larger immediates.
fn amount_operand(instr: &Instruction) -> Option<u8> {
    let Ok(imm) = instr.try_immediate(1)
    else {
        log::debug!("{:?} at {:x} has no immediate amount", instr.mnemonic(), instr.ip());
        return None;
    };
    if imm > u8::MAX as u64 {
        log::warn!(
            "{:?} amount {imm:#x} at {:x} is truncated to 8 bits",
            instr.mnemonic(),
            instr.ip()
        );
    }
    Some(imm as u8)
}

/// Read the decryptor parameters off the instructions of `slice`.
///
/// The keys are taken from the first two [`KeyWidth::KEY_MNEMONIC`] instructions with an immediate
/// source. The returned decryptor is not checked with [`Decryptor::is_valid`].
pub fn synthesize<T: KeyWidth>(slice: &Slice) -> Result<Decryptor<T>, SynthesisError> {
    let Location::Memory { displacement, .. } = slice.external
    else {
        return Err(SynthesisError::NonMemoryOrigin(slice.external));
    };
    let source_offset =
        u8::try_from(displacement).map_err(|_| SynthesisError::OffsetOutOfRange(displacement))?;

    let mut decryptor = Decryptor::<T> {
        source_offset,
        ..Default::default()
    };
    let mut keys_found = 0usize;

    for instr in &slice.instructions {
        match instr.mnemonic() {
            m if m == T::KEY_MNEMONIC => {
                let Ok(key) = instr.try_immediate(1)
                else {
                    continue;
                };
                if let Some(slot) = decryptor.xor_key.get_mut(keys_found) {
                    *slot = T::from_immediate(key);
                }
                keys_found += 1;
            }
            Mnemonic::Ror | Mnemonic::Rol => {
                if instr.mnemonic() == Mnemonic::Ror {
                    decryptor.rotate_right = true;
                }
                if let Some(amount) = amount_operand(instr) {
                    decryptor.rotate_amount = amount;
                }
            }
            Mnemonic::Shr | Mnemonic::Shl => {
                if let Some(amount) = amount_operand(instr) {
                    decryptor.shift_amount = amount;
                }
            }
            _ => (),
        }
    }

    if keys_found > 2 {
        log::debug!("found {keys_found} key immediates, only the first two were kept");
    }
    Ok(decryptor)
}

#[cfg(test)]
mod tests {
    use iced_x86::{Register, code_asm::*};

    use super::{Decryptor32, Decryptor64, SynthesisError, synthesize};
    use crate::analysis::{Location, TraceWindow, WithBase, analyze, test::samples};

    fn slice_of(
        f: impl FnOnce(&mut CodeAssembler),
        target: Register,
    ) -> crate::analysis::Slice {
        let (code, ips) = samples::assemble(0x1000, f);
        let image = WithBase::new(&code, 0x1000);
        let mut window = TraceWindow::build(&image, 0x1000, *ips.last().unwrap());
        analyze(&mut window, Location::Register(target)).unwrap()
    }

    #[test]
    fn synthesize_ror_decryptor_32() {
        let slice = slice_of(samples::ror_decryptor_32, Register::EAX);
        let decryptor = synthesize::<i32>(&slice).unwrap();

        assert_eq!(
            decryptor,
            Decryptor32 {
                rotate_right: true,
                xor_key: [0x1234, 0x5678],
                rotate_amount: 7,
                shift_amount: 3,
                source_offset: 0x10,
            }
        );
        assert!(decryptor.is_valid());
    }

    #[test]
    fn synthesize_rol_decryptor_64() {
        let slice = slice_of(samples::rol_decryptor_64, Register::RAX);
        assert_eq!(slice.indices.len(), 9);

        let decryptor = synthesize::<i64>(&slice).unwrap();
        assert_eq!(
            decryptor,
            Decryptor64 {
                rotate_right: false,
                xor_key: [0x1122334455667788, 0x0102030405060708],
                rotate_amount: 0x11,
                shift_amount: 0x1d,
                source_offset: 8,
            }
        );
        assert!(decryptor.is_valid());
    }

    #[test]
    fn key_mnemonic_depends_on_width() {
        // XOR immediates are not keys of a 64-bit decryptor
        let slice = slice_of(samples::ror_decryptor_32, Register::EAX);
        let decryptor = synthesize::<i64>(&slice).unwrap();
        assert_eq!(decryptor.xor_key, [0, 0]);
        assert_eq!(decryptor.rotate_amount, 7);
        assert!(!decryptor.is_valid());

        // MOV immediates are not keys of a 32-bit decryptor
        let slice = slice_of(samples::rol_decryptor_64, Register::RAX);
        let decryptor = synthesize::<i32>(&slice).unwrap();
        assert_eq!(decryptor.xor_key, [0, 0]);
    }

    #[test]
    fn extra_keys_are_counted_but_not_stored() {
        let slice = slice_of(
            |asm| {
                asm.mov(eax, dword_ptr(rbx + 0x20)).unwrap();
                asm.xor(eax, 0x11).unwrap();
                asm.ror(eax, 3).unwrap();
                asm.xor(eax, 0x22).unwrap();
                asm.xor(eax, 0x33).unwrap();
                asm.shr(eax, 2).unwrap();
            },
            Register::EAX,
        );
        let decryptor = synthesize::<i32>(&slice).unwrap();
        assert_eq!(decryptor.xor_key, [0x11, 0x22]);
        assert_eq!(decryptor.shift_amount, 2);
        assert_eq!(decryptor.source_offset, 0x20);
    }

    #[test]
    fn register_origin_is_rejected() {
        let slice = slice_of(
            |asm| {
                asm.xor(eax, 0x1234).unwrap();
                asm.ror(eax, 7).unwrap();
            },
            Register::EAX,
        );
        assert_eq!(
            synthesize::<i32>(&slice).unwrap_err(),
            SynthesisError::NonMemoryOrigin(Location::Register(Register::EAX))
        );
    }

    #[test]
    fn oversized_offset_is_rejected() {
        let slice = slice_of(
            |asm| {
                asm.mov(eax, dword_ptr(rcx + 0x100)).unwrap();
                asm.xor(eax, 0x1234).unwrap();
            },
            Register::EAX,
        );
        assert_eq!(
            synthesize::<i32>(&slice).unwrap_err(),
            SynthesisError::OffsetOutOfRange(0x100)
        );

        let slice = slice_of(
            |asm| {
                asm.mov(eax, dword_ptr(rcx - 8)).unwrap();
                asm.xor(eax, 0x1234).unwrap();
            },
            Register::EAX,
        );
        assert_eq!(
            synthesize::<i32>(&slice).unwrap_err(),
            SynthesisError::OffsetOutOfRange(-8)
        );
    }

    #[test]
    fn zero_rotation_is_valid() {
        let decryptor = Decryptor32 {
            rotate_right: false,
            xor_key: [1, 2],
            rotate_amount: 0,
            shift_amount: 1,
            source_offset: 4,
        };
        assert!(decryptor.is_valid());
        assert!(!Decryptor32 { shift_amount: 0, ..decryptor }.is_valid());
        assert!(!Decryptor32 { source_offset: 0, ..decryptor }.is_valid());
        assert!(!Decryptor32 { xor_key: [1, 0], ..decryptor }.is_valid());
    }

    #[test]
    fn decrypt_evaluates_formula() {
        let decryptor = Decryptor32 {
            rotate_right: true,
            xor_key: [0x1234, 0x5678],
            rotate_amount: 7,
            shift_amount: 3,
            source_offset: 0x10,
        };
        assert_eq!(decryptor.decrypt(0), 0x2800577C);

        let decryptor = Decryptor64 {
            rotate_right: false,
            xor_key: [1, 2],
            rotate_amount: 4,
            shift_amount: 1,
            source_offset: 8,
        };
        assert_eq!(decryptor.decrypt(0x10), 0x332);
    }

    #[test]
    fn display() {
        let decryptor = Decryptor32 {
            rotate_right: true,
            xor_key: [0x1234, -1],
            rotate_amount: 7,
            shift_amount: 3,
            source_offset: 0x10,
        };
        assert_eq!(
            decryptor.to_string(),
            "ROR: true\nXOR key: 1234, ffffffff\nROR value: 7\nSHR/SHL value: 3\nOffset: 16\n"
        );
    }
}
