//! x86-64 general purpose registers and virtual register homes.
//!
//! Encoders take logical register numbers 0-15 in hardware order. The code
//! generator maps the first virtual registers onto a fixed table of homes and
//! every later one onto a fixed `.data` qword; there is no allocation or reuse.

use std::fmt;

/// A 64-bit general purpose register, numbered as the hardware encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

const GP64_REGS: [Reg; 16] = [
    Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rbx, Reg::Rsp, Reg::Rbp, Reg::Rsi, Reg::Rdi,
    Reg::R8, Reg::R9, Reg::R10, Reg::R11, Reg::R12, Reg::R13, Reg::R14, Reg::R15,
];

const GP64_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl Reg {
    /// Register for a logical number, `None` outside 0-15.
    pub fn from_index(index: u8) -> Option<Self> {
        GP64_REGS.get(index as usize).copied()
    }

    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Low three bits, as placed in ModR/M, SIB or the opcode.
    pub const fn low_bits(self) -> u8 {
        self as u8 & 0b111
    }

    /// Whether the register needs a REX extension bit (r8-r15).
    pub const fn is_extended(self) -> bool {
        self as u8 >= 8
    }

    pub fn name(self) -> &'static str {
        GP64_NAMES[self as usize]
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical homes of virtual registers, indexed by virtual register number.
///
/// `r0` is the return register. `rdi`/`rsi` carry arguments, `rsp`/`rbp`
/// hold the frame and `r11` is the code generator's scratch register, so
/// none of them is a home.
pub const VREG_HOMES: [Reg; 11] = [
    Reg::Rax,
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::Rcx,
    Reg::Rdx,
];

/// Homes that may carry a memory-homed virtual register for the length of
/// one instruction, saved and restored around it. `rax` and `rdx` are left
/// out since `div` and `pow` use them implicitly.
pub const BORROWABLE: [Reg; 8] = [
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::R8,
    Reg::R9,
    Reg::R10,
];

/// Scratch register owned by the code generator between two IR instructions.
pub const SCRATCH: Reg = Reg::R11;

/// Argument registers for calls, in order.
pub const ARG_REGS: [Reg; 2] = [Reg::Rdi, Reg::Rsi];

/// Physical home of virtual register `rN`, `None` for a memory-homed one.
pub fn vreg_home(number: u32) -> Option<Reg> {
    VREG_HOMES.get(number as usize).copied()
}

/// ABI register accepted by name in IR operands.
pub fn abi_register(name: &str) -> Option<Reg> {
    match name {
        "rax" => Some(Reg::Rax),
        "rdi" => Some(Reg::Rdi),
        "rsi" => Some(Reg::Rsi),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip() {
        for index in 0..16u8 {
            let reg = Reg::from_index(index).unwrap();
            assert_eq!(reg.index(), index);
            assert_eq!(reg.is_extended(), index >= 8);
            assert_eq!(reg.low_bits(), index & 7);
        }
        assert_eq!(Reg::from_index(16), None);
    }

    #[test]
    fn test_homes_avoid_reserved_registers() {
        for reserved in [Reg::Rsp, Reg::Rbp, Reg::Rdi, Reg::Rsi, SCRATCH] {
            assert!(!VREG_HOMES.contains(&reserved), "{reserved} must not be a home");
        }
        assert_eq!(vreg_home(0), Some(Reg::Rax));
        assert_eq!(vreg_home(1), Some(Reg::Rbx));
        assert_eq!(vreg_home(VREG_HOMES.len() as u32), None);
    }

    #[test]
    fn test_homes_are_distinct() {
        for (i, a) in VREG_HOMES.iter().enumerate() {
            for b in &VREG_HOMES[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_borrowable_homes() {
        for reg in BORROWABLE {
            assert!(VREG_HOMES.contains(&reg));
            assert!(!matches!(reg, Reg::Rax | Reg::Rdx) && reg != SCRATCH);
        }
    }

    #[test]
    fn test_abi_names() {
        assert_eq!(abi_register("rdi"), Some(Reg::Rdi));
        assert_eq!(abi_register("rbx"), None);
        assert_eq!(Reg::R13.to_string(), "r13");
    }
}
