//! Linear intermediate representation between lowering and code generation.
//!
//! An IR program is a flat, ordered list of [`Instruction`]s; order is
//! execution order and instructions are never mutated once emitted. The same
//! stream has a textual form, one instruction per line:
//!
//! ```text
//! ; Comments start with semicolon
//! function main
//!     set r1, 3
//!     set r2, 1
//!     while r1 > 0, while_0
//!         sub r1, r2
//!     end_while
//!     call exit_with, r1
//! end_function
//! ```
//!
//! [`parse_ir`] reads that form; `Display` writes it back.

use crate::x64::encoder::JumpCondition;
use crate::x64::Reg;
use std::fmt;

pub mod parser;

pub use parser::parse_ir;

/// Compiler-internal storage name, unbounded and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualRegister(pub u32);

impl VirtualRegister {
    /// `r0`, the return value register.
    pub const RETURN: Self = Self(0);
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(VirtualRegister),
    /// ABI register named directly (`rax`, `rdi`, `rsi`).
    Abi(Reg),
    Imm(i64),
    /// Data variable living in `.data`.
    Var(String),
    /// Function or construct label.
    Label(String),
}

impl Operand {
    pub fn as_label(&self) -> Option<&str> {
        match self {
            Operand::Label(name) => Some(name),
            _ => None,
        }
    }
}

impl From<VirtualRegister> for Operand {
    fn from(reg: VirtualRegister) -> Self {
        Operand::Reg(reg)
    }
}

impl From<i64> for Operand {
    fn from(imm: i64) -> Self {
        Operand::Imm(imm)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Abi(reg) => write!(f, "{reg}"),
            Operand::Imm(imm) => write!(f, "{imm}"),
            Operand::Var(name) | Operand::Label(name) => f.write_str(name),
        }
    }
}

/// Condition of a `while` or `if`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    NotEqual,
    Equal,
}

impl Comparison {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::Less => "<",
            Comparison::GreaterEqual => ">=",
            Comparison::LessEqual => "<=",
            Comparison::NotEqual => "!=",
            Comparison::Equal => "==",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            ">" => Comparison::Greater,
            "<" => Comparison::Less,
            ">=" => Comparison::GreaterEqual,
            "<=" => Comparison::LessEqual,
            "!=" => Comparison::NotEqual,
            "==" => Comparison::Equal,
            _ => return None,
        })
    }

    /// Signed jump taken when the comparison holds.
    pub fn jump_if_true(self) -> JumpCondition {
        match self {
            Comparison::Greater => JumpCondition::Greater,
            Comparison::Less => JumpCondition::Less,
            Comparison::GreaterEqual => JumpCondition::GreaterEqual,
            Comparison::LessEqual => JumpCondition::LessEqual,
            Comparison::NotEqual => JumpCondition::NotEqual,
            Comparison::Equal => JumpCondition::Equal,
        }
    }

    /// Jump that leaves the construct.
    pub fn jump_if_false(self) -> JumpCondition {
        self.jump_if_true().negate()
    }
}

/// Operation tag of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Function,
    EndFunction,
    Param,
    Set,
    Store,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Sqrt,
    Call,
    While(Comparison),
    EndWhile,
    If(Comparison),
    EndIf,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Function => "function",
            Opcode::EndFunction => "end_function",
            Opcode::Param => "param",
            Opcode::Set => "set",
            Opcode::Store => "store",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Pow => "pow",
            Opcode::Neg => "neg",
            Opcode::Sqrt => "sqrt",
            Opcode::Call => "call",
            Opcode::While(_) => "while",
            Opcode::EndWhile => "end_while",
            Opcode::If(_) => "if",
            Opcode::EndIf => "end_if",
        }
    }

    /// Two-operand arithmetic acting in place on its first operand.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Pow
        )
    }
}

/// Maximum operands of one instruction.
pub const MAX_OPERANDS: usize = 3;

/// One IR instruction: an opcode and up to three operands.
///
/// `while`/`if` carry `[lhs, rhs, label]`; `call` carries `[name, args...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        debug_assert!(operands.len() <= MAX_OPERANDS);
        Self { opcode, operands }
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::new(Opcode::Function, vec![Operand::Label(name.into())])
    }

    pub fn end_function() -> Self {
        Self::new(Opcode::EndFunction, Vec::new())
    }

    pub fn param(var: impl Into<String>, reg: VirtualRegister) -> Self {
        Self::new(Opcode::Param, vec![Operand::Var(var.into()), reg.into()])
    }

    pub fn set(dst: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Self::new(Opcode::Set, vec![dst.into(), src.into()])
    }

    pub fn store(var: impl Into<String>, src: impl Into<Operand>) -> Self {
        Self::new(Opcode::Store, vec![Operand::Var(var.into()), src.into()])
    }

    pub fn binary(opcode: Opcode, dst: VirtualRegister, src: VirtualRegister) -> Self {
        debug_assert!(opcode.is_binary());
        Self::new(opcode, vec![dst.into(), src.into()])
    }

    pub fn neg(reg: VirtualRegister) -> Self {
        Self::new(Opcode::Neg, vec![reg.into()])
    }

    pub fn sqrt(reg: VirtualRegister) -> Self {
        Self::new(Opcode::Sqrt, vec![reg.into()])
    }

    pub fn call(name: impl Into<String>, args: &[VirtualRegister]) -> Self {
        let mut operands = vec![Operand::Label(name.into())];
        operands.extend(args.iter().map(|&arg| Operand::Reg(arg)));
        Self::new(Opcode::Call, operands)
    }

    pub fn while_loop(
        cmp: Comparison,
        lhs: VirtualRegister,
        rhs: impl Into<Operand>,
        label: impl Into<String>,
    ) -> Self {
        Self::new(
            Opcode::While(cmp),
            vec![lhs.into(), rhs.into(), Operand::Label(label.into())],
        )
    }

    pub fn end_while() -> Self {
        Self::new(Opcode::EndWhile, Vec::new())
    }

    pub fn if_then(
        cmp: Comparison,
        lhs: VirtualRegister,
        rhs: impl Into<Operand>,
        label: impl Into<String>,
    ) -> Self {
        Self::new(
            Opcode::If(cmp),
            vec![lhs.into(), rhs.into(), Operand::Label(label.into())],
        )
    }

    pub fn end_if() -> Self {
        Self::new(Opcode::EndIf, Vec::new())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        match (self.opcode, self.operands.as_slice()) {
            (Opcode::While(cmp) | Opcode::If(cmp), [lhs, rhs, label]) => {
                write!(f, " {lhs} {} {rhs}, {label}", cmp.symbol())
            }
            (_, operands) => {
                for (i, operand) in operands.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{operand}")?;
                }
                Ok(())
            }
        }
    }
}

/// Print a program with block indentation.
pub fn print_program(program: &[Instruction]) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    for instruction in program {
        if matches!(
            instruction.opcode,
            Opcode::EndFunction | Opcode::EndWhile | Opcode::EndIf
        ) {
            depth = depth.saturating_sub(1);
        }
        out.push_str(&"    ".repeat(depth));
        out.push_str(&instruction.to_string());
        out.push('\n');
        if matches!(
            instruction.opcode,
            Opcode::Function | Opcode::While(_) | Opcode::If(_)
        ) {
            depth += 1;
        }
    }
    out
}
