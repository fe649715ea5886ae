//! Textual IR parser.
//!
//! Line oriented: one instruction per line, operands separated by commas
//! and/or whitespace, `;` starts a comment. A line that cannot be parsed is
//! reported to the session and skipped; parsing continues with the next line.

use super::*;
use crate::core::{CompilationSession, Diagnostic};
use crate::x64::registers::abi_register;

/// Parse a whole IR program, reporting bad lines to `session`.
pub fn parse_ir(text: &str, session: &CompilationSession<'_>) -> Vec<Instruction> {
    let mut program = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let parser = Parser {
            line_number: index + 1,
            text: line,
        };
        match parser.parse() {
            Ok(instruction) => program.push(instruction),
            Err(diagnostic) => session.report(diagnostic),
        }
    }
    program
}

struct Parser<'a> {
    line_number: usize,
    text: &'a str,
}

type ParseResult<T> = Result<T, Diagnostic>;

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        _ => false,
    }
}

fn parse_number(token: &str) -> Option<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            digits.parse::<i128>().ok()?
        }
        None => return None,
    };
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

fn parse_virtual_register(token: &str) -> Option<VirtualRegister> {
    let digits = token.strip_prefix('r')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(VirtualRegister)
}

impl<'a> Parser<'a> {
    fn parse(&self) -> ParseResult<Instruction> {
        let (mnemonic, rest) = match self.text.split_once(char::is_whitespace) {
            Some((mnemonic, rest)) => (mnemonic, rest.trim()),
            None => (self.text, ""),
        };

        let opcode = match mnemonic {
            "function" => Opcode::Function,
            "end_function" => Opcode::EndFunction,
            "param" => Opcode::Param,
            "set" => Opcode::Set,
            "store" => Opcode::Store,
            "add" => Opcode::Add,
            "sub" => Opcode::Sub,
            "mul" => Opcode::Mul,
            "div" => Opcode::Div,
            "pow" => Opcode::Pow,
            "neg" => Opcode::Neg,
            "sqrt" => Opcode::Sqrt,
            "call" => Opcode::Call,
            "while" | "if" => return self.parse_conditional(mnemonic == "while", rest),
            "end_while" => Opcode::EndWhile,
            "end_if" => Opcode::EndIf,
            _ => {
                return Err(Diagnostic::UnknownOpcode {
                    line: self.line_number,
                    opcode: mnemonic.to_string(),
                })
            }
        };

        let tokens: Vec<&str> = rest
            .split(|ch: char| ch == ',' || ch.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect();

        let operands = match opcode {
            Opcode::Function => {
                self.expect_count(opcode, &tokens, "1", 1..=1)?;
                vec![self.label(opcode, tokens[0])?]
            }
            Opcode::EndFunction | Opcode::EndWhile | Opcode::EndIf => {
                self.expect_count(opcode, &tokens, "0", 0..=0)?;
                Vec::new()
            }
            Opcode::Param => {
                self.expect_count(opcode, &tokens, "2", 2..=2)?;
                vec![self.variable(opcode, tokens[0])?, self.register(opcode, tokens[1])?]
            }
            Opcode::Set => {
                self.expect_count(opcode, &tokens, "2", 2..=2)?;
                vec![self.register(opcode, tokens[0])?, self.value(tokens[1])?]
            }
            Opcode::Store => {
                self.expect_count(opcode, &tokens, "2", 2..=2)?;
                vec![self.variable(opcode, tokens[0])?, self.register(opcode, tokens[1])?]
            }
            Opcode::Neg | Opcode::Sqrt => {
                self.expect_count(opcode, &tokens, "1", 1..=1)?;
                vec![self.register(opcode, tokens[0])?]
            }
            Opcode::Call => {
                self.expect_count(opcode, &tokens, "1 to 3", 1..=MAX_OPERANDS)?;
                let mut operands = vec![self.label(opcode, tokens[0])?];
                for token in &tokens[1..] {
                    operands.push(self.register(opcode, token)?);
                }
                operands
            }
            _ => {
                debug_assert!(opcode.is_binary());
                self.expect_count(opcode, &tokens, "2", 2..=2)?;
                vec![self.register(opcode, tokens[0])?, self.register(opcode, tokens[1])?]
            }
        };

        Ok(Instruction::new(opcode, operands))
    }

    /// `while LHS [OP RHS], LABEL` and the `if` equivalent.
    fn parse_conditional(&self, is_loop: bool, rest: &str) -> ParseResult<Instruction> {
        let Some((condition, label)) = rest.rsplit_once(',') else {
            return Err(self.malformed(rest, "expected `CONDITION, LABEL`"));
        };

        let placeholder = if is_loop {
            Opcode::While(Comparison::Greater)
        } else {
            Opcode::If(Comparison::Greater)
        };
        let label = self.label(placeholder, label.trim())?;

        let parts: Vec<&str> = condition.split_whitespace().collect();
        let (cmp, lhs, rhs) = match parts.as_slice() {
            // A bare value is tested against zero.
            [lhs] => (Comparison::Greater, *lhs, Operand::Imm(0)),
            [lhs, op, rhs] => {
                let Some(cmp) = Comparison::from_symbol(op) else {
                    return Err(self.malformed(op, "unknown comparison"));
                };
                let rhs = match parse_number(rhs) {
                    Some(imm) => Operand::Imm(imm),
                    None => self.register(placeholder, rhs)?,
                };
                (cmp, *lhs, rhs)
            }
            _ => return Err(self.malformed(condition.trim(), "expected `LHS OP RHS`")),
        };

        let opcode = if is_loop {
            Opcode::While(cmp)
        } else {
            Opcode::If(cmp)
        };
        let lhs = self.register(opcode, lhs)?;
        Ok(Instruction::new(opcode, vec![lhs, rhs, label]))
    }

    fn expect_count(
        &self,
        opcode: Opcode,
        tokens: &[&str],
        expected: &'static str,
        range: std::ops::RangeInclusive<usize>,
    ) -> ParseResult<()> {
        if range.contains(&tokens.len()) {
            Ok(())
        } else {
            Err(Diagnostic::WrongArity {
                opcode: opcode.mnemonic(),
                expected,
                found: tokens.len(),
            })
        }
    }

    fn malformed(&self, text: &str, reason: &str) -> Diagnostic {
        Diagnostic::Malformed {
            line: self.line_number,
            text: text.to_string(),
            reason: reason.to_string(),
        }
    }

    fn invalid(&self, opcode: Opcode, token: &str) -> Diagnostic {
        Diagnostic::InvalidOperand {
            opcode: opcode.mnemonic(),
            operand: token.to_string(),
        }
    }

    /// Virtual or ABI register.
    fn register(&self, opcode: Opcode, token: &str) -> ParseResult<Operand> {
        if let Some(reg) = parse_virtual_register(token) {
            return Ok(Operand::Reg(reg));
        }
        if let Some(reg) = abi_register(token) {
            return Ok(Operand::Abi(reg));
        }
        Err(self.invalid(opcode, token))
    }

    fn variable(&self, opcode: Opcode, token: &str) -> ParseResult<Operand> {
        if is_identifier(token) && parse_virtual_register(token).is_none() {
            Ok(Operand::Var(token.to_string()))
        } else {
            Err(self.invalid(opcode, token))
        }
    }

    fn label(&self, opcode: Opcode, token: &str) -> ParseResult<Operand> {
        if is_identifier(token) {
            Ok(Operand::Label(token.to_string()))
        } else {
            Err(self.invalid(opcode, token))
        }
    }

    /// Register, literal or variable.
    fn value(&self, token: &str) -> ParseResult<Operand> {
        if let Some(reg) = parse_virtual_register(token) {
            Ok(Operand::Reg(reg))
        } else if let Some(reg) = abi_register(token) {
            Ok(Operand::Abi(reg))
        } else if let Some(imm) = parse_number(token) {
            Ok(Operand::Imm(imm))
        } else if is_identifier(token) {
            Ok(Operand::Var(token.to_string()))
        } else {
            Err(self.malformed(token, "not a register, literal or variable"))
        }
    }
}
