// This module implements the code generator: it consumes the IR stream instruction by
// instruction and drives the hand encoder to build the .text and .data sections. It owns
// the label table with its pending-patch list, the data variable table, and the separate
// loop and conditional nesting stacks. The runtime primitives are emitted first; the
// synthesized process entry (clear rbp, call the entry function, call __exit) is emitted
// last by finish(). The first virtual registers map to fixed physical homes and the rest to
// fixed .data qwords; an instruction naming a memory-homed register borrows a physical home
// for its duration, saved on the stack around it. r11 is scratch between instructions.
// Local problems (bad operands, reads of unknown variables) are reported to the session and the instruction is skipped. Structural
// problems (unmatched or unclosed blocks, duplicate labels, table overflows, calls that
// never resolve, a missing entry function) abort with a CompileError.

//! IR to x86-64 code generation.

pub mod labels;

use crate::core::{CodeBuffer, CompilationSession, CompileError, CompileResult, Diagnostic};
use crate::elf::{ElfImage, CODE_VADDR, DATA_VADDR};
use crate::ir::{Comparison, Instruction, Opcode, Operand};
use crate::x64::encoder::{self as enc, JumpCondition};
use crate::x64::registers::{vreg_home, Reg, ARG_REGS, BORROWABLE, SCRATCH};
use crate::x64::runtime::{self, RuntimeLayout};
use crate::x64::listing;
use hashbrown::HashMap;
use labels::LabelTable;

/// Runtime routine a builtin call name routes to.
pub fn builtin_target(name: &str) -> Option<&'static str> {
    match name {
        "scanf" => Some(runtime::READ_INT),
        "printf" => Some(runtime::WRITE_INT),
        "exit" => Some(runtime::EXIT),
        "exit_with" => Some(runtime::EXIT_WITH),
        _ => None,
    }
}

/// Label placed where a loop exits.
pub fn loop_end_label(label: &str) -> String {
    format!("end_loop_{label}")
}

/// Label placed after a conditional body.
pub fn if_end_label(label: &str) -> String {
    format!("end_if_{label}")
}

/// Output of a successful compile.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub image: ElfImage,
    /// Resolved labels and their `.text` offsets.
    pub symbols: Vec<(String, usize)>,
    pub runtime: RuntimeLayout,
}

impl CompiledProgram {
    /// `.text` offset of a resolved label.
    pub fn symbol(&self, name: &str) -> Option<usize> {
        self.symbols
            .iter()
            .find(|(symbol, _)| symbol == name)
            .map(|&(_, offset)| offset)
    }

    /// NASM-syntax disassembly of `.text`.
    pub fn listing(&self) -> String {
        listing::disassemble(self.image.text(), CODE_VADDR, &self.symbols)
    }
}

/// How an instruction uses a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// A memory-homed virtual register carried in a borrowed physical register
/// for the current instruction.
#[derive(Debug, Clone, Copy)]
struct Borrowed {
    vreg: u32,
    reg: Reg,
    slot: u32,
    written: bool,
}

/// Code generator state for one compile.
pub struct CodeGenerator<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    text: CodeBuffer,
    data: CodeBuffer,
    labels: LabelTable,
    /// Data variable name to absolute address.
    variables: HashMap<String, u32>,
    /// Virtual register number to the absolute address of its `.data` home.
    memory_homes: HashMap<u32, u32>,
    /// Physical registers the current instruction names directly.
    pinned: Vec<Reg>,
    borrowed: Vec<Borrowed>,
    loops: Vec<String>,
    conditionals: Vec<String>,
    current_function: Option<String>,
    params_bound: usize,
    runtime: RuntimeLayout,
}

impl<'s, 'arena> CodeGenerator<'s, 'arena> {
    /// Create a generator with the runtime primitives already emitted.
    pub fn new(session: &'s CompilationSession<'arena>) -> CompileResult<Self> {
        let mut text = CodeBuffer::with_capacity(4096);
        let mut data = CodeBuffer::new();
        let runtime = runtime::emit_runtime(&mut text, &mut data);

        let mut labels = LabelTable::new(session.options().max_labels);
        for (name, offset) in runtime.routines() {
            labels.define(name, offset, &mut text)?;
        }

        Ok(Self {
            session,
            text,
            data,
            labels,
            variables: HashMap::new(),
            memory_homes: HashMap::new(),
            pinned: Vec::new(),
            borrowed: Vec::new(),
            loops: Vec::new(),
            conditionals: Vec::new(),
            current_function: None,
            params_bound: 0,
            runtime,
        })
    }

    pub fn text(&self) -> &CodeBuffer {
        &self.text
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    /// Absolute address of a data variable.
    pub fn variable_address(&self, name: &str) -> Option<u32> {
        self.variables.get(name).copied()
    }

    /// Absolute address of the `.data` home of a virtual register past the
    /// physical table, once it has been used.
    pub fn memory_home_address(&self, vreg: u32) -> Option<u32> {
        self.memory_homes.get(&vreg).copied()
    }

    /// Compile a whole IR stream.
    pub fn compile(&mut self, program: &[Instruction]) -> CompileResult<()> {
        for (index, instruction) in program.iter().enumerate() {
            self.compile_instruction(index, instruction)?;
        }
        Ok(())
    }

    pub fn compile_instruction(
        &mut self,
        index: usize,
        instruction: &Instruction,
    ) -> CompileResult<()> {
        log::debug!("[{index}] {:#06x}: {instruction}", self.text.position());
        self.session
            .record_instruction_compiled(instruction.opcode.mnemonic());

        match instruction.opcode {
            Opcode::Function => return self.compile_function(instruction),
            Opcode::EndFunction => return self.compile_end_function(index),
            _ if self.current_function.is_none() => {
                self.session
                    .report(Diagnostic::OutsideFunction(instruction.to_string()));
                return Ok(());
            }
            _ => {}
        }

        self.pinned = instruction
            .operands
            .iter()
            .filter_map(|operand| match operand {
                Operand::Reg(vreg) => vreg_home(vreg.0),
                Operand::Abi(reg) => Some(*reg),
                _ => None,
            })
            .collect();
        let compiled = self.compile_body(index, instruction);
        self.release_borrowed();
        compiled
    }

    fn compile_body(&mut self, index: usize, instruction: &Instruction) -> CompileResult<()> {
        match instruction.opcode {
            Opcode::Param => self.compile_param(instruction),
            Opcode::Set => self.compile_set(instruction),
            Opcode::Store => self.compile_store(instruction)?,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Pow => {
                self.compile_binary(instruction)
            }
            Opcode::Neg | Opcode::Sqrt => self.compile_unary(instruction),
            Opcode::Call => self.compile_call(instruction)?,
            Opcode::While(cmp) => self.compile_while(cmp, instruction)?,
            Opcode::EndWhile => self.compile_end_while(index)?,
            Opcode::If(cmp) => self.compile_if(cmp, instruction)?,
            Opcode::EndIf => self.compile_end_if(index)?,
            Opcode::Function | Opcode::EndFunction => {}
        }
        Ok(())
    }

    fn wrong_arity(&self, instruction: &Instruction, expected: &'static str) {
        self.session.report(Diagnostic::WrongArity {
            opcode: instruction.opcode.mnemonic(),
            expected,
            found: instruction.operands.len(),
        });
    }

    fn invalid(&self, instruction: &Instruction, operand: &Operand) {
        self.session.report(Diagnostic::InvalidOperand {
            opcode: instruction.opcode.mnemonic(),
            operand: operand.to_string(),
        });
    }

    /// Physical register of a register operand, reporting anything else.
    fn physical(
        &mut self,
        instruction: &Instruction,
        operand: &Operand,
        access: Access,
    ) -> Option<Reg> {
        match operand {
            Operand::Reg(vreg) => Some(match vreg_home(vreg.0) {
                Some(home) => home,
                None => self.borrow_for(vreg.0, access),
            }),
            Operand::Abi(reg) => Some(*reg),
            other => {
                self.invalid(instruction, other);
                None
            }
        }
    }

    /// Load a memory-homed virtual register into a borrowed home, pushing
    /// the home's own value first. The value is loaded even for a pure
    /// write so a skipped instruction stores back what was there.
    fn borrow_for(&mut self, vreg: u32, access: Access) -> Reg {
        let written = access == Access::Write;
        if let Some(borrowed) = self.borrowed.iter_mut().find(|b| b.vreg == vreg) {
            borrowed.written |= written;
            return borrowed.reg;
        }

        let free = BORROWABLE.into_iter().find(|reg| {
            !self.pinned.contains(reg) && !self.borrowed.iter().any(|b| b.reg == *reg)
        });
        let Some(reg) = free else {
            unreachable!("an instruction names at most three registers");
        };
        let slot = self.memory_home(vreg);
        enc::push_reg(&mut self.text, reg);
        enc::mov_reg_abs(&mut self.text, reg, slot);
        self.borrowed.push(Borrowed {
            vreg,
            reg,
            slot,
            written,
        });
        reg
    }

    /// Address of the `.data` home of `rN`, allocated on first use.
    fn memory_home(&mut self, vreg: u32) -> u32 {
        if let Some(&slot) = self.memory_homes.get(&vreg) {
            return slot;
        }
        let slot = (DATA_VADDR + self.data.position() as u64) as u32;
        self.data.emit_u64(0);
        self.memory_homes.insert(vreg, slot);
        log::debug!("r{vreg} homed at {slot:#x}");
        slot
    }

    /// Store written memory homes back and restore the borrowed registers.
    /// Neither `mov` nor `pop` touches the flags.
    fn release_borrowed(&mut self) {
        let borrowed = std::mem::take(&mut self.borrowed);
        for b in borrowed.iter().rev() {
            if b.written {
                enc::mov_abs_reg(&mut self.text, b.slot, b.reg);
            }
            enc::pop_reg(&mut self.text, b.reg);
        }
    }

    fn define_label(&mut self, name: &str) -> CompileResult<()> {
        let patched = self.labels.define(name, self.text.position(), &mut self.text)?;
        for _ in 0..patched {
            self.session.record_patch_applied();
        }
        Ok(())
    }

    fn mov(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            enc::mov_reg_reg(&mut self.text, dst, src);
        }
    }

    fn compile_function(&mut self, instruction: &Instruction) -> CompileResult<()> {
        let Some(name) = instruction.operands.first().and_then(Operand::as_label) else {
            self.wrong_arity(instruction, "a function name");
            return Ok(());
        };

        if let Some(outer) = &self.current_function {
            return Err(CompileError::UnclosedConstruct {
                construct: "function",
                label: outer.clone(),
                at: "a nested `function`",
            });
        }

        self.define_label(name)?;
        enc::emit_prologue(&mut self.text);
        self.current_function = Some(name.to_string());
        self.params_bound = 0;
        self.session.record_function_compiled();
        Ok(())
    }

    fn compile_end_function(&mut self, index: usize) -> CompileResult<()> {
        if self.current_function.is_none() {
            return Err(CompileError::UnmatchedEnd {
                marker: "end_function",
                index,
            });
        }
        if let Some(label) = self.loops.last() {
            return Err(CompileError::UnclosedConstruct {
                construct: "while",
                label: label.clone(),
                at: "`end_function`",
            });
        }
        if let Some(label) = self.conditionals.last() {
            return Err(CompileError::UnclosedConstruct {
                construct: "if",
                label: label.clone(),
                at: "`end_function`",
            });
        }

        enc::emit_epilogue(&mut self.text);
        self.current_function = None;
        Ok(())
    }

    fn compile_param(&mut self, instruction: &Instruction) {
        let [var, reg] = instruction.operands.as_slice() else {
            self.wrong_arity(instruction, "2");
            return;
        };
        let Some(&src) = ARG_REGS.get(self.params_bound) else {
            // Only two parameters fit the argument registers.
            self.invalid(instruction, var);
            return;
        };
        let Some(dst) = self.physical(instruction, reg, Access::Write) else {
            return;
        };
        self.params_bound += 1;
        self.mov(dst, src);
    }

    fn compile_set(&mut self, instruction: &Instruction) {
        let [dst, src] = instruction.operands.as_slice() else {
            self.wrong_arity(instruction, "2");
            return;
        };
        let Some(dst) = self.physical(instruction, dst, Access::Write) else {
            return;
        };

        match src {
            Operand::Reg(_) | Operand::Abi(_) => {
                if let Some(src) = self.physical(instruction, src, Access::Read) {
                    self.mov(dst, src);
                }
            }
            Operand::Imm(imm) => enc::mov_reg_imm64(&mut self.text, dst, *imm),
            Operand::Var(name) => match self.variables.get(name) {
                Some(&addr) => enc::mov_reg_abs(&mut self.text, dst, addr),
                None => self.session.report(Diagnostic::UnknownVariable(name.clone())),
            },
            Operand::Label(_) => self.invalid(instruction, src),
        }
    }

    fn compile_store(&mut self, instruction: &Instruction) -> CompileResult<()> {
        let [Operand::Var(name), src] = instruction.operands.as_slice() else {
            match instruction.operands.first() {
                Some(operand) if instruction.operands.len() == 2 => {
                    self.invalid(instruction, operand)
                }
                _ => self.wrong_arity(instruction, "2"),
            }
            return Ok(());
        };
        let Some(src) = self.physical(instruction, src, Access::Read) else {
            return Ok(());
        };

        let addr = self.variable_slot(name)?;
        enc::mov_abs_reg(&mut self.text, addr, src);
        Ok(())
    }

    /// Address of `name`'s slot, allocating a zeroed qword on first use.
    fn variable_slot(&mut self, name: &str) -> CompileResult<u32> {
        if let Some(&addr) = self.variables.get(name) {
            return Ok(addr);
        }
        let limit = self.session.options().max_variables;
        if self.variables.len() >= limit {
            return Err(CompileError::VariableTableOverflow { limit });
        }
        let addr = (DATA_VADDR + self.data.position() as u64) as u32;
        self.data.emit_u64(0);
        self.variables.insert(name.to_string(), addr);
        log::debug!("variable `{name}` at {addr:#x}");
        Ok(addr)
    }

    fn compile_binary(&mut self, instruction: &Instruction) {
        let [dst, src] = instruction.operands.as_slice() else {
            self.wrong_arity(instruction, "2");
            return;
        };
        let (Some(dst), Some(src)) = (
            self.physical(instruction, dst, Access::Write),
            self.physical(instruction, src, Access::Read),
        ) else {
            return;
        };

        match instruction.opcode {
            Opcode::Add => enc::add_reg_reg(&mut self.text, dst, src),
            Opcode::Sub => enc::sub_reg_reg(&mut self.text, dst, src),
            Opcode::Mul => enc::imul_reg_reg(&mut self.text, dst, src),
            Opcode::Div => self.emit_div(dst, src),
            Opcode::Pow => self.emit_pow(dst, src),
            _ => {}
        }
    }

    /// `dst = dst / src`, signed. Clobbers rax and the scratch register.
    fn emit_div(&mut self, dst: Reg, src: Reg) {
        let save_rdx = dst != Reg::Rdx;
        if save_rdx {
            enc::push_reg(&mut self.text, Reg::Rdx);
        }
        self.mov(SCRATCH, src);
        self.mov(Reg::Rax, dst);
        enc::cqo(&mut self.text);
        enc::idiv_reg(&mut self.text, SCRATCH);
        self.mov(dst, Reg::Rax);
        if save_rdx {
            enc::pop_reg(&mut self.text, Reg::Rdx);
        }
    }

    /// `dst = dst ** src` by repeated multiplication; a non-positive
    /// exponent gives 1. Clobbers rax and the scratch register.
    fn emit_pow(&mut self, dst: Reg, src: Reg) {
        self.mov(SCRATCH, src);
        // The accumulator lives in rax, so a base in rax moves to rdx.
        let base = if dst == Reg::Rax {
            enc::push_reg(&mut self.text, Reg::Rdx);
            self.mov(Reg::Rdx, Reg::Rax);
            Reg::Rdx
        } else {
            dst
        };
        enc::mov_reg_imm64(&mut self.text, Reg::Rax, 1);

        let head = self.text.position();
        enc::test_reg_reg(&mut self.text, SCRATCH, SCRATCH);
        let exit = enc::jcc_rel32(&mut self.text, JumpCondition::LessEqual, 0);
        enc::imul_reg_reg(&mut self.text, Reg::Rax, base);
        enc::dec_reg(&mut self.text, SCRATCH);
        let back = enc::jmp_rel32(&mut self.text, 0);
        self.text.patch_i32(back, labels::displacement(back, head));
        let end = self.text.position();
        self.text.patch_i32(exit, labels::displacement(exit, end));

        if dst == Reg::Rax {
            enc::pop_reg(&mut self.text, Reg::Rdx);
        } else {
            self.mov(dst, Reg::Rax);
        }
    }

    fn compile_unary(&mut self, instruction: &Instruction) {
        let [operand] = instruction.operands.as_slice() else {
            self.wrong_arity(instruction, "1");
            return;
        };
        let Some(reg) = self.physical(instruction, operand, Access::Write) else {
            return;
        };

        if instruction.opcode == Opcode::Neg {
            enc::neg_reg(&mut self.text, reg);
        } else {
            enc::cvtsi2sd(&mut self.text, 0, reg);
            enc::sqrtsd(&mut self.text, 0, 0);
            enc::cvttsd2si(&mut self.text, reg, 0);
        }
    }

    fn compile_call(&mut self, instruction: &Instruction) -> CompileResult<()> {
        let Some((callee, args)) = instruction.operands.split_first() else {
            self.wrong_arity(instruction, "1 to 3");
            return Ok(());
        };
        let Some(name) = callee.as_label() else {
            self.invalid(instruction, callee);
            return Ok(());
        };

        let mut regs = Vec::with_capacity(args.len());
        for arg in args {
            match self.physical(instruction, arg, Access::Read) {
                Some(reg) => regs.push(reg),
                None => return Ok(()),
            }
        }
        match regs.as_slice() {
            [] => {}
            [first] => self.mov(Reg::Rdi, *first),
            [first, second] => self.move_two_args(*first, *second),
            _ => {
                self.session.report(Diagnostic::UnsupportedCall {
                    name: name.to_string(),
                    reason: "more than two arguments".to_string(),
                });
                return Ok(());
            }
        }

        // Borrowed homes are restored before control leaves.
        self.release_borrowed();
        let target = builtin_target(name).unwrap_or(name);
        let field = enc::call_rel32(&mut self.text, 0);
        self.labels.reference(target, field, &mut self.text)?;
        Ok(())
    }

    /// Load rdi and rsi without overwriting a source still needed.
    fn move_two_args(&mut self, first: Reg, second: Reg) {
        if second != Reg::Rdi {
            self.mov(Reg::Rdi, first);
            self.mov(Reg::Rsi, second);
        } else if first != Reg::Rsi {
            self.mov(Reg::Rsi, second);
            self.mov(Reg::Rdi, first);
        } else {
            // Exact swap.
            self.mov(SCRATCH, Reg::Rdi);
            self.mov(Reg::Rdi, Reg::Rsi);
            self.mov(Reg::Rsi, SCRATCH);
        }
    }

    /// Emit the test for a `while`/`if` and a placeholder jump to `exit`
    /// taken when the condition is false. A condition with bad operands is
    /// reported and replaced by an unconditional jump, so the body is dead
    /// but the construct stays matched.
    fn emit_condition(
        &mut self,
        cmp: Comparison,
        instruction: &Instruction,
        exit: &str,
    ) -> CompileResult<()> {
        let compared = self.emit_compare(instruction);
        // The stack must be balanced on both edges of the branch.
        self.release_borrowed();
        let field = match compared {
            Some(()) => enc::jcc_rel32(&mut self.text, cmp.jump_if_false(), 0),
            None => enc::jmp_rel32(&mut self.text, 0),
        };
        self.labels.reference(exit, field, &mut self.text)?;
        Ok(())
    }

    fn emit_compare(&mut self, instruction: &Instruction) -> Option<()> {
        let [lhs, rhs, _] = instruction.operands.as_slice() else {
            return None;
        };
        let lhs = self.physical(instruction, lhs, Access::Read)?;
        match rhs {
            Operand::Imm(imm) => match i32::try_from(*imm) {
                Ok(imm) => enc::cmp_reg_imm32(&mut self.text, lhs, imm),
                Err(_) => {
                    enc::mov_reg_imm64(&mut self.text, SCRATCH, *imm);
                    enc::cmp_reg_reg(&mut self.text, lhs, SCRATCH);
                }
            },
            other => {
                let rhs = self.physical(instruction, other, Access::Read)?;
                enc::cmp_reg_reg(&mut self.text, lhs, rhs);
            }
        }
        Some(())
    }

    /// Label operand of a `while`/`if`, reporting a malformed instruction.
    fn construct_label(&self, instruction: &Instruction) -> Option<String> {
        match instruction.operands.as_slice() {
            [_, _, Operand::Label(label)] => Some(label.clone()),
            [_, _, other] => {
                self.invalid(instruction, other);
                None
            }
            _ => {
                self.wrong_arity(instruction, "3");
                None
            }
        }
    }

    fn check_depth(&self) -> CompileResult<()> {
        let limit = self.session.options().max_nesting;
        if self.loops.len() + self.conditionals.len() >= limit {
            return Err(CompileError::NestingTooDeep { limit });
        }
        Ok(())
    }

    fn compile_while(&mut self, cmp: Comparison, instruction: &Instruction) -> CompileResult<()> {
        let Some(label) = self.construct_label(instruction) else {
            return Ok(());
        };
        self.check_depth()?;

        self.define_label(&label)?;
        self.emit_condition(cmp, instruction, &loop_end_label(&label))?;
        self.loops.push(label);
        Ok(())
    }

    fn compile_end_while(&mut self, index: usize) -> CompileResult<()> {
        let Some(label) = self.loops.pop() else {
            return Err(CompileError::UnmatchedEnd {
                marker: "end_while",
                index,
            });
        };
        let field = enc::jmp_rel32(&mut self.text, 0);
        self.labels.reference(&label, field, &mut self.text)?;
        self.define_label(&loop_end_label(&label))
    }

    fn compile_if(&mut self, cmp: Comparison, instruction: &Instruction) -> CompileResult<()> {
        let Some(label) = self.construct_label(instruction) else {
            return Ok(());
        };
        self.check_depth()?;

        self.define_label(&label)?;
        self.emit_condition(cmp, instruction, &if_end_label(&label))?;
        self.conditionals.push(label);
        Ok(())
    }

    fn compile_end_if(&mut self, index: usize) -> CompileResult<()> {
        let Some(label) = self.conditionals.pop() else {
            return Err(CompileError::UnmatchedEnd {
                marker: "end_if",
                index,
            });
        };
        self.define_label(&if_end_label(&label))
    }

    /// Close the stream: synthesize the process entry, resolve every
    /// reference and build the image.
    pub fn finish(mut self) -> CompileResult<CompiledProgram> {
        const AT_END: &str = "end of IR stream";
        if let Some(name) = self.current_function.take() {
            return Err(CompileError::UnclosedConstruct {
                construct: "function",
                label: name,
                at: AT_END,
            });
        }
        if let Some(label) = self.loops.pop() {
            return Err(CompileError::UnclosedConstruct {
                construct: "while",
                label,
                at: AT_END,
            });
        }
        if let Some(label) = self.conditionals.pop() {
            return Err(CompileError::UnclosedConstruct {
                construct: "if",
                label,
                at: AT_END,
            });
        }

        let entry_function = self.session.options().entry_function.clone();
        if self.labels.offset_of(&entry_function).is_none() {
            return Err(CompileError::MissingEntry {
                name: entry_function,
            });
        }

        let entry = self.text.position();
        enc::xor_reg_reg(&mut self.text, Reg::Rbp, Reg::Rbp);
        let field = enc::call_rel32(&mut self.text, 0);
        self.labels.reference(&entry_function, field, &mut self.text)?;
        let field = enc::call_rel32(&mut self.text, 0);
        self.labels.reference(runtime::EXIT, field, &mut self.text)?;

        self.labels.check_resolved()?;

        self.session
            .record_sections(self.text.len(), self.data.len());
        let symbols = self.labels.resolved();
        let image = ElfImage::new(self.text, self.data, entry)?;
        Ok(CompiledProgram {
            image,
            symbols,
            runtime: self.runtime,
        })
    }
}
