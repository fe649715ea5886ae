// This module lowers the syntax tree to the linear IR. Every named variable of a function is
// bound to one virtual register on first reference and keeps it for the whole function;
// the register counter is monotonic for the entire compile, so no register is ever reused
// by another variable or another function. Arithmetic is emitted in place on the left
// operand's register unless that register is the home of a variable other than the
// assignment target, in which case the value is first copied into the target or a fresh
// temporary. Conditions become the operands of a `while`/`if` instruction; a bare value is
// compared against zero. Loop conditions that need setup instructions get those re-emitted
// at the end of the body so every iteration tests fresh values. Construct labels come from
// a per-compile counter. Globals live in .data and go through `store`/`set tmp, NAME`.
// Recursion depth is bounded by the session's max_nesting.

//! AST to IR lowering.

use crate::ast::{BinaryOp, Block, Node, SymbolId, SymbolKind, SymbolTable, UnaryOp};
use crate::core::{CompilationSession, CompileError, CompileResult, Diagnostic};
use crate::ir::{Comparison, Instruction, Opcode, Operand, VirtualRegister};
use crate::x64::Reg;
use hashbrown::{HashMap, HashSet};

/// Name of the formatted-read builtin.
pub const SCANF: &str = "scanf";
/// Name of the formatted-write builtin.
pub const PRINTF: &str = "printf";
/// Exit builtin; `exit(x)` lowers to `call exit_with, x`.
pub const EXIT: &str = "exit";
pub const EXIT_WITH: &str = "exit_with";
pub const SQRT: &str = "sqrt";

/// Arguments, and so parameters, that fit the argument registers.
const MAX_CALL_ARGS: usize = 2;

/// Lower a whole program. Top-level statements other than function
/// definitions are reported and skipped.
pub fn lower_program(
    session: &CompilationSession<'_>,
    symbols: &SymbolTable,
    program: Block<'_>,
) -> CompileResult<Vec<Instruction>> {
    let mut lowering = Lowering::new(session, symbols);
    for node in program {
        lowering.lower_top_level(node)?;
    }
    Ok(lowering.finish())
}

/// Lowering state for one compile.
pub struct Lowering<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    symbols: &'s SymbolTable,
    program: Vec<Instruction>,
    /// Variable homes of the current function.
    env: HashMap<SymbolId, VirtualRegister>,
    homes: HashSet<VirtualRegister>,
    next_register: u32,
    next_label: u32,
    depth: usize,
}

impl<'s, 'arena> Lowering<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, symbols: &'s SymbolTable) -> Self {
        Self {
            session,
            symbols,
            program: Vec::new(),
            env: HashMap::new(),
            homes: HashSet::new(),
            // r0 is the return register.
            next_register: 1,
            next_label: 0,
            depth: 0,
        }
    }

    pub fn finish(self) -> Vec<Instruction> {
        self.program
    }

    fn emit(&mut self, instruction: Instruction) {
        log::trace!("lower: {instruction}");
        self.program.push(instruction);
    }

    fn fresh_register(&mut self) -> VirtualRegister {
        let reg = VirtualRegister(self.next_register);
        self.next_register += 1;
        self.session.record_register_allocated();
        reg
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let label = format!("{prefix}_{}", self.next_label);
        self.next_label += 1;
        label
    }

    fn variable_register(&mut self, id: SymbolId) -> VirtualRegister {
        if let Some(&reg) = self.env.get(&id) {
            return reg;
        }
        let reg = self.fresh_register();
        self.env.insert(id, reg);
        self.homes.insert(reg);
        reg
    }

    fn is_global(&self, id: SymbolId) -> bool {
        matches!(
            self.symbols.get(id).map(|symbol| symbol.kind),
            Some(SymbolKind::Global)
        )
    }

    fn enter(&mut self) -> CompileResult<()> {
        self.depth += 1;
        let limit = self.session.options().max_nesting;
        if self.depth > limit {
            return Err(CompileError::NestingTooDeep { limit });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    pub fn lower_top_level(&mut self, node: &Node<'_>) -> CompileResult<()> {
        match node {
            Node::FunctionDef { name, params, body } => self.lower_function(*name, params, body),
            other => {
                self.session
                    .report(Diagnostic::OutsideFunction(other.kind_name().to_string()));
                Ok(())
            }
        }
    }

    fn lower_function(
        &mut self,
        name: SymbolId,
        params: &[SymbolId],
        body: Block<'_>,
    ) -> CompileResult<()> {
        let function_name = self.symbols.name(name).to_string();
        if params.len() > MAX_CALL_ARGS {
            self.session.report(Diagnostic::UnsupportedCall {
                name: function_name,
                reason: "more than two parameters".to_string(),
            });
            return Ok(());
        }

        self.env.clear();
        self.homes.clear();
        self.emit(Instruction::function(function_name));
        for &param in params {
            let reg = self.variable_register(param);
            let param_name = self.symbols.name(param).to_string();
            self.emit(Instruction::param(param_name, reg));
        }

        self.lower_block(body)?;
        self.emit(Instruction::end_function());
        Ok(())
    }

    fn lower_block(&mut self, block: Block<'_>) -> CompileResult<()> {
        for statement in block {
            self.lower_statement(statement)?;
        }
        Ok(())
    }

    fn lower_statement(&mut self, node: &Node<'_>) -> CompileResult<()> {
        self.enter()?;
        match node {
            Node::If { cond, body } => {
                let label = self.fresh_label("if");
                let start = self.program.len();
                let (cmp, lhs, rhs) = match self.lower_condition(cond)? {
                    Some(condition) => condition,
                    None => {
                        self.program.truncate(start);
                        self.leave();
                        return Ok(());
                    }
                };
                self.emit(Instruction::if_then(cmp, lhs, rhs, label));
                self.lower_block(body)?;
                self.emit(Instruction::end_if());
            }
            Node::While { cond, body } => {
                let label = self.fresh_label("while");
                let start = self.program.len();
                let (cmp, lhs, rhs) = match self.lower_condition(cond)? {
                    Some(condition) => condition,
                    None => {
                        self.program.truncate(start);
                        self.leave();
                        return Ok(());
                    }
                };
                let setup: Vec<Instruction> = self.program[start..].to_vec();
                self.emit(Instruction::while_loop(cmp, lhs, rhs, label));
                self.lower_block(body)?;
                for instruction in setup {
                    self.emit(instruction);
                }
                self.emit(Instruction::end_while());
            }
            Node::FunctionDef { name, params, body } => {
                // Codegen rejects nested functions as a structural error.
                let saved_env = std::mem::take(&mut self.env);
                let saved_homes = std::mem::take(&mut self.homes);
                self.lower_function(*name, params, body)?;
                self.env = saved_env;
                self.homes = saved_homes;
            }
            expression => {
                self.lower_expression(expression, None)?;
            }
        }
        self.leave();
        Ok(())
    }

    /// Lower a condition into `while`/`if` operands.
    fn lower_condition(
        &mut self,
        cond: &Node<'_>,
    ) -> CompileResult<Option<(Comparison, VirtualRegister, Operand)>> {
        if let Node::Binary { op, lhs, rhs } = cond {
            if let Some(cmp) = comparison_of(*op) {
                let Some(lhs) = self.lower_expression(lhs, None)? else {
                    return Ok(None);
                };
                let rhs = match rhs {
                    Node::Number(value) => Operand::Imm(*value),
                    other => match self.lower_expression(other, None)? {
                        Some(reg) => Operand::Reg(reg),
                        None => return Ok(None),
                    },
                };
                return Ok(Some((cmp, lhs, rhs)));
            }
        }

        Ok(self
            .lower_expression(cond, None)?
            .map(|reg| (Comparison::Greater, reg, Operand::Imm(0))))
    }

    /// Lower an expression; `target` is the register of the variable being
    /// assigned when this is the top of an assignment's right-hand side.
    ///
    /// Returns `None` when a diagnostic was reported.
    pub fn lower_expression(
        &mut self,
        node: &Node<'_>,
        target: Option<VirtualRegister>,
    ) -> CompileResult<Option<VirtualRegister>> {
        self.enter()?;
        let result = match node {
            Node::Number(value) => {
                let reg = target.unwrap_or_else(|| self.fresh_register());
                self.emit(Instruction::set(reg, *value));
                Some(reg)
            }
            Node::Ident(id) if self.is_global(*id) => {
                let reg = target.unwrap_or_else(|| self.fresh_register());
                let name = self.symbols.name(*id).to_string();
                self.emit(Instruction::set(reg, Operand::Var(name)));
                Some(reg)
            }
            Node::Ident(id) => Some(self.variable_register(*id)),
            Node::Binary { op, lhs, rhs } => match arithmetic_of(*op) {
                Some(opcode) => self.lower_arithmetic(opcode, lhs, rhs, target)?,
                None => {
                    self.session.report(Diagnostic::UnsupportedExpression(format!(
                        "comparison `{op}`"
                    )));
                    None
                }
            },
            Node::Unary { op, operand } => {
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Sqrt => Opcode::Sqrt,
                };
                self.lower_unary(opcode, operand, target)?
            }
            Node::Assign { target: var, value } => self.lower_assignment(*var, value)?,
            Node::Call { callee, args } => self.lower_call(*callee, args, target)?,
            other => {
                self.session
                    .report(Diagnostic::UnsupportedExpression(other.kind_name().to_string()));
                None
            }
        };
        self.leave();
        Ok(result)
    }

    /// Register an in-place operation may write without clobbering a
    /// variable other than `target`.
    fn writable(
        &mut self,
        value: VirtualRegister,
        target: Option<VirtualRegister>,
        avoid: Option<VirtualRegister>,
    ) -> VirtualRegister {
        if !self.homes.contains(&value) || Some(value) == target {
            return value;
        }
        let dst = match target {
            Some(target) if Some(target) != avoid => target,
            _ => self.fresh_register(),
        };
        self.emit(Instruction::set(dst, value));
        dst
    }

    fn lower_arithmetic(
        &mut self,
        opcode: Opcode,
        lhs: &Node<'_>,
        rhs: &Node<'_>,
        target: Option<VirtualRegister>,
    ) -> CompileResult<Option<VirtualRegister>> {
        let Some(left) = self.lower_expression(lhs, None)? else {
            return Ok(None);
        };
        let Some(right) = self.lower_expression(rhs, None)? else {
            return Ok(None);
        };
        let dst = self.writable(left, target, Some(right));
        self.emit(Instruction::binary(opcode, dst, right));
        Ok(Some(dst))
    }

    fn lower_unary(
        &mut self,
        opcode: Opcode,
        operand: &Node<'_>,
        target: Option<VirtualRegister>,
    ) -> CompileResult<Option<VirtualRegister>> {
        let Some(value) = self.lower_expression(operand, None)? else {
            return Ok(None);
        };
        let dst = self.writable(value, target, None);
        self.emit(Instruction::new(opcode, vec![Operand::Reg(dst)]));
        Ok(Some(dst))
    }

    fn lower_assignment(
        &mut self,
        var: SymbolId,
        value: &Node<'_>,
    ) -> CompileResult<Option<VirtualRegister>> {
        if self.is_global(var) {
            let Some(reg) = self.lower_expression(value, None)? else {
                return Ok(None);
            };
            let name = self.symbols.name(var).to_string();
            self.emit(Instruction::store(name, reg));
            return Ok(Some(reg));
        }

        let home = self.variable_register(var);
        let Some(reg) = self.lower_expression(value, Some(home))? else {
            return Ok(None);
        };
        if reg != home {
            self.emit(Instruction::set(home, reg));
        }
        Ok(Some(home))
    }

    fn lower_call(
        &mut self,
        callee: SymbolId,
        args: &[&Node<'_>],
        target: Option<VirtualRegister>,
    ) -> CompileResult<Option<VirtualRegister>> {
        let name = self.symbols.name(callee).to_string();
        let unsupported = |reason: &str| Diagnostic::UnsupportedCall {
            name: name.clone(),
            reason: reason.to_string(),
        };

        match (name.as_str(), args) {
            (SQRT, [operand]) => self.lower_unary(Opcode::Sqrt, operand, target),
            (PRINTF, [value]) => {
                let Some(reg) = self.lower_expression(value, None)? else {
                    return Ok(None);
                };
                self.emit(Instruction::set(Operand::Abi(Reg::Rdi), reg));
                self.emit(Instruction::call(PRINTF, &[]));
                Ok(Some(reg))
            }
            (SCANF, [Node::Ident(var)]) => {
                self.emit(Instruction::call(SCANF, &[]));
                if self.is_global(*var) {
                    let var_name = self.symbols.name(*var).to_string();
                    self.emit(Instruction::store(var_name, VirtualRegister::RETURN));
                    Ok(Some(VirtualRegister::RETURN))
                } else {
                    let home = self.variable_register(*var);
                    self.emit(Instruction::set(home, VirtualRegister::RETURN));
                    Ok(Some(home))
                }
            }
            (EXIT, []) => {
                self.emit(Instruction::call(EXIT, &[]));
                Ok(Some(VirtualRegister::RETURN))
            }
            (EXIT, [status]) => {
                let Some(reg) = self.lower_expression(status, None)? else {
                    return Ok(None);
                };
                self.emit(Instruction::call(EXIT_WITH, &[reg]));
                Ok(Some(reg))
            }
            (SQRT | PRINTF | SCANF, _) => {
                self.session
                    .report(unsupported("expects exactly one argument"));
                Ok(None)
            }
            (_, args) if args.len() > MAX_CALL_ARGS => {
                self.session.report(unsupported("more than two arguments"));
                Ok(None)
            }
            (_, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    match self.lower_expression(arg, None)? {
                        Some(reg) => values.push(reg),
                        None => return Ok(None),
                    }
                }
                for (reg, abi) in values.iter().zip([Reg::Rdi, Reg::Rsi]) {
                    self.emit(Instruction::set(Operand::Abi(abi), *reg));
                }
                self.emit(Instruction::call(name.as_str(), &[]));

                let dst = target.unwrap_or_else(|| self.fresh_register());
                self.emit(Instruction::set(dst, VirtualRegister::RETURN));
                Ok(Some(dst))
            }
        }
    }
}

fn comparison_of(op: BinaryOp) -> Option<Comparison> {
    Some(match op {
        BinaryOp::Greater => Comparison::Greater,
        BinaryOp::Less => Comparison::Less,
        BinaryOp::GreaterEqual => Comparison::GreaterEqual,
        BinaryOp::LessEqual => Comparison::LessEqual,
        BinaryOp::NotEqual => Comparison::NotEqual,
        BinaryOp::Equal => Comparison::Equal,
        _ => return None,
    })
}

fn arithmetic_of(op: BinaryOp) -> Option<Opcode> {
    Some(match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Pow => Opcode::Pow,
        _ => return None,
    })
}
