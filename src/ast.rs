// This module defines the syntax tree and symbol table dslc consumes from the front end.
// Tokenizing, parsing and tree simplification happen elsewhere; what arrives here is a tree
// of typed nodes allocated in the compilation session's bumpalo arena (number literals,
// identifiers, binary and unary operators, assignments, conditionals, loops, function
// definitions and calls) plus a table mapping each identifier occurrence to its
// declaration: name, kind (local, parameter, global, function) and host function.
// AstBuilder is the construction API used by front ends and tests.

//! Arena-allocated syntax tree and symbol table.

use crate::core::CompilationSession;
use hashbrown::HashMap;
use std::fmt;

/// Index into a [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Local,
    Param,
    /// Lives in `.data`, not in a register.
    Global,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Function whose scope declares the symbol; `None` at top level.
    pub host: Option<SymbolId>,
}

/// Declarations, keyed by name within a host scope.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<(Option<SymbolId>, String), SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name` in `host`, returning the existing id on redeclaration.
    pub fn declare(&mut self, name: &str, kind: SymbolKind, host: Option<SymbolId>) -> SymbolId {
        let key = (host, name.to_string());
        if let Some(&id) = self.by_name.get(&key) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.to_string(),
            kind,
            host,
        });
        self.by_name.insert(key, id);
        id
    }

    pub fn lookup(&self, name: &str, host: Option<SymbolId>) -> Option<SymbolId> {
        self.by_name.get(&(host, name.to_string())).copied()
    }

    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0 as usize)
    }

    /// Name of `id`, or `?` for an id this table never issued.
    pub fn name(&self, id: SymbolId) -> &str {
        self.get(id).map_or("?", |symbol| symbol.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    NotEqual,
    Equal,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        !matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Greater => ">",
            BinaryOp::Less => "<",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::LessEqual => "<=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Equal => "==",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Sqrt,
}

/// Statement list.
pub type Block<'a> = &'a [&'a Node<'a>];

/// A syntax tree node.
#[derive(Debug, PartialEq, Eq)]
pub enum Node<'a> {
    Number(i64),
    Ident(SymbolId),
    Binary {
        op: BinaryOp,
        lhs: &'a Node<'a>,
        rhs: &'a Node<'a>,
    },
    Unary {
        op: UnaryOp,
        operand: &'a Node<'a>,
    },
    Assign {
        target: SymbolId,
        value: &'a Node<'a>,
    },
    If {
        cond: &'a Node<'a>,
        body: Block<'a>,
    },
    While {
        cond: &'a Node<'a>,
        body: Block<'a>,
    },
    FunctionDef {
        name: SymbolId,
        params: &'a [SymbolId],
        body: Block<'a>,
    },
    Call {
        callee: SymbolId,
        args: &'a [&'a Node<'a>],
    },
}

impl Node<'_> {
    /// Short description used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Number(_) => "number",
            Node::Ident(_) => "identifier",
            Node::Binary { op, .. } if op.is_comparison() => "comparison",
            Node::Binary { .. } => "binary operation",
            Node::Unary { .. } => "unary operation",
            Node::Assign { .. } => "assignment",
            Node::If { .. } => "if",
            Node::While { .. } => "while",
            Node::FunctionDef { .. } => "function definition",
            Node::Call { .. } => "call",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Builds nodes in the session arena.
pub struct AstBuilder<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
}

impl<'s, 'arena> AstBuilder<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>) -> Self {
        Self { session }
    }

    pub fn number(&self, value: i64) -> &'arena Node<'arena> {
        self.session.alloc(Node::Number(value))
    }

    pub fn ident(&self, id: SymbolId) -> &'arena Node<'arena> {
        self.session.alloc(Node::Ident(id))
    }

    pub fn binary(
        &self,
        op: BinaryOp,
        lhs: &'arena Node<'arena>,
        rhs: &'arena Node<'arena>,
    ) -> &'arena Node<'arena> {
        self.session.alloc(Node::Binary { op, lhs, rhs })
    }

    pub fn unary(&self, op: UnaryOp, operand: &'arena Node<'arena>) -> &'arena Node<'arena> {
        self.session.alloc(Node::Unary { op, operand })
    }

    pub fn assign(&self, target: SymbolId, value: &'arena Node<'arena>) -> &'arena Node<'arena> {
        self.session.alloc(Node::Assign { target, value })
    }

    pub fn block<I>(&self, statements: I) -> Block<'arena>
    where
        I: IntoIterator<Item = &'arena Node<'arena>>,
        I::IntoIter: ExactSizeIterator,
    {
        self.session.alloc_slice(statements)
    }

    pub fn if_then<I>(&self, cond: &'arena Node<'arena>, body: I) -> &'arena Node<'arena>
    where
        I: IntoIterator<Item = &'arena Node<'arena>>,
        I::IntoIter: ExactSizeIterator,
    {
        let body = self.block(body);
        self.session.alloc(Node::If { cond, body })
    }

    pub fn while_loop<I>(&self, cond: &'arena Node<'arena>, body: I) -> &'arena Node<'arena>
    where
        I: IntoIterator<Item = &'arena Node<'arena>>,
        I::IntoIter: ExactSizeIterator,
    {
        let body = self.block(body);
        self.session.alloc(Node::While { cond, body })
    }

    pub fn function<P, I>(&self, name: SymbolId, params: P, body: I) -> &'arena Node<'arena>
    where
        P: IntoIterator<Item = SymbolId>,
        P::IntoIter: ExactSizeIterator,
        I: IntoIterator<Item = &'arena Node<'arena>>,
        I::IntoIter: ExactSizeIterator,
    {
        let params = self.session.alloc_slice(params);
        let body = self.block(body);
        self.session.alloc(Node::FunctionDef { name, params, body })
    }

    pub fn call<I>(&self, callee: SymbolId, args: I) -> &'arena Node<'arena>
    where
        I: IntoIterator<Item = &'arena Node<'arena>>,
        I::IntoIter: ExactSizeIterator,
    {
        let args = self.block(args);
        self.session.alloc(Node::Call { callee, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_symbols_are_scoped_by_host() {
        let mut symbols = SymbolTable::new();
        let main = symbols.declare("main", SymbolKind::Function, None);
        let f = symbols.declare("f", SymbolKind::Function, None);
        let x_main = symbols.declare("x", SymbolKind::Local, Some(main));
        let x_f = symbols.declare("x", SymbolKind::Local, Some(f));

        assert_ne!(x_main, x_f);
        assert_eq!(symbols.declare("x", SymbolKind::Local, Some(main)), x_main);
        assert_eq!(symbols.lookup("x", Some(f)), Some(x_f));
        assert_eq!(symbols.lookup("x", None), None);
        assert_eq!(symbols.name(x_f), "x");
        assert_eq!(symbols.len(), 4);
    }

    #[test]
    fn test_builder_allocates_in_arena() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let ast = AstBuilder::new(&session);

        let sum = ast.binary(BinaryOp::Add, ast.number(1), ast.number(2));
        let stmt = ast.while_loop(ast.ident(SymbolId(0)), [sum]);

        match stmt {
            Node::While { cond, body } => {
                assert_eq!(**cond, Node::Ident(SymbolId(0)));
                assert_eq!(body.len(), 1);
                assert_eq!(body[0].kind_name(), "binary operation");
            }
            other => panic!("unexpected node {other:?}"),
        }
        assert!(arena.allocated_bytes() > 0);
    }
}
