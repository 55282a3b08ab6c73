//! Expression, declaration and initializer nodes produced by the parser.
//!
//! Grounded on spec.md §4.4's node list and `original_source/src/types.h`'s
//! `struct expr` family (inferred from its `type_sizeof`/`struct expr *`
//! forward declarations). Every expression carries a resolved `data_type`
//! once type checking has run over it.

use std::rc::Rc;

use crate::token::{SourcePos, Symbol};
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitXor,
    BitOr,
    BitAnd,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Equal,
    NotEqual,
    LogAnd,
    LogOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Plain,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitXor,
    BitOr,
    BitAnd,
}

#[derive(Debug, Clone)]
pub struct Designator {
    pub field: Option<Symbol>,
    pub index: Option<Rc<Expr>>,
}

#[derive(Debug, Clone)]
pub enum InitItem {
    Single(Rc<Expr>),
    List(Vec<(Vec<Designator>, InitItem)>),
}

#[derive(Debug, Clone)]
pub struct Initializer {
    pub items: Vec<(Vec<Designator>, InitItem)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntLit {
    Signed(i64),
    Unsigned(u64),
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    VarRef(Symbol),
    IntConstant(IntLit),
    FloatConstant(f64),
    StringConstant(Rc<[u8]>),
    CompoundLiteral {
        ty: Type,
        init: Rc<Initializer>,
    },
    Call {
        callee: Rc<Expr>,
        args: Vec<Rc<Expr>>,
    },
    Member {
        base: Rc<Expr>,
        field: Symbol,
        arrow: bool,
    },
    AddressOf(Rc<Expr>),
    Indirection(Rc<Expr>),
    Unary(UnaryOp, Rc<Expr>),
    Binary(BinaryOp, Rc<Expr>, Rc<Expr>),
    Cast {
        ty: Type,
        operand: Rc<Expr>,
    },
    PointerAdd {
        ptr: Rc<Expr>,
        index: Rc<Expr>,
    },
    PointerSub {
        ptr: Rc<Expr>,
        index: Rc<Expr>,
    },
    PointerDiff {
        lhs: Rc<Expr>,
        rhs: Rc<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Rc<Expr>,
        value: Rc<Expr>,
    },
    Conditional {
        cond: Rc<Expr>,
        then_branch: Rc<Expr>,
        else_branch: Rc<Expr>,
    },
    Comma(Rc<Expr>, Rc<Expr>),
    ArrayToPointerDecay(Rc<Expr>),
    Index {
        base: Rc<Expr>,
        index: Rc<Expr>,
    },
    VaStart {
        va_list: Rc<Expr>,
        last_named: Symbol,
    },
    VaEnd(Rc<Expr>),
    VaArg {
        va_list: Rc<Expr>,
        ty: Type,
    },
    VaCopy {
        dst: Rc<Expr>,
        src: Rc<Expr>,
    },
    AlignOf(Type),
    SizeOfType(Type),
    SizeOfExpr(Rc<Expr>),
    GenericSelection {
        controlling: Rc<Expr>,
        assocs: Vec<(Option<Type>, Rc<Expr>)>,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub pos: SourcePos,
    pub data_type: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, pos: SourcePos) -> Self {
        Expr {
            kind,
            pos,
            data_type: None,
        }
    }

    pub fn with_type(mut self, ty: Type) -> Self {
        self.data_type = Some(ty);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<Symbol>,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub enum DeclKind {
    Function {
        name: Symbol,
        is_global: bool,
        params: Vec<Param>,
        variadic: bool,
        body: Option<Vec<Stmt>>,
    },
    Variable {
        name: Symbol,
        ty: Type,
        is_global: bool,
        is_static: bool,
        init: Option<Initializer>,
    },
    /// `struct S;` / `struct S { ... };` with no variable declared.
    TypeOnly(Type),
}

#[derive(Debug, Clone)]
pub struct Decl {
    pub kind: DeclKind,
    pub pos: SourcePos,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Rc<Expr>),
    Decl(Decl),
    Compound(Vec<Stmt>),
    If {
        cond: Rc<Expr>,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Rc<Expr>,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Rc<Expr>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Rc<Expr>>,
        step: Option<Rc<Expr>>,
        body: Box<Stmt>,
    },
    Return(Option<Rc<Expr>>),
    Break,
    Continue,
    Switch {
        control: Rc<Expr>,
        body: Box<Stmt>,
    },
    Case(i64, Box<Stmt>),
    Default(Box<Stmt>),
    Label(Symbol, Box<Stmt>),
    Goto(Symbol),
    Null,
}

/// A whole translation unit: top-level declarations in source order.
#[derive(Debug, Clone, Default)]
pub struct TranslationUnit {
    pub decls: Vec<Decl>,
}
