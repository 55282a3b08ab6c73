//! Constant folding, compound-literal hoisting, and initializer expansion.
//!
//! Grounded on spec.md §4.4's `evaluate_constant_expression` contract and
//! `original_source/src/types.c`'s integer-promotion helpers (read via
//! `type_is_integer`/`type_is_arithmetic` usage patterns). Designator
//! resolution mirrors `struct{int x,y,z;} t = {.z=3, .x=2, 5};` from
//! spec.md §8 scenario 6: a positional item after a designator resumes
//! from the designated field's successor.

use crate::ast::{BinaryOp, Expr, ExprKind, IntLit, InitItem, Initializer, UnaryOp};
use crate::error::CompileError;
use crate::token::Symbol;
use crate::types::{SimpleKind, StructData, Type, TypeInterner, TypeKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Integer(Type, i64),
    Floating(Type, f64),
    /// Address of a named object/function plus a byte offset.
    LabelPointer(Symbol, i64),
    /// The label itself, untyped (used for function designators).
    Label(Symbol),
}

impl Constant {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Constant::Integer(_, v) => Some(*v),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Constant::Integer(_, v) => *v != 0,
            Constant::Floating(_, v) => *v != 0.0,
            Constant::LabelPointer(..) | Constant::Label(_) => true,
        }
    }
}

/// Attempts to reduce `expr` to a compile-time constant. Non-constant
/// subexpressions (loads, calls, non-constant pointer arithmetic) simply
/// return `None`, the way a recursive-descent folder gives up on the
/// first operand it can't reduce.
pub fn evaluate_constant_expression(expr: &Expr) -> Result<Option<Constant>, CompileError> {
    match &expr.kind {
        ExprKind::IntConstant(lit) => {
            let ty = expr
                .data_type
                .clone()
                .unwrap_or_else(default_int_type);
            let v = match lit {
                IntLit::Signed(v) => *v,
                IntLit::Unsigned(v) => *v as i64,
            };
            Ok(Some(Constant::Integer(ty, v)))
        }
        ExprKind::FloatConstant(v) => {
            let ty = expr.data_type.clone().unwrap_or_else(default_double_type);
            Ok(Some(Constant::Floating(ty, *v)))
        }
        ExprKind::Unary(op, inner) => {
            let Some(c) = evaluate_constant_expression(inner)? else {
                return Ok(None);
            };
            Ok(fold_unary(*op, c))
        }
        ExprKind::Binary(op, lhs, rhs) => {
            let (Some(l), Some(r)) = (
                evaluate_constant_expression(lhs)?,
                evaluate_constant_expression(rhs)?,
            ) else {
                return Ok(None);
            };
            fold_binary(*op, l, r, &expr.pos)
        }
        ExprKind::Cast { ty, operand } => {
            let Some(c) = evaluate_constant_expression(operand)? else {
                return Ok(None);
            };
            Ok(fold_cast(ty, c))
        }
        ExprKind::Conditional {
            cond,
            then_branch,
            else_branch,
        } => {
            let Some(c) = evaluate_constant_expression(cond)? else {
                return Ok(None);
            };
            if c.truthy() {
                evaluate_constant_expression(then_branch)
            } else {
                evaluate_constant_expression(else_branch)
            }
        }
        ExprKind::AddressOf(inner) => match &inner.kind {
            ExprKind::VarRef(name) => Ok(Some(Constant::LabelPointer(*name, 0))),
            ExprKind::CompoundLiteral { .. } => Ok(None), // hoisted separately
            _ => Ok(None),
        },
        ExprKind::SizeOfType(ty) => Ok(Some(Constant::Integer(default_ulong_type(), ty.size() as i64))),
        ExprKind::SizeOfExpr(inner) => match &inner.data_type {
            Some(ty) => Ok(Some(Constant::Integer(default_ulong_type(), ty.size() as i64))),
            None => Ok(None),
        },
        ExprKind::AlignOf(ty) => Ok(Some(Constant::Integer(default_ulong_type(), ty.align() as i64))),
        _ => Ok(None),
    }
}

fn default_int_type() -> Type {
    thread_local_interner(|t| t.simple(SimpleKind::Int))
}
fn default_double_type() -> Type {
    thread_local_interner(|t| t.simple(SimpleKind::Double))
}
fn default_ulong_type() -> Type {
    thread_local_interner(|t| t.simple(SimpleKind::ULong))
}

fn thread_local_interner<R>(f: impl FnOnce(&mut TypeInterner) -> R) -> R {
    thread_local! {
        static FALLBACK: std::cell::RefCell<TypeInterner> = std::cell::RefCell::new(TypeInterner::new());
    }
    FALLBACK.with(|t| f(&mut t.borrow_mut()))
}

fn fold_unary(op: UnaryOp, c: Constant) -> Option<Constant> {
    match (op, c) {
        (UnaryOp::Plus, c) => Some(c),
        (UnaryOp::Minus, Constant::Integer(t, v)) => Some(Constant::Integer(t, v.wrapping_neg())),
        (UnaryOp::Minus, Constant::Floating(t, v)) => Some(Constant::Floating(t, -v)),
        (UnaryOp::BitNot, Constant::Integer(t, v)) => Some(Constant::Integer(t, !v)),
        (UnaryOp::Not, Constant::Integer(t, v)) => Some(Constant::Integer(t, (v == 0) as i64)),
        (UnaryOp::Not, Constant::Floating(t, v)) => Some(Constant::Integer(t, (v == 0.0) as i64)),
        _ => None,
    }
}

fn fold_binary(
    op: BinaryOp,
    lhs: Constant,
    rhs: Constant,
    pos: &crate::token::SourcePos,
) -> Result<Option<Constant>, CompileError> {
    use BinaryOp::*;
    match (lhs, rhs) {
        (Constant::Integer(t, a), Constant::Integer(_, b)) => {
            let result = match op {
                Add => a.wrapping_add(b),
                Sub => a.wrapping_sub(b),
                Mul => a.wrapping_mul(b),
                Div => {
                    if b == 0 {
                        return Err(CompileError::diag(pos.clone(), "division by zero in constant expression"));
                    }
                    a.wrapping_div(b)
                }
                Mod => {
                    if b == 0 {
                        return Err(CompileError::diag(pos.clone(), "modulo by zero in constant expression"));
                    }
                    a.wrapping_rem(b)
                }
                Shl => a.wrapping_shl(b as u32 & 63),
                Shr => a.wrapping_shr(b as u32 & 63),
                BitXor => a ^ b,
                BitOr => a | b,
                BitAnd => a & b,
                Less => (a < b) as i64,
                Greater => (a > b) as i64,
                LessEq => (a <= b) as i64,
                GreaterEq => (a >= b) as i64,
                Equal => (a == b) as i64,
                NotEqual => (a != b) as i64,
                LogAnd => ((a != 0) && (b != 0)) as i64,
                LogOr => ((a != 0) || (b != 0)) as i64,
            };
            Ok(Some(Constant::Integer(t, result)))
        }
        (Constant::Floating(t, a), Constant::Floating(_, b)) => {
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                Less => return Ok(Some(Constant::Integer(default_int_type(), (a < b) as i64))),
                Greater => return Ok(Some(Constant::Integer(default_int_type(), (a > b) as i64))),
                LessEq => return Ok(Some(Constant::Integer(default_int_type(), (a <= b) as i64))),
                GreaterEq => return Ok(Some(Constant::Integer(default_int_type(), (a >= b) as i64))),
                Equal => return Ok(Some(Constant::Integer(default_int_type(), (a == b) as i64))),
                NotEqual => return Ok(Some(Constant::Integer(default_int_type(), (a != b) as i64))),
                _ => return Ok(None),
            };
            Ok(Some(Constant::Floating(t, result)))
        }
        _ => Ok(None),
    }
}

fn fold_cast(ty: &Type, c: Constant) -> Option<Constant> {
    if ty.is_floating() {
        let v = match c {
            Constant::Integer(_, v) => v as f64,
            Constant::Floating(_, v) => v,
            _ => return None,
        };
        return Some(Constant::Floating(ty.clone(), v));
    }
    if ty.is_integer() {
        let v = match c {
            Constant::Integer(_, v) => v,
            Constant::Floating(_, v) => v as i64,
            _ => return None,
        };
        return Some(Constant::Integer(ty.clone(), v));
    }
    None
}

/// One flattened initializer entry: a byte offset into the aggregate plus
/// its payload.
#[derive(Debug, Clone)]
pub enum InitPayload {
    Expr(std::rc::Rc<Expr>),
    Bytes(std::rc::Rc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct FlatInit {
    pub byte_offset: u64,
    pub bit_offset: Option<u32>,
    pub payload: InitPayload,
}

/// Expand a (possibly designated, possibly nested) initializer against
/// `ty`'s structure into a flat list of `(offset, payload)` writes.
pub fn expand_initializer(ty: &Type, init: &Initializer) -> Result<Vec<FlatInit>, CompileError> {
    let mut out = Vec::new();
    match &ty.0.kind {
        TypeKind::Struct(data) => expand_struct(data, init, 0, &mut out)?,
        TypeKind::Array(elem, len) => expand_array(elem, Some(*len), init, 0, &mut out)?,
        TypeKind::IncompleteArray(elem) => expand_array(elem, None, init, 0, &mut out)?,
        _ => {
            if let Some((_, InitItem::Single(e))) = init.items.first() {
                out.push(FlatInit {
                    byte_offset: 0,
                    bit_offset: None,
                    payload: InitPayload::Expr(e.clone()),
                });
            }
        }
    }
    Ok(out)
}

fn expand_struct(
    data: &std::rc::Rc<StructData>,
    init: &Initializer,
    base: u64,
    out: &mut Vec<FlatInit>,
) -> Result<(), CompileError> {
    let fields = data.fields.borrow();
    let mut cursor = 0usize;
    for (designators, item) in &init.items {
        if let Some(first) = designators.first() {
            if let Some(name) = first.field {
                cursor = fields
                    .iter()
                    .position(|f| f.name == Some(name))
                    .ok_or_else(|| CompileError::diag(crate::token::SourcePos::new("<init>", 0, 0), "no such member in designated initializer"))?;
            }
        }
        let Some(field) = fields.get(cursor) else { break };
        match item {
            InitItem::Single(e) => out.push(FlatInit {
                byte_offset: base + field.offset,
                bit_offset: if field.bitfield >= 0 { Some(field.bit_offset) } else { None },
                payload: InitPayload::Expr(e.clone()),
            }),
            InitItem::List(nested) => {
                let nested_init = Initializer {
                    items: nested.clone(),
                };
                expand_initializer_into(&field.ty, &nested_init, base + field.offset, out)?;
            }
        }
        cursor += 1;
    }
    Ok(())
}

fn expand_array(
    elem: &Type,
    len: Option<u64>,
    init: &Initializer,
    base: u64,
    out: &mut Vec<FlatInit>,
) -> Result<(), CompileError> {
    let elem_size = elem.size();
    let mut cursor: u64 = 0;
    for (designators, item) in &init.items {
        if let Some(first) = designators.first() {
            if let Some(idx_expr) = &first.index {
                if let Some(Constant::Integer(_, v)) = evaluate_constant_expression(idx_expr)? {
                    cursor = v as u64;
                }
            }
        }
        if let Some(n) = len {
            if cursor >= n {
                break;
            }
        }
        match item {
            InitItem::Single(e) => out.push(FlatInit {
                byte_offset: base + cursor * elem_size,
                bit_offset: None,
                payload: InitPayload::Expr(e.clone()),
            }),
            InitItem::List(nested) => {
                let nested_init = Initializer {
                    items: nested.clone(),
                };
                expand_initializer_into(elem, &nested_init, base + cursor * elem_size, out)?;
            }
        }
        cursor += 1;
    }
    Ok(())
}

fn expand_initializer_into(
    ty: &Type,
    init: &Initializer,
    base: u64,
    out: &mut Vec<FlatInit>,
) -> Result<(), CompileError> {
    match &ty.0.kind {
        TypeKind::Struct(data) => expand_struct(data, init, base, out),
        TypeKind::Array(elem, len) => expand_array(elem, Some(*len), init, base, out),
        TypeKind::IncompleteArray(elem) => expand_array(elem, None, init, base, out),
        _ => {
            if let Some((_, InitItem::Single(e))) = init.items.first() {
                out.push(FlatInit {
                    byte_offset: base,
                    bit_offset: None,
                    payload: InitPayload::Expr(e.clone()),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SourcePos;

    fn pos() -> SourcePos {
        SourcePos::new("t.c", 1, 1)
    }

    fn int(v: i64) -> Expr {
        Expr::new(ExprKind::IntConstant(IntLit::Signed(v)), pos())
    }

    #[test]
    fn folds_simple_arithmetic() {
        let e = Expr::new(
            ExprKind::Binary(BinaryOp::Add, std::rc::Rc::new(int(1)), std::rc::Rc::new(int(2))),
            pos(),
        );
        let c = evaluate_constant_expression(&e).unwrap().unwrap();
        assert_eq!(c.as_i64(), Some(3));
    }

    #[test]
    fn division_by_zero_is_fatal() {
        let e = Expr::new(
            ExprKind::Binary(BinaryOp::Div, std::rc::Rc::new(int(1)), std::rc::Rc::new(int(0))),
            pos(),
        );
        assert!(evaluate_constant_expression(&e).is_err());
    }

    #[test]
    fn conditional_picks_live_branch() {
        let e = Expr::new(
            ExprKind::Conditional {
                cond: std::rc::Rc::new(int(1)),
                then_branch: std::rc::Rc::new(int(5)),
                else_branch: std::rc::Rc::new(Expr::new(
                    ExprKind::Binary(BinaryOp::Div, std::rc::Rc::new(int(1)), std::rc::Rc::new(int(0))),
                    pos(),
                )),
            },
            pos(),
        );
        let c = evaluate_constant_expression(&e).unwrap().unwrap();
        assert_eq!(c.as_i64(), Some(5));
    }

    #[test]
    fn designated_initializer_resumes_after_designator() {
        let mut t = TypeInterner::new();
        let int_ty = t.simple(SimpleKind::Int);
        let struct_ty = t.register_struct(None, false);
        let TypeKind::Struct(data) = &struct_ty.0.kind else { unreachable!() };
        {
            let mut fields = data.fields.borrow_mut();
            for (i, name) in ["x", "y", "z"].iter().enumerate() {
                fields.push(crate::types::Field {
                    name: Some(crate::token::intern(name)),
                    ty: int_ty.clone(),
                    bitfield: -1,
                    offset: (i as u64) * 4,
                    bit_offset: 0,
                });
            }
        }
        let z = crate::token::intern("z");
        let x = crate::token::intern("x");
        let init = Initializer {
            items: vec![
                (
                    vec![crate::ast::Designator { field: Some(z), index: None }],
                    InitItem::Single(std::rc::Rc::new(int(3))),
                ),
                (
                    vec![crate::ast::Designator { field: Some(x), index: None }],
                    InitItem::Single(std::rc::Rc::new(int(2))),
                ),
                (vec![], InitItem::Single(std::rc::Rc::new(int(5)))),
            ],
        };
        let flat = expand_initializer(&struct_ty, &init).unwrap();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0].byte_offset, 8); // z
        assert_eq!(flat[1].byte_offset, 0); // x
        assert_eq!(flat[2].byte_offset, 4); // y, positional after x
    }
}
