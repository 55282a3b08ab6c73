//! Hash-consed C type system.
//!
//! Grounded on `original_source/src/types.h`/`types.c`: the interface
//! guarantees that two types are equal iff their `Rc` pointers are equal,
//! the same way the original guarantees pointer equality through its
//! `type_simple`/`type_pointer`/... constructor functions and an internal
//! hash map. `struct`/`enum` identity is by the `register_struct`/
//! `register_enum` call that allocated them, not by name — two `struct
//! Foo` forward declarations unify only once resolved to the same
//! `StructData` slot.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::Expr;
use crate::error::CompileError;
use crate::token::{SourcePos, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleKind {
    Void,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LLong,
    ULLong,
    Float,
    Double,
    LDouble,
    Bool,
    FloatComplex,
    DoubleComplex,
    LDoubleComplex,
}

impl SimpleKind {
    /// Storage size in bytes on the x86-64 System V ABI.
    pub fn size(self) -> u64 {
        use SimpleKind::*;
        match self {
            Void => 0,
            Char | SChar | UChar | Bool => 1,
            Short | UShort => 2,
            Int | UInt | Float => 4,
            Long | ULong | LLong | ULLong | Double => 8,
            LDouble => 16,
            FloatComplex => 8,
            DoubleComplex => 16,
            LDoubleComplex => 32,
        }
    }

    pub fn align(self) -> u64 {
        use SimpleKind::*;
        match self {
            LDouble | LDoubleComplex => 16,
            _ => self.size().max(1),
        }
    }

    pub fn is_signed(self) -> bool {
        use SimpleKind::*;
        matches!(self, Char | SChar | Short | Int | Long | LLong)
    }

    pub fn is_integer(self) -> bool {
        use SimpleKind::*;
        matches!(
            self,
            Char | SChar | UChar | Short | UShort | Int | UInt | Long | ULong | LLong | ULLong | Bool
        )
    }

    pub fn is_floating(self) -> bool {
        use SimpleKind::*;
        matches!(self, Float | Double | LDouble | FloatComplex | DoubleComplex | LDoubleComplex)
    }
}

#[derive(Debug)]
pub struct Field {
    pub name: Option<Symbol>,
    pub ty: Type,
    /// `-1` means not a bit-field.
    pub bitfield: i32,
    pub offset: u64,
    pub bit_offset: u32,
}

/// Identity of a struct/union is this allocation, not its name: two
/// separate `register_struct()` calls never compare equal even if later
/// given the same name.
pub struct StructData {
    pub name: Option<Symbol>,
    pub is_complete: RefCell<bool>,
    pub is_union: bool,
    pub is_packed: bool,
    pub fields: RefCell<Vec<Field>>,
    pub alignment: RefCell<u64>,
    pub size: RefCell<u64>,
    pub flexible: RefCell<bool>,
}

impl fmt::Debug for StructData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructData")
            .field("name", &self.name)
            .field("is_complete", &*self.is_complete.borrow())
            .finish()
    }
}

pub struct EnumData {
    pub name: Option<Symbol>,
    pub is_complete: RefCell<bool>,
}

impl fmt::Debug for EnumData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumData").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
pub enum TypeKind {
    Simple(SimpleKind),
    Pointer(Type),
    Array(Type, u64),
    IncompleteArray(Type),
    /// Length not yet known to be constant; evaluated lazily on first
    /// size query (spec.md Open Question, decided in DESIGN.md).
    VariableLengthArray {
        element: Type,
        length_expr: Rc<Expr>,
        evaluated: RefCell<Option<u64>>,
    },
    Function {
        ret: Type,
        params: Vec<Type>,
        variadic: bool,
    },
    Struct(Rc<StructData>),
    Enum(Rc<EnumData>),
}

/// A hash-consed C type: cheap to clone, compares by pointer identity.
#[derive(Clone)]
pub struct Type(pub Rc<TypeNode>);

#[derive(Debug)]
pub struct TypeNode {
    pub kind: TypeKind,
    pub is_const: bool,
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Type {}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.kind)
    }
}

#[derive(PartialEq, Eq, Hash)]
enum TypeKey {
    Simple(SimpleKind, bool),
    Pointer(usize, bool),
    Array(usize, u64, bool),
    IncompleteArray(usize, bool),
}

/// Owns every interned type node, keyed so that structurally identical
/// simple/pointer/array types always return the same `Rc`. `struct`,
/// `enum`, function and VLA types are never deduplicated by structure —
/// they're identified by the `Rc<StructData>`/`Rc<EnumData>` allocation,
/// or (for function/VLA types) simply not hash-consed, matching the
/// original's treatment of those as always-fresh compound nodes.
#[derive(Default)]
pub struct TypeInterner {
    table: HashMap<TypeKey, Type>,
}

impl TypeInterner {
    pub fn new() -> Self {
        TypeInterner::default()
    }

    fn key_for_ptr(t: &Type) -> usize {
        Rc::as_ptr(&t.0) as usize
    }

    pub fn simple(&mut self, kind: SimpleKind) -> Type {
        self.simple_const(kind, false)
    }

    pub fn simple_const(&mut self, kind: SimpleKind, is_const: bool) -> Type {
        let key = TypeKey::Simple(kind, is_const);
        if let Some(t) = self.table.get(&key) {
            return t.clone();
        }
        let t = Type(Rc::new(TypeNode {
            kind: TypeKind::Simple(kind),
            is_const,
        }));
        self.table.insert(key, t.clone());
        t
    }

    pub fn pointer(&mut self, pointee: Type) -> Type {
        let key = TypeKey::Pointer(Self::key_for_ptr(&pointee), false);
        if let Some(t) = self.table.get(&key) {
            return t.clone();
        }
        let t = Type(Rc::new(TypeNode {
            kind: TypeKind::Pointer(pointee),
            is_const: false,
        }));
        self.table.insert(key, t.clone());
        t
    }

    pub fn array(&mut self, element: Type, length: u64) -> Type {
        let key = TypeKey::Array(Self::key_for_ptr(&element), length, false);
        if let Some(t) = self.table.get(&key) {
            return t.clone();
        }
        let t = Type(Rc::new(TypeNode {
            kind: TypeKind::Array(element, length),
            is_const: false,
        }));
        self.table.insert(key, t.clone());
        t
    }

    pub fn incomplete_array(&mut self, element: Type) -> Type {
        let key = TypeKey::IncompleteArray(Self::key_for_ptr(&element), false);
        if let Some(t) = self.table.get(&key) {
            return t.clone();
        }
        let t = Type(Rc::new(TypeNode {
            kind: TypeKind::IncompleteArray(element),
            is_const: false,
        }));
        self.table.insert(key, t.clone());
        t
    }

    pub fn variable_length_array(&mut self, element: Type, length_expr: Rc<Expr>) -> Type {
        Type(Rc::new(TypeNode {
            kind: TypeKind::VariableLengthArray {
                element,
                length_expr,
                evaluated: RefCell::new(None),
            },
            is_const: false,
        }))
    }

    pub fn function(&mut self, ret: Type, params: Vec<Type>, variadic: bool) -> Type {
        Type(Rc::new(TypeNode {
            kind: TypeKind::Function { ret, params, variadic },
            is_const: false,
        }))
    }

    /// Fresh identity every call: matches `register_struct()` in the
    /// original, which hands back a brand-new slot each time, even for
    /// declarations that textually repeat a tag name.
    pub fn register_struct(&mut self, name: Option<Symbol>, is_union: bool) -> Type {
        let data = Rc::new(StructData {
            name,
            is_complete: RefCell::new(false),
            is_union,
            is_packed: false,
            fields: RefCell::new(Vec::new()),
            alignment: RefCell::new(0),
            size: RefCell::new(0),
            flexible: RefCell::new(false),
        });
        Type(Rc::new(TypeNode {
            kind: TypeKind::Struct(data),
            is_const: false,
        }))
    }

    pub fn register_enum(&mut self, name: Option<Symbol>) -> Type {
        let data = Rc::new(EnumData {
            name,
            is_complete: RefCell::new(false),
        });
        Type(Rc::new(TypeNode {
            kind: TypeKind::Enum(data),
            is_const: false,
        }))
    }

    pub fn make_const(&mut self, ty: &Type, is_const: bool) -> Type {
        if ty.0.is_const == is_const {
            return ty.clone();
        }
        Type(Rc::new(TypeNode {
            kind: clone_kind_shallow(&ty.0.kind),
            is_const,
        }))
    }

    /// 6.7.6.3p7: array-of-T and function parameters decay to pointer-to-T
    /// (and T[] to T*); function types decay to pointer-to-function.
    pub fn adjust_parameter(&mut self, ty: &Type) -> Type {
        match &ty.0.kind {
            TypeKind::Array(elem, _) | TypeKind::IncompleteArray(elem) => self.pointer(elem.clone()),
            TypeKind::Function { .. } => self.pointer(ty.clone()),
            _ => ty.clone(),
        }
    }

    pub fn remove_qualifications(&mut self, ty: &Type) -> Type {
        self.make_const(ty, false)
    }
}

fn clone_kind_shallow(kind: &TypeKind) -> TypeKind {
    match kind {
        TypeKind::Simple(k) => TypeKind::Simple(*k),
        TypeKind::Pointer(p) => TypeKind::Pointer(p.clone()),
        TypeKind::Array(e, n) => TypeKind::Array(e.clone(), *n),
        TypeKind::IncompleteArray(e) => TypeKind::IncompleteArray(e.clone()),
        TypeKind::VariableLengthArray {
            element,
            length_expr,
            evaluated,
        } => TypeKind::VariableLengthArray {
            element: element.clone(),
            length_expr: length_expr.clone(),
            evaluated: RefCell::new(*evaluated.borrow()),
        },
        TypeKind::Function { ret, params, variadic } => TypeKind::Function {
            ret: ret.clone(),
            params: params.clone(),
            variadic: *variadic,
        },
        TypeKind::Struct(d) => TypeKind::Struct(d.clone()),
        TypeKind::Enum(d) => TypeKind::Enum(d.clone()),
    }
}

impl Type {
    /// Builds a pointer-to-`pointee` type outside the interner. Used for
    /// the IR builder's throwaway temporaries, where only `.size()`/
    /// `.align()` matter and pointer identity need not be canonical.
    pub fn raw_pointer(pointee: Type) -> Type {
        Type(Rc::new(TypeNode {
            kind: TypeKind::Pointer(pointee),
            is_const: false,
        }))
    }

    /// Builds a simple scalar type outside the interner, for the same
    /// reason as `raw_pointer`.
    pub fn raw_simple(kind: SimpleKind) -> Type {
        Type(Rc::new(TypeNode {
            kind: TypeKind::Simple(kind),
            is_const: false,
        }))
    }

    pub fn is_signed(&self) -> bool {
        match self.0.kind {
            TypeKind::Simple(k) => k.is_signed(),
            _ => false,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.0.kind, TypeKind::Pointer(_))
    }

    pub fn is_simple(&self, kind: SimpleKind) -> bool {
        matches!(self.0.kind, TypeKind::Simple(k) if k == kind)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.0.kind, TypeKind::Simple(k) if k.is_integer())
    }

    pub fn is_floating(&self) -> bool {
        matches!(self.0.kind, TypeKind::Simple(k) if k.is_floating())
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_floating()
    }

    /// Real == arithmetic and not one of the `_Complex` kinds.
    pub fn is_real(&self) -> bool {
        match self.0.kind {
            TypeKind::Simple(k) => {
                !matches!(k, SimpleKind::FloatComplex | SimpleKind::DoubleComplex | SimpleKind::LDoubleComplex)
                    && (k.is_integer() || k.is_floating())
            }
            _ => false,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.0.kind, TypeKind::Array(..) | TypeKind::IncompleteArray(..) | TypeKind::Struct(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.0.kind, TypeKind::Function { .. })
    }

    pub fn is_void(&self) -> bool {
        self.is_simple(SimpleKind::Void)
    }

    pub fn pointee(&self) -> Option<&Type> {
        match &self.0.kind {
            TypeKind::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        self.0.is_const
    }

    /// Size in bytes. VLAs and incomplete arrays have no fixed size and
    /// are rejected by the caller before this is reached in practice.
    pub fn size(&self) -> u64 {
        match &self.0.kind {
            TypeKind::Simple(k) => k.size(),
            TypeKind::Pointer(_) => 8,
            TypeKind::Array(e, n) => e.size() * n,
            TypeKind::IncompleteArray(_) => 0,
            TypeKind::VariableLengthArray { evaluated, element, .. } => {
                evaluated.borrow().map(|n| element.size() * n).unwrap_or(0)
            }
            TypeKind::Function { .. } => 0,
            TypeKind::Struct(d) => *d.size.borrow(),
            TypeKind::Enum(_) => SimpleKind::Int.size(),
        }
    }

    pub fn align(&self) -> u64 {
        match &self.0.kind {
            TypeKind::Simple(k) => k.align(),
            TypeKind::Pointer(_) => 8,
            TypeKind::Array(e, _) | TypeKind::IncompleteArray(e) => e.align(),
            TypeKind::VariableLengthArray { element, .. } => element.align(),
            TypeKind::Function { .. } => 1,
            TypeKind::Struct(d) => *d.alignment.borrow(),
            TypeKind::Enum(_) => SimpleKind::Int.align(),
        }
    }

    /// Search a (possibly flattened, after anonymous-member completion)
    /// struct/union for `name`, returning its field index if present.
    /// Errors if the struct/union is only forward-declared: member access
    /// against an incomplete type is invalid regardless of whether `name`
    /// would otherwise be found.
    pub fn member_index(&self, name: Symbol, pos: &SourcePos) -> Result<Option<usize>, CompileError> {
        match &self.0.kind {
            TypeKind::Struct(d) => {
                if !*d.is_complete.borrow() {
                    return Err(CompileError::diag(
                        pos.clone(),
                        "member reference to incomplete struct/union type",
                    ));
                }
                Ok(d.fields.borrow().iter().position(|f| f.name == Some(name)))
            }
            _ => Ok(None),
        }
    }
}

/// Flattens anonymous struct/union members into their enclosing struct
/// after the member list is complete, so that `s.x` resolves even when
/// `x` lives inside an unnamed nested struct (original's
/// `type_remove_unnamed`).
pub fn flatten_anonymous_members(data: &Rc<StructData>) {
    let mut fields = data.fields.borrow_mut();
    let mut i = 0;
    while i < fields.len() {
        let nested = if fields[i].name.is_none() {
            match &fields[i].ty.0.kind {
                TypeKind::Struct(inner) => Some(inner.clone()),
                _ => None,
            }
        } else {
            None
        };
        if let Some(inner) = nested {
            let base_offset = fields[i].offset;
            let inner_fields: Vec<Field> = inner
                .fields
                .borrow()
                .iter()
                .map(|f| Field {
                    name: f.name,
                    ty: f.ty.clone(),
                    bitfield: f.bitfield,
                    offset: base_offset + f.offset,
                    bit_offset: f.bit_offset,
                })
                .collect();
            fields.splice(i..i + 1, inner_fields);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_types_are_interned() {
        let mut t = TypeInterner::new();
        let a = t.simple(SimpleKind::Int);
        let b = t.simple(SimpleKind::Int);
        assert_eq!(a, b);
        let c = t.simple(SimpleKind::Long);
        assert_ne!(a, c);
    }

    #[test]
    fn pointer_types_are_interned_by_pointee() {
        let mut t = TypeInterner::new();
        let int = t.simple(SimpleKind::Int);
        let p1 = t.pointer(int.clone());
        let p2 = t.pointer(int);
        assert_eq!(p1, p2);
    }

    #[test]
    fn two_struct_registrations_are_distinct_even_with_same_name() {
        let mut t = TypeInterner::new();
        let name = crate::token::intern("Point");
        let s1 = t.register_struct(Some(name), false);
        let s2 = t.register_struct(Some(name), false);
        assert_ne!(s1, s2);
    }

    #[test]
    fn array_decays_to_pointer_as_parameter() {
        let mut t = TypeInterner::new();
        let int = t.simple(SimpleKind::Int);
        let arr = t.array(int.clone(), 10);
        let adjusted = t.adjust_parameter(&arr);
        assert_eq!(adjusted, t.pointer(int));
    }

    #[test]
    fn classification_predicates() {
        let mut t = TypeInterner::new();
        let int = t.simple(SimpleKind::Int);
        let dbl = t.simple(SimpleKind::Double);
        let void = t.simple(SimpleKind::Void);
        assert!(int.is_integer() && int.is_arithmetic() && int.is_real());
        assert!(dbl.is_floating() && dbl.is_arithmetic());
        assert!(!void.is_arithmetic());
    }
}
