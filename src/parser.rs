//! Hand-written precedence-climbing C parser.
//!
//! Grounded on spec.md §4.4 and `original_source/src/types.h`'s `struct
//! expr` family: declarations and statements are parsed in one pass over
//! the preprocessor's token stream, and every expression is annotated
//! with a resolved `data_type` as it is built rather than in a later
//! pass, mirroring a small single-translation-unit C compiler's usual
//! single-pass structure.
//!
//! Declarators support pointers, arrays and function suffixes composed
//! arbitrarily; grouping parens around a nested declarator (function
//! pointers, e.g. `int (*fp)(int)`) are not supported, since none of
//! this compiler's target programs need them.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::*;
use crate::config::CompilerConfig;
use crate::constant::evaluate_constant_expression;
use crate::error::{CompileError, WarningSink};
use crate::pp::Preprocessor;
use crate::token::{intern, resolve, Symbol, SourcePos, Token, TokenKind};
use crate::types::{SimpleKind, Type, TypeInterner};

/// Parses a whole translation unit and returns it together with any
/// warnings collected along the way.
pub fn parse(
    source: &str,
    path: impl Into<Rc<str>>,
    config: &CompilerConfig,
    interner: &mut TypeInterner,
) -> Result<(TranslationUnit, WarningSink), CompileError> {
    let pp = Preprocessor::new(source, path, config);
    let mut parser = Parser::new(pp, interner)?;
    let unit = parser.parse_translation_unit()?;
    let warnings = parser.take_warnings();
    Ok((unit, warnings))
}

struct Scope {
    vars: HashMap<Symbol, Type>,
}

struct DeclSpec {
    ty: Type,
    is_typedef: bool,
    is_static: bool,
}

/// Intermediate declarator shape; materialized into a concrete `Type`
/// only once the declaration's base type is known. Pointer wraps sit
/// closer to the name than suffix wraps: for `int *a[10]`, the tree is
/// `Array(Pointer(Name(a)), 10)`, so `build_type` produces "array of
/// pointer to int" rather than "pointer to array of int".
enum DeclaratorNode {
    Name(Option<Symbol>),
    Pointer(Box<DeclaratorNode>, bool /* const */),
    Array(Box<DeclaratorNode>, Option<Rc<Expr>>),
    Function(Box<DeclaratorNode>, Vec<Param>, bool /* variadic */),
}

pub struct Parser<'a> {
    pp: Preprocessor,
    interner: &'a mut TypeInterner,
    cur: Token,
    ahead: Option<Token>,
    typedefs: HashMap<Symbol, Type>,
    tags: HashMap<Symbol, Type>,
    enum_constants: HashMap<Symbol, i64>,
    scopes: Vec<Scope>,
    next_anon: u32,
}

impl<'a> Parser<'a> {
    fn new(mut pp: Preprocessor, interner: &'a mut TypeInterner) -> Result<Self, CompileError> {
        let first = pp.next()?;
        Ok(Parser {
            pp,
            interner,
            cur: first,
            ahead: None,
            typedefs: HashMap::new(),
            tags: HashMap::new(),
            enum_constants: HashMap::new(),
            scopes: vec![Scope { vars: HashMap::new() }],
            next_anon: 0,
        })
    }

    fn take_warnings(&self) -> WarningSink {
        let mut sink = WarningSink::new();
        for w in self.pp.warnings().warnings() {
            sink.push(w.clone());
        }
        sink
    }

    // ---- token plumbing ---------------------------------------------------

    fn bump(&mut self) -> Result<Token, CompileError> {
        let next = match self.ahead.take() {
            Some(t) => t,
            None => self.pp.next()?,
        };
        Ok(std::mem::replace(&mut self.cur, next))
    }

    fn peek_ahead(&mut self) -> Result<&Token, CompileError> {
        if self.ahead.is_none() {
            self.ahead = Some(self.pp.next()?);
        }
        Ok(self.ahead.as_ref().unwrap())
    }

    fn is_punct(&self, s: &str) -> bool {
        self.cur.is_punct(s)
    }

    fn is_ident(&self, s: &str) -> bool {
        self.cur.is_ident_named(s)
    }

    fn eat_punct(&mut self, s: &str) -> Result<(), CompileError> {
        if !self.is_punct(s) {
            return Err(CompileError::diag(
                self.cur.pos.clone(),
                format!("expected '{}', found '{}'", s, self.cur.text_str()),
            ));
        }
        self.bump()?;
        Ok(())
    }

    fn try_eat_punct(&mut self, s: &str) -> Result<bool, CompileError> {
        if self.is_punct(s) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn eat_ident(&mut self) -> Result<Symbol, CompileError> {
        if !self.cur.is_ident() {
            return Err(CompileError::diag(
                self.cur.pos.clone(),
                format!("expected identifier, found '{}'", self.cur.text_str()),
            ));
        }
        let t = self.bump()?;
        Ok(t.text)
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope { vars: HashMap::new() });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare_var(&mut self, name: Symbol, ty: Type) {
        self.scopes.last_mut().unwrap().vars.insert(name, ty);
    }

    /// Completes `T arr[] = ...` by inferring the array length from its
    /// initializer, the way C itself sizes such a declaration. Leaves any
    /// type other than `IncompleteArray` untouched.
    fn complete_array_type(&mut self, ty: Type, init: &Initializer) -> Type {
        if let crate::types::TypeKind::IncompleteArray(elem) = &ty.0.kind {
            let elem = elem.clone();
            let char_element = elem.is_integer() && elem.size() == 1;
            let len = incomplete_array_length(init, char_element);
            return self.interner.array(elem, len);
        }
        ty
    }

    fn lookup_var(&self, name: Symbol) -> Option<Type> {
        self.scopes.iter().rev().find_map(|s| s.vars.get(&name).cloned())
    }

    #[allow(dead_code)]
    fn fresh_label(&mut self, prefix: &str) -> Symbol {
        let id = self.next_anon;
        self.next_anon += 1;
        intern(&format!("{}{}", prefix, id))
    }

    // ---- translation unit / declarations -----------------------------------

    fn parse_translation_unit(&mut self) -> Result<TranslationUnit, CompileError> {
        let mut decls = Vec::new();
        while !self.cur.is_eof() {
            decls.push(self.parse_external_declaration()?);
        }
        Ok(TranslationUnit { decls })
    }

    fn parse_external_declaration(&mut self) -> Result<Decl, CompileError> {
        let pos = self.cur.pos.clone();
        let spec = self.parse_declaration_specifiers()?;

        if self.try_eat_punct(";")? {
            return Ok(Decl { kind: DeclKind::TypeOnly(spec.ty), pos });
        }

        let node = self.parse_declarator_node(false)?;

        if spec.is_typedef {
            let (name, ty) = self.build_type(node, spec.ty.clone());
            if let Some(n) = name {
                self.typedefs.insert(n, ty);
            }
            while self.try_eat_punct(",")? {
                let node2 = self.parse_declarator_node(false)?;
                let (n2, t2) = self.build_type(node2, spec.ty.clone());
                if let Some(n2) = n2 {
                    self.typedefs.insert(n2, t2);
                }
            }
            self.eat_punct(";")?;
            return Ok(Decl { kind: DeclKind::TypeOnly(spec.ty), pos });
        }

        let root_params = declarator_root_params(&node);
        let (name, ty) = self.build_type(node, spec.ty.clone());
        let name = name.ok_or_else(|| CompileError::diag(pos.clone(), "declarator has no name"))?;

        if ty.is_function() {
            let variadic = match &ty.0.kind {
                crate::types::TypeKind::Function { variadic, .. } => *variadic,
                _ => false,
            };
            let params = root_params.unwrap_or_else(|| function_params(&ty));

            if self.is_punct("{") {
                self.declare_var(name, ty.clone());
                self.push_scope();
                for p in &params {
                    if let Some(n) = p.name {
                        self.declare_var(n, p.ty.clone());
                    }
                }
                let body = self.parse_compound_statement_body()?;
                self.pop_scope();
                return Ok(Decl {
                    kind: DeclKind::Function {
                        name,
                        is_global: !spec.is_static,
                        params,
                        variadic,
                        body: Some(body),
                    },
                    pos,
                });
            }

            self.eat_punct(";")?;
            self.declare_var(name, ty.clone());
            return Ok(Decl {
                kind: DeclKind::Function {
                    name,
                    is_global: !spec.is_static,
                    params,
                    variadic,
                    body: None,
                },
                pos,
            });
        }

        self.declare_var(name, ty.clone());
        let init = if self.try_eat_punct("=")? { Some(self.parse_initializer()?) } else { None };
        let ty = match &init {
            Some(init) => {
                let ty = self.complete_array_type(ty, init);
                self.declare_var(name, ty.clone());
                ty
            }
            None => ty,
        };
        let first = Decl {
            kind: DeclKind::Variable {
                name,
                ty,
                is_global: !spec.is_static,
                is_static: spec.is_static,
                init,
            },
            pos: pos.clone(),
        };

        // Additional comma-separated declarators at file scope are
        // registered so later references resolve, but only the first is
        // returned: callers needing several globals per statement should
        // write separate declarations.
        while self.try_eat_punct(",")? {
            let node2 = self.parse_declarator_node(false)?;
            let (n2, t2) = self.build_type(node2, spec.ty.clone());
            if let Some(n2) = n2 {
                self.declare_var(n2, t2.clone());
            }
            if self.try_eat_punct("=")? {
                let init2 = self.parse_initializer()?;
                if let Some(n2) = n2 {
                    let t2 = self.complete_array_type(t2, &init2);
                    self.declare_var(n2, t2);
                }
            }
        }
        self.eat_punct(";")?;
        Ok(first)
    }

    // ---- declaration specifiers ---------------------------------------------

    fn parse_declaration_specifiers(&mut self) -> Result<DeclSpec, CompileError> {
        let mut is_typedef = false;
        let mut is_static = false;
        let mut is_const = false;
        let mut simple_words: Vec<&'static str> = Vec::new();
        let mut named_ty: Option<Type> = None;

        loop {
            if !self.cur.is_ident() {
                break;
            }
            let text = self.cur.text_str();
            match &*text {
                "typedef" => {
                    is_typedef = true;
                    self.bump()?;
                }
                "static" => {
                    is_static = true;
                    self.bump()?;
                }
                "extern" | "register" | "auto" | "inline" | "_Noreturn" => {
                    self.bump()?;
                }
                "const" => {
                    is_const = true;
                    self.bump()?;
                }
                "volatile" | "restrict" => {
                    self.bump()?;
                }
                "void" | "char" | "short" | "int" | "long" | "float" | "double" | "signed" | "unsigned"
                | "_Bool" | "_Complex" => {
                    simple_words.push(leak_kw(&text));
                    self.bump()?;
                }
                "struct" | "union" => {
                    let is_union = &*text == "union";
                    named_ty = Some(self.parse_struct_or_union(is_union)?);
                }
                "enum" => {
                    named_ty = Some(self.parse_enum()?);
                }
                _ => {
                    if named_ty.is_none() && simple_words.is_empty() {
                        if let Some(t) = self.typedefs.get(&self.cur.text) {
                            named_ty = Some(t.clone());
                            self.bump()?;
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        let ty = if let Some(t) = named_ty {
            t
        } else if !simple_words.is_empty() {
            let kind = resolve_simple_kind(&simple_words).ok_or_else(|| {
                CompileError::diag(self.cur.pos.clone(), format!("invalid type specifier combination {:?}", simple_words))
            })?;
            self.interner.simple(kind)
        } else {
            self.interner.simple(SimpleKind::Int)
        };

        let ty = if is_const { self.interner.make_const(&ty, true) } else { ty };

        Ok(DeclSpec { ty, is_typedef, is_static })
    }

    fn parse_struct_or_union(&mut self, is_union: bool) -> Result<Type, CompileError> {
        self.bump()?; // struct/union
        let tag = if self.cur.is_ident() && !is_punct_keyword(&self.cur.text_str()) {
            Some(self.eat_ident()?)
        } else {
            None
        };

        if !self.is_punct("{") {
            if let Some(t) = tag.and_then(|t| self.tags.get(&t).cloned()) {
                return Ok(t);
            }
            let ty = self.interner.register_struct(tag, is_union);
            if let Some(t) = tag {
                self.tags.insert(t, ty.clone());
            }
            return Ok(ty);
        }

        let ty = if let Some(existing) = tag.and_then(|t| self.tags.get(&t).cloned()) {
            existing
        } else {
            let ty = self.interner.register_struct(tag, is_union);
            if let Some(t) = tag {
                self.tags.insert(t, ty.clone());
            }
            ty
        };

        self.bump()?; // {
        let data = match &ty.0.kind {
            crate::types::TypeKind::Struct(d) => d.clone(),
            _ => unreachable!(),
        };
        let mut offset: u64 = 0;
        let mut max_align: u64 = 1;
        while !self.is_punct("}") {
            let spec = self.parse_declaration_specifiers()?;
            loop {
                let node = self.parse_declarator_node(true)?;
                let (fname, fty) = self.build_type(node, spec.ty.clone());
                let bitfield = if self.try_eat_punct(":")? {
                    let w = self.parse_constant_expr()?;
                    evaluate_constant_expression(&w)?.and_then(|c| c.as_i64()).unwrap_or(0) as i32
                } else {
                    -1
                };
                let align = fty.align().max(1);
                let this_offset = if is_union { 0 } else { round_up(offset, align) };
                max_align = max_align.max(align);
                data.fields.borrow_mut().push(crate::types::Field {
                    name: fname,
                    ty: fty.clone(),
                    bitfield,
                    offset: this_offset,
                    bit_offset: 0,
                });
                offset = if is_union { offset.max(fty.size()) } else { this_offset + fty.size() };
                if !self.try_eat_punct(",")? {
                    break;
                }
            }
            self.eat_punct(";")?;
        }
        self.eat_punct("}")?;
        crate::types::flatten_anonymous_members(&data);
        *data.size.borrow_mut() = round_up(offset, max_align);
        *data.alignment.borrow_mut() = max_align;
        *data.is_complete.borrow_mut() = true;
        Ok(ty)
    }

    fn parse_enum(&mut self) -> Result<Type, CompileError> {
        self.bump()?; // enum
        let tag = if self.cur.is_ident() && !is_punct_keyword(&self.cur.text_str()) {
            Some(self.eat_ident()?)
        } else {
            None
        };

        if !self.is_punct("{") {
            if let Some(t) = tag.and_then(|t| self.tags.get(&t).cloned()) {
                return Ok(t);
            }
            let ty = self.interner.register_enum(tag);
            if let Some(t) = tag {
                self.tags.insert(t, ty.clone());
            }
            return Ok(ty);
        }

        let ty = self.interner.register_enum(tag);
        if let Some(t) = tag {
            self.tags.insert(t, ty.clone());
        }
        self.bump()?; // {
        let mut next_value: i64 = 0;
        while !self.is_punct("}") {
            let name = self.eat_ident()?;
            if self.try_eat_punct("=")? {
                let e = self.parse_constant_expr()?;
                next_value = evaluate_constant_expression(&e)?.and_then(|c| c.as_i64()).unwrap_or(next_value);
            }
            self.enum_constants.insert(name, next_value);
            next_value += 1;
            if !self.try_eat_punct(",")? {
                break;
            }
        }
        self.eat_punct("}")?;
        if let crate::types::TypeKind::Enum(d) = &ty.0.kind {
            *d.is_complete.borrow_mut() = true;
        }
        Ok(ty)
    }

    // ---- declarators ---------------------------------------------------------

    fn parse_declarator_node(&mut self, allow_anon: bool) -> Result<DeclaratorNode, CompileError> {
        let mut consts = Vec::new();
        while self.is_punct("*") {
            self.bump()?;
            let mut is_const = false;
            loop {
                if self.is_ident("const") {
                    is_const = true;
                    self.bump()?;
                } else if self.is_ident("volatile") || self.is_ident("restrict") {
                    self.bump()?;
                } else {
                    break;
                }
            }
            consts.push(is_const);
        }

        let mut node = if self.cur.is_ident() && !is_reserved_type_start(&self.cur.text_str()) {
            DeclaratorNode::Name(Some(self.eat_ident()?))
        } else if allow_anon {
            DeclaratorNode::Name(None)
        } else {
            return Err(CompileError::diag(self.cur.pos.clone(), "expected declarator"));
        };

        for is_const in consts.into_iter().rev() {
            node = DeclaratorNode::Pointer(Box::new(node), is_const);
        }

        loop {
            if self.try_eat_punct("[")? {
                let len_expr = if self.is_punct("]") {
                    None
                } else {
                    Some(Rc::new(self.parse_assignment_expr()?))
                };
                self.eat_punct("]")?;
                node = DeclaratorNode::Array(Box::new(node), len_expr);
            } else if self.try_eat_punct("(")? {
                let (params, variadic) = self.parse_parameter_list()?;
                self.eat_punct(")")?;
                node = DeclaratorNode::Function(Box::new(node), params, variadic);
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn parse_parameter_list(&mut self) -> Result<(Vec<Param>, bool), CompileError> {
        let mut params = Vec::new();
        let mut variadic = false;
        if self.is_punct(")") {
            return Ok((params, false));
        }
        if self.is_ident("void") && self.peek_ahead()?.is_punct(")") {
            self.bump()?;
            return Ok((params, false));
        }
        loop {
            let spec = self.parse_declaration_specifiers()?;
            let node = self.parse_declarator_node(true)?;
            let (name, ty) = self.build_type(node, spec.ty);
            let ty = self.interner.adjust_parameter(&ty);
            params.push(Param { name, ty });
            if self.try_eat_punct(",")? {
                if self.try_eat_punct("...")? {
                    variadic = true;
                    break;
                }
                continue;
            }
            break;
        }
        Ok((params, variadic))
    }

    fn build_type(&mut self, node: DeclaratorNode, base: Type) -> (Option<Symbol>, Type) {
        match node {
            DeclaratorNode::Name(n) => (n, base),
            DeclaratorNode::Pointer(inner, is_const) => {
                let (n, inner_ty) = self.build_type(*inner, base);
                let ptr = self.interner.pointer(inner_ty);
                let ptr = if is_const { self.interner.make_const(&ptr, true) } else { ptr };
                (n, ptr)
            }
            DeclaratorNode::Array(inner, len_expr) => {
                if let Some(len) = len_expr {
                    if let Ok(Some(c)) = evaluate_constant_expression(&len) {
                        let n = c.as_i64().unwrap_or(0).max(0) as u64;
                        let (name, elem) = self.build_type(*inner, base);
                        return (name, self.interner.array(elem, n));
                    }
                    let (name, elem) = self.build_type(*inner, base);
                    return (name, self.interner.variable_length_array(elem, len));
                }
                let (name, elem) = self.build_type(*inner, base);
                (name, self.interner.incomplete_array(elem))
            }
            DeclaratorNode::Function(inner, params, variadic) => {
                let param_tys: Vec<Type> = params.iter().map(|p| p.ty.clone()).collect();
                let (name, ret) = self.build_type(*inner, base);
                (name, self.interner.function(ret, param_tys, variadic))
            }
        }
    }

    fn parse_type_name(&mut self) -> Result<Type, CompileError> {
        let spec = self.parse_declaration_specifiers()?;
        if self.is_punct(")") || self.is_punct(",") {
            return Ok(spec.ty);
        }
        let node = self.parse_declarator_node(true)?;
        let (_, ty) = self.build_type(node, spec.ty);
        Ok(ty)
    }

    // ---- statements -----------------------------------------------------------

    fn parse_compound_statement_body(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.eat_punct("{")?;
        let mut stmts = Vec::new();
        while !self.is_punct("}") {
            stmts.push(self.parse_statement()?);
        }
        self.eat_punct("}")?;
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Stmt, CompileError> {
        if self.is_punct("{") {
            self.push_scope();
            let body = self.parse_compound_statement_body()?;
            self.pop_scope();
            return Ok(Stmt::Compound(body));
        }
        if self.is_punct(";") {
            self.bump()?;
            return Ok(Stmt::Null);
        }
        if self.is_ident("if") {
            self.bump()?;
            self.eat_punct("(")?;
            let cond = Rc::new(self.parse_expr()?);
            self.eat_punct(")")?;
            let then_branch = Box::new(self.parse_statement()?);
            let else_branch = if self.is_ident("else") {
                self.bump()?;
                Some(Box::new(self.parse_statement()?))
            } else {
                None
            };
            return Ok(Stmt::If { cond, then_branch, else_branch });
        }
        if self.is_ident("while") {
            self.bump()?;
            self.eat_punct("(")?;
            let cond = Rc::new(self.parse_expr()?);
            self.eat_punct(")")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::While { cond, body });
        }
        if self.is_ident("do") {
            self.bump()?;
            let body = Box::new(self.parse_statement()?);
            if !self.is_ident("while") {
                return Err(CompileError::diag(self.cur.pos.clone(), "expected 'while' after do-body"));
            }
            self.bump()?;
            self.eat_punct("(")?;
            let cond = Rc::new(self.parse_expr()?);
            self.eat_punct(")")?;
            self.eat_punct(";")?;
            return Ok(Stmt::DoWhile { body, cond });
        }
        if self.is_ident("for") {
            self.bump()?;
            self.eat_punct("(")?;
            self.push_scope();
            let init = if self.is_punct(";") {
                self.bump()?;
                None
            } else if self.starts_declaration() {
                Some(Box::new(self.parse_declaration_statement()?))
            } else {
                let e = self.parse_expr()?;
                self.eat_punct(";")?;
                Some(Box::new(Stmt::Expr(Rc::new(e))))
            };
            let cond = if self.is_punct(";") { None } else { Some(Rc::new(self.parse_expr()?)) };
            self.eat_punct(";")?;
            let step = if self.is_punct(")") { None } else { Some(Rc::new(self.parse_expr()?)) };
            self.eat_punct(")")?;
            let body = Box::new(self.parse_statement()?);
            self.pop_scope();
            return Ok(Stmt::For { init, cond, step, body });
        }
        if self.is_ident("return") {
            self.bump()?;
            let value = if self.is_punct(";") { None } else { Some(Rc::new(self.parse_expr()?)) };
            self.eat_punct(";")?;
            return Ok(Stmt::Return(value));
        }
        if self.is_ident("break") {
            self.bump()?;
            self.eat_punct(";")?;
            return Ok(Stmt::Break);
        }
        if self.is_ident("continue") {
            self.bump()?;
            self.eat_punct(";")?;
            return Ok(Stmt::Continue);
        }
        if self.is_ident("goto") {
            self.bump()?;
            let label = self.eat_ident()?;
            self.eat_punct(";")?;
            return Ok(Stmt::Goto(label));
        }
        if self.is_ident("switch") {
            self.bump()?;
            self.eat_punct("(")?;
            let control = Rc::new(self.parse_expr()?);
            self.eat_punct(")")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::Switch { control, body });
        }
        if self.is_ident("case") {
            self.bump()?;
            let e = self.parse_constant_expr()?;
            let value = evaluate_constant_expression(&e)?.and_then(|c| c.as_i64()).unwrap_or(0);
            self.eat_punct(":")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::Case(value, body));
        }
        if self.is_ident("default") {
            self.bump()?;
            self.eat_punct(":")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::Default(body));
        }
        if self.cur.is_ident() && self.peek_ahead()?.is_punct(":") {
            let name = self.eat_ident()?;
            self.eat_punct(":")?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::Label(name, body));
        }
        if self.starts_declaration() {
            return self.parse_declaration_statement();
        }
        let e = self.parse_expr()?;
        self.eat_punct(";")?;
        Ok(Stmt::Expr(Rc::new(e)))
    }

    fn starts_declaration(&self) -> bool {
        if !self.cur.is_ident() {
            return false;
        }
        let text = self.cur.text_str();
        matches!(
            &*text,
            "typedef" | "static" | "extern" | "register" | "auto" | "inline" | "const" | "volatile"
                | "void" | "char" | "short" | "int" | "long" | "float" | "double" | "signed"
                | "unsigned" | "_Bool" | "_Complex" | "struct" | "union" | "enum"
        ) || self.typedefs.contains_key(&self.cur.text)
    }

    fn parse_declaration_statement(&mut self) -> Result<Stmt, CompileError> {
        let pos = self.cur.pos.clone();
        let spec = self.parse_declaration_specifiers()?;
        if self.try_eat_punct(";")? {
            return Ok(Stmt::Decl(Decl { kind: DeclKind::TypeOnly(spec.ty), pos }));
        }
        let mut out = Vec::new();
        loop {
            let node = self.parse_declarator_node(false)?;
            let (name, ty) = self.build_type(node, spec.ty.clone());
            let name = name.ok_or_else(|| CompileError::diag(pos.clone(), "declarator has no name"))?;
            self.declare_var(name, ty.clone());
            let init = if self.try_eat_punct("=")? { Some(self.parse_initializer()?) } else { None };
            let ty = match &init {
                Some(init) => {
                    let ty = self.complete_array_type(ty, init);
                    self.declare_var(name, ty.clone());
                    ty
                }
                None => ty,
            };
            out.push(Decl {
                kind: DeclKind::Variable { name, ty, is_global: false, is_static: spec.is_static, init },
                pos: pos.clone(),
            });
            if !self.try_eat_punct(",")? {
                break;
            }
        }
        self.eat_punct(";")?;
        if out.len() == 1 {
            Ok(Stmt::Decl(out.into_iter().next().unwrap()))
        } else {
            Ok(Stmt::Compound(out.into_iter().map(Stmt::Decl).collect()))
        }
    }

    // ---- initializers -----------------------------------------------------

    fn parse_initializer(&mut self) -> Result<Initializer, CompileError> {
        if self.is_punct("{") {
            self.bump()?;
            let mut items = Vec::new();
            while !self.is_punct("}") {
                let designators = self.parse_designator_list()?;
                let item = self.parse_init_item()?;
                items.push((designators, item));
                if !self.try_eat_punct(",")? {
                    break;
                }
            }
            self.eat_punct("}")?;
            Ok(Initializer { items })
        } else {
            let e = self.parse_assignment_expr()?;
            Ok(Initializer { items: vec![(Vec::new(), InitItem::Single(Rc::new(e)))] })
        }
    }

    fn parse_init_item(&mut self) -> Result<InitItem, CompileError> {
        if self.is_punct("{") {
            let nested = self.parse_initializer()?;
            Ok(InitItem::List(nested.items))
        } else {
            Ok(InitItem::Single(Rc::new(self.parse_assignment_expr()?)))
        }
    }

    fn parse_designator_list(&mut self) -> Result<Vec<Designator>, CompileError> {
        let mut out = Vec::new();
        loop {
            if self.try_eat_punct(".")? {
                let field = self.eat_ident()?;
                out.push(Designator { field: Some(field), index: None });
            } else if self.try_eat_punct("[")? {
                let idx = Rc::new(self.parse_assignment_expr()?);
                self.eat_punct("]")?;
                out.push(Designator { field: None, index: Some(idx) });
            } else {
                break;
            }
        }
        if !out.is_empty() {
            self.eat_punct("=")?;
        }
        Ok(out)
    }

    // ---- expressions --------------------------------------------------------

    fn parse_constant_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_conditional_expr()
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let mut e = self.parse_assignment_expr()?;
        while self.is_punct(",") {
            let pos = self.cur.pos.clone();
            self.bump()?;
            let rhs = self.parse_assignment_expr()?;
            let ty = rhs.data_type.clone();
            let mut node = Expr::new(ExprKind::Comma(Rc::new(e), Rc::new(rhs)), pos);
            if let Some(t) = ty {
                node = node.with_type(t);
            }
            e = node;
        }
        Ok(e)
    }

    fn parse_assignment_expr(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_conditional_expr()?;
        let op = if self.cur.is_punct("=") {
            Some(AssignOp::Plain)
        } else if self.cur.is_punct("+=") {
            Some(AssignOp::Add)
        } else if self.cur.is_punct("-=") {
            Some(AssignOp::Sub)
        } else if self.cur.is_punct("*=") {
            Some(AssignOp::Mul)
        } else if self.cur.is_punct("/=") {
            Some(AssignOp::Div)
        } else if self.cur.is_punct("%=") {
            Some(AssignOp::Mod)
        } else if self.cur.is_punct("<<=") {
            Some(AssignOp::Shl)
        } else if self.cur.is_punct(">>=") {
            Some(AssignOp::Shr)
        } else if self.cur.is_punct("&=") {
            Some(AssignOp::BitAnd)
        } else if self.cur.is_punct("^=") {
            Some(AssignOp::BitXor)
        } else if self.cur.is_punct("|=") {
            Some(AssignOp::BitOr)
        } else {
            None
        };
        let Some(op) = op else { return Ok(lhs) };
        let pos = self.cur.pos.clone();
        self.bump()?;
        let rhs = self.parse_assignment_expr()?;
        let ty = lhs.data_type.clone();
        let mut e = Expr::new(ExprKind::Assign { op, target: Rc::new(lhs), value: Rc::new(rhs) }, pos);
        if let Some(t) = ty {
            e = e.with_type(t);
        }
        Ok(e)
    }

    fn parse_conditional_expr(&mut self) -> Result<Expr, CompileError> {
        let cond = self.parse_binary_expr(0)?;
        if self.is_punct("?") {
            let pos = self.cur.pos.clone();
            self.bump()?;
            let then_branch = self.parse_expr()?;
            self.eat_punct(":")?;
            let else_branch = self.parse_conditional_expr()?;
            let ty = then_branch.data_type.clone().or_else(|| else_branch.data_type.clone());
            let mut e = Expr::new(
                ExprKind::Conditional {
                    cond: Rc::new(cond),
                    then_branch: Rc::new(then_branch),
                    else_branch: Rc::new(else_branch),
                },
                pos,
            );
            if let Some(t) = ty {
                e = e.with_type(t);
            }
            return Ok(e);
        }
        Ok(cond)
    }

    /// Precedence-climbing over the binary operators, `||` lowest through
    /// `*`/`/`/`%` highest; `+`/`-` on a pointer operand are special-cased
    /// into `PointerAdd`/`PointerSub`/`PointerDiff` instead of `Binary`.
    fn parse_binary_expr(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_cast_expr()?;
        loop {
            let Some((op, prec)) = self.peek_binop() else { break };
            if prec < min_prec {
                break;
            }
            let pos = self.cur.pos.clone();
            self.bump()?;
            let rhs = self.parse_binary_expr(prec + 1)?;
            lhs = self.make_binary(op, lhs, rhs, pos)?;
        }
        Ok(lhs)
    }

    fn peek_binop(&self) -> Option<(BinaryOp, u8)> {
        if !matches!(self.cur.kind, TokenKind::Punctuator) {
            return None;
        }
        use BinaryOp::*;
        Some(match &*self.cur.text_str() {
            "||" => (LogOr, 1),
            "&&" => (LogAnd, 2),
            "|" => (BitOr, 3),
            "^" => (BitXor, 4),
            "&" => (BitAnd, 5),
            "==" => (Equal, 6),
            "!=" => (NotEqual, 6),
            "<" => (Less, 7),
            ">" => (Greater, 7),
            "<=" => (LessEq, 7),
            ">=" => (GreaterEq, 7),
            "<<" => (Shl, 8),
            ">>" => (Shr, 8),
            "+" => (Add, 9),
            "-" => (Sub, 9),
            "*" => (Mul, 10),
            "/" => (Div, 10),
            "%" => (Mod, 10),
            _ => return None,
        })
    }

    fn make_binary(&mut self, op: BinaryOp, lhs: Expr, rhs: Expr, pos: SourcePos) -> Result<Expr, CompileError> {
        let lty = lhs.data_type.clone();
        let rty = rhs.data_type.clone();
        let lhs_is_ptr = lty.as_ref().map(|t| t.is_pointer()).unwrap_or(false);
        let rhs_is_ptr = rty.as_ref().map(|t| t.is_pointer()).unwrap_or(false);

        match op {
            BinaryOp::Add if lhs_is_ptr && !rhs_is_ptr => {
                let ty = lty;
                let mut e = Expr::new(ExprKind::PointerAdd { ptr: Rc::new(lhs), index: Rc::new(rhs) }, pos);
                if let Some(t) = ty {
                    e = e.with_type(t);
                }
                Ok(e)
            }
            BinaryOp::Add if rhs_is_ptr && !lhs_is_ptr => {
                let ty = rty;
                let mut e = Expr::new(ExprKind::PointerAdd { ptr: Rc::new(rhs), index: Rc::new(lhs) }, pos);
                if let Some(t) = ty {
                    e = e.with_type(t);
                }
                Ok(e)
            }
            BinaryOp::Sub if lhs_is_ptr && rhs_is_ptr => {
                let ty = self.interner.simple(SimpleKind::Long);
                let e = Expr::new(ExprKind::PointerDiff { lhs: Rc::new(lhs), rhs: Rc::new(rhs) }, pos).with_type(ty);
                Ok(e)
            }
            BinaryOp::Sub if lhs_is_ptr && !rhs_is_ptr => {
                let ty = lty;
                let mut e = Expr::new(ExprKind::PointerSub { ptr: Rc::new(lhs), index: Rc::new(rhs) }, pos);
                if let Some(t) = ty {
                    e = e.with_type(t);
                }
                Ok(e)
            }
            _ => {
                let result_ty = self.combine_arith(lty, rty, op);
                let mut e = Expr::new(ExprKind::Binary(op, Rc::new(lhs), Rc::new(rhs)), pos);
                if let Some(t) = result_ty {
                    e = e.with_type(t);
                }
                Ok(e)
            }
        }
    }

    /// Usual arithmetic conversions, simplified: comparisons and logical
    /// operators always produce `int`; everything else produces the wider
    /// of the two operand types.
    fn combine_arith(&mut self, l: Option<Type>, r: Option<Type>, op: BinaryOp) -> Option<Type> {
        use BinaryOp::*;
        if matches!(op, Less | Greater | LessEq | GreaterEq | Equal | NotEqual | LogAnd | LogOr) {
            return Some(self.interner.simple(SimpleKind::Int));
        }
        let (l, r) = (l?, r?);
        if !l.is_arithmetic() || !r.is_arithmetic() {
            return Some(l);
        }
        Some(wider_arith_type(&l, &r, self.interner))
    }

    fn parse_cast_expr(&mut self) -> Result<Expr, CompileError> {
        if self.is_punct("(") && self.peek_is_type_start_after_paren()? {
            let pos = self.cur.pos.clone();
            self.bump()?; // (
            let ty = self.parse_type_name()?;
            self.eat_punct(")")?;
            if self.is_punct("{") {
                let init = self.parse_initializer()?;
                let e = Expr::new(ExprKind::CompoundLiteral { ty: ty.clone(), init: Rc::new(init) }, pos).with_type(ty);
                return self.parse_postfix_tail(e);
            }
            let operand = self.parse_cast_expr()?;
            let e = Expr::new(ExprKind::Cast { ty: ty.clone(), operand: Rc::new(operand) }, pos).with_type(ty);
            return Ok(e);
        }
        self.parse_unary_expr()
    }

    /// A `(` begins a cast or compound literal only when immediately
    /// followed by a type keyword or a known typedef name; ordinary
    /// parenthesized expressions never start that way.
    fn peek_is_type_start_after_paren(&mut self) -> Result<bool, CompileError> {
        let (is_ident, sym) = {
            let tok = self.peek_ahead()?;
            (tok.is_ident(), tok.text)
        };
        if !is_ident {
            return Ok(false);
        }
        Ok(is_reserved_type_start(&resolve(sym)) || self.typedefs.contains_key(&sym))
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, CompileError> {
        let pos = self.cur.pos.clone();
        if self.try_eat_punct("++")? {
            let operand = self.parse_unary_expr()?;
            let ty = operand.data_type.clone();
            let mut e = Expr::new(ExprKind::Unary(UnaryOp::PreInc, Rc::new(operand)), pos);
            if let Some(t) = ty {
                e = e.with_type(t);
            }
            return Ok(e);
        }
        if self.try_eat_punct("--")? {
            let operand = self.parse_unary_expr()?;
            let ty = operand.data_type.clone();
            let mut e = Expr::new(ExprKind::Unary(UnaryOp::PreDec, Rc::new(operand)), pos);
            if let Some(t) = ty {
                e = e.with_type(t);
            }
            return Ok(e);
        }
        if self.try_eat_punct("&")? {
            let operand = self.parse_cast_expr()?;
            let ty = operand.data_type.clone().map(|t| self.interner.pointer(t));
            let mut e = Expr::new(ExprKind::AddressOf(Rc::new(operand)), pos);
            if let Some(t) = ty {
                e = e.with_type(t);
            }
            return Ok(e);
        }
        if self.try_eat_punct("*")? {
            let operand = self.parse_cast_expr()?;
            let ty = operand.data_type.as_ref().and_then(|t| t.pointee().cloned());
            let mut e = Expr::new(ExprKind::Indirection(Rc::new(operand)), pos);
            if let Some(t) = ty {
                e = e.with_type(t);
            }
            return Ok(e);
        }
        for (spelling, op) in [("+", UnaryOp::Plus), ("-", UnaryOp::Minus), ("!", UnaryOp::Not), ("~", UnaryOp::BitNot)] {
            if self.try_eat_punct(spelling)? {
                let operand = self.parse_cast_expr()?;
                let ty = operand.data_type.clone();
                let mut e = Expr::new(ExprKind::Unary(op, Rc::new(operand)), pos);
                if matches!(op, UnaryOp::Not) {
                    e = e.with_type(self.interner.simple(SimpleKind::Int));
                } else if let Some(t) = ty {
                    e = e.with_type(t);
                }
                return Ok(e);
            }
        }
        if self.is_ident("sizeof") {
            self.bump()?;
            let result_ty = self.interner.simple(SimpleKind::ULong);
            if self.try_eat_punct("(")? {
                if self.cur.is_ident() && (is_reserved_type_start(&self.cur.text_str()) || self.typedefs.contains_key(&self.cur.text)) {
                    let ty = self.parse_type_name()?;
                    self.eat_punct(")")?;
                    return Ok(Expr::new(ExprKind::SizeOfType(ty), pos).with_type(result_ty));
                }
                let inner = self.parse_expr()?;
                self.eat_punct(")")?;
                return Ok(Expr::new(ExprKind::SizeOfExpr(Rc::new(inner)), pos).with_type(result_ty));
            }
            let operand = self.parse_unary_expr()?;
            return Ok(Expr::new(ExprKind::SizeOfExpr(Rc::new(operand)), pos).with_type(result_ty));
        }
        if self.is_ident("_Alignof") || self.is_ident("__alignof") || self.is_ident("__alignof__") {
            self.bump()?;
            self.eat_punct("(")?;
            let ty = self.parse_type_name()?;
            self.eat_punct(")")?;
            let result_ty = self.interner.simple(SimpleKind::ULong);
            return Ok(Expr::new(ExprKind::AlignOf(ty), pos).with_type(result_ty));
        }
        if self.is_ident("__builtin_va_start") {
            self.bump()?;
            self.eat_punct("(")?;
            let va_list = Rc::new(self.parse_assignment_expr()?);
            self.eat_punct(",")?;
            let last_named = self.eat_ident()?;
            self.eat_punct(")")?;
            return Ok(Expr::new(ExprKind::VaStart { va_list, last_named }, pos));
        }
        if self.is_ident("__builtin_va_end") {
            self.bump()?;
            self.eat_punct("(")?;
            let va_list = Rc::new(self.parse_assignment_expr()?);
            self.eat_punct(")")?;
            return Ok(Expr::new(ExprKind::VaEnd(va_list), pos));
        }
        if self.is_ident("__builtin_va_copy") {
            self.bump()?;
            self.eat_punct("(")?;
            let dst = Rc::new(self.parse_assignment_expr()?);
            self.eat_punct(",")?;
            let src = Rc::new(self.parse_assignment_expr()?);
            self.eat_punct(")")?;
            return Ok(Expr::new(ExprKind::VaCopy { dst, src }, pos));
        }
        if self.is_ident("__builtin_va_arg") {
            self.bump()?;
            self.eat_punct("(")?;
            let va_list = Rc::new(self.parse_assignment_expr()?);
            self.eat_punct(",")?;
            let ty = self.parse_type_name()?;
            self.eat_punct(")")?;
            let result_ty = ty.clone();
            return Ok(Expr::new(ExprKind::VaArg { va_list, ty }, pos).with_type(result_ty));
        }
        if self.is_ident("_Generic") {
            return self.parse_generic_selection();
        }
        self.parse_postfix_expr()
    }

    fn parse_generic_selection(&mut self) -> Result<Expr, CompileError> {
        let pos = self.cur.pos.clone();
        self.bump()?;
        self.eat_punct("(")?;
        let controlling = Rc::new(self.parse_assignment_expr()?);
        let mut assocs = Vec::new();
        while self.try_eat_punct(",")? {
            if self.is_ident("default") {
                self.bump()?;
                self.eat_punct(":")?;
                let e = self.parse_assignment_expr()?;
                assocs.push((None, Rc::new(e)));
            } else {
                let ty = self.parse_type_name()?;
                self.eat_punct(":")?;
                let e = self.parse_assignment_expr()?;
                assocs.push((Some(ty), Rc::new(e)));
            }
        }
        self.eat_punct(")")?;
        let result_ty = assocs.first().and_then(|(_, e)| e.data_type.clone());
        let mut node = Expr::new(ExprKind::GenericSelection { controlling, assocs }, pos);
        if let Some(t) = result_ty {
            node = node.with_type(t);
        }
        Ok(node)
    }

    fn parse_postfix_expr(&mut self) -> Result<Expr, CompileError> {
        let primary = self.parse_primary_expr()?;
        self.parse_postfix_tail(primary)
    }

    fn parse_postfix_tail(&mut self, mut e: Expr) -> Result<Expr, CompileError> {
        loop {
            let pos = self.cur.pos.clone();
            if self.try_eat_punct("[")? {
                let index = self.parse_expr()?;
                self.eat_punct("]")?;
                let ty = e
                    .data_type
                    .as_ref()
                    .and_then(|t| t.pointee().cloned())
                    .or_else(|| array_element_type(e.data_type.as_ref()));
                let mut node = Expr::new(ExprKind::Index { base: Rc::new(e), index: Rc::new(index) }, pos);
                if let Some(t) = ty {
                    node = node.with_type(t);
                }
                e = node;
            } else if self.try_eat_punct("(")? {
                let mut args = Vec::new();
                if !self.is_punct(")") {
                    loop {
                        args.push(Rc::new(self.parse_assignment_expr()?));
                        if !self.try_eat_punct(",")? {
                            break;
                        }
                    }
                }
                self.eat_punct(")")?;
                let ret_ty = e.data_type.as_ref().and_then(|t| match &t.0.kind {
                    crate::types::TypeKind::Function { ret, .. } => Some(ret.clone()),
                    crate::types::TypeKind::Pointer(p) => match &p.0.kind {
                        crate::types::TypeKind::Function { ret, .. } => Some(ret.clone()),
                        _ => None,
                    },
                    _ => None,
                });
                let mut node = Expr::new(ExprKind::Call { callee: Rc::new(e), args }, pos);
                if let Some(t) = ret_ty {
                    node = node.with_type(t);
                }
                e = node;
            } else if self.try_eat_punct(".")? {
                let field = self.eat_ident()?;
                let ty = match e.data_type.as_ref() {
                    Some(t) => member_type(t, field, &pos)?,
                    None => None,
                };
                let mut node = Expr::new(ExprKind::Member { base: Rc::new(e), field, arrow: false }, pos);
                if let Some(t) = ty {
                    node = node.with_type(t);
                }
                e = node;
            } else if self.try_eat_punct("->")? {
                let field = self.eat_ident()?;
                let ty = match e.data_type.as_ref().and_then(|t| t.pointee()) {
                    Some(t) => member_type(t, field, &pos)?,
                    None => None,
                };
                let mut node = Expr::new(ExprKind::Member { base: Rc::new(e), field, arrow: true }, pos);
                if let Some(t) = ty {
                    node = node.with_type(t);
                }
                e = node;
            } else if self.try_eat_punct("++")? {
                let ty = e.data_type.clone();
                let mut node = Expr::new(ExprKind::Unary(UnaryOp::PostInc, Rc::new(e)), pos);
                if let Some(t) = ty {
                    node = node.with_type(t);
                }
                e = node;
            } else if self.try_eat_punct("--")? {
                let ty = e.data_type.clone();
                let mut node = Expr::new(ExprKind::Unary(UnaryOp::PostDec, Rc::new(e)), pos);
                if let Some(t) = ty {
                    node = node.with_type(t);
                }
                e = node;
            } else {
                break;
            }
        }
        Ok(e)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, CompileError> {
        let pos = self.cur.pos.clone();
        if self.try_eat_punct("(")? {
            let e = self.parse_expr()?;
            self.eat_punct(")")?;
            return Ok(e);
        }
        match self.cur.kind.clone() {
            TokenKind::Number => {
                let text = self.cur.text_str();
                self.bump()?;
                parse_numeric_literal(&text, pos, self.interner)
            }
            TokenKind::CharConstant(v, _) => {
                self.bump()?;
                let ty = self.interner.simple(SimpleKind::Int);
                Ok(Expr::new(ExprKind::IntConstant(IntLit::Signed(v)), pos).with_type(ty))
            }
            TokenKind::StringLiteral(bytes, _) => {
                let mut all = bytes;
                self.bump()?;
                while let TokenKind::StringLiteral(more, _) = self.cur.kind.clone() {
                    if all.last() == Some(&0) {
                        all.pop();
                    }
                    all.extend(more);
                    self.bump()?;
                }
                if all.last() != Some(&0) {
                    all.push(0);
                }
                let char_ty = self.interner.simple(SimpleKind::Char);
                let ty = self.interner.array(char_ty, all.len() as u64);
                Ok(Expr::new(ExprKind::StringConstant(Rc::from(all)), pos).with_type(ty))
            }
            TokenKind::Identifier => {
                let name = self.cur.text;
                self.bump()?;
                if let Some(&val) = self.enum_constants.get(&name) {
                    let ty = self.interner.simple(SimpleKind::Int);
                    return Ok(Expr::new(ExprKind::IntConstant(IntLit::Signed(val)), pos).with_type(ty));
                }
                let mut e = Expr::new(ExprKind::VarRef(name), pos);
                if let Some(t) = self.lookup_var(name) {
                    e = e.with_type(t);
                }
                Ok(e)
            }
            _ => Err(CompileError::diag(pos, format!("unexpected token '{}'", self.cur.text_str()))),
        }
    }
}

// ---- free helpers -----------------------------------------------------------

/// Array length implied by a `T arr[] = ...` initializer: a bare string
/// literal sizes a `char` array to its byte count plus the NUL terminator;
/// otherwise the length is one past the highest element index touched,
/// mirroring `constant::expand_array`'s designator-aware cursor walk.
fn incomplete_array_length(init: &Initializer, char_element: bool) -> u64 {
    if char_element {
        if let [(designators, InitItem::Single(e))] = init.items.as_slice() {
            if designators.is_empty() {
                if let ExprKind::StringConstant(bytes) = &e.kind {
                    return bytes.len() as u64 + 1;
                }
            }
        }
    }
    let mut cursor: u64 = 0;
    let mut max_len: u64 = 0;
    for (designators, _) in &init.items {
        if let Some(first) = designators.first() {
            if let Some(idx_expr) = &first.index {
                if let Ok(Some(c)) = evaluate_constant_expression(idx_expr) {
                    if let Some(v) = c.as_i64() {
                        cursor = v as u64;
                    }
                }
            }
        }
        cursor += 1;
        max_len = max_len.max(cursor);
    }
    max_len
}

fn round_up(offset: u64, align: u64) -> u64 {
    if align == 0 {
        return offset;
    }
    (offset + align - 1) / align * align
}

fn is_reserved_type_start(text: &str) -> bool {
    matches!(
        text,
        "void" | "char" | "short" | "int" | "long" | "float" | "double" | "signed" | "unsigned" | "_Bool"
            | "_Complex" | "struct" | "union" | "enum" | "const" | "volatile"
    )
}

fn is_punct_keyword(text: &str) -> bool {
    matches!(text, "{" | "}")
}

fn leak_kw(s: &str) -> &'static str {
    match s {
        "void" => "void",
        "char" => "char",
        "short" => "short",
        "int" => "int",
        "long" => "long",
        "float" => "float",
        "double" => "double",
        "signed" => "signed",
        "unsigned" => "unsigned",
        "_Bool" => "_Bool",
        "_Complex" => "_Complex",
        _ => "int",
    }
}

fn resolve_simple_kind(words: &[&'static str]) -> Option<SimpleKind> {
    let mut void = 0;
    let mut char_ = 0;
    let mut short = 0;
    let mut int = 0;
    let mut long = 0;
    let mut float = 0;
    let mut double = 0;
    let mut signed = 0;
    let mut unsigned = 0;
    let mut bool_ = 0;
    let mut complex = 0;
    for w in words {
        match *w {
            "void" => void += 1,
            "char" => char_ += 1,
            "short" => short += 1,
            "int" => int += 1,
            "long" => long += 1,
            "float" => float += 1,
            "double" => double += 1,
            "signed" => signed += 1,
            "unsigned" => unsigned += 1,
            "_Bool" => bool_ += 1,
            "_Complex" => complex += 1,
            _ => {}
        }
    }
    use SimpleKind::*;
    if void > 0 {
        return Some(Void);
    }
    if bool_ > 0 {
        return Some(Bool);
    }
    if char_ > 0 {
        return Some(if unsigned > 0 {
            UChar
        } else if signed > 0 {
            SChar
        } else {
            Char
        });
    }
    if short > 0 {
        return Some(if unsigned > 0 { UShort } else { Short });
    }
    if double > 0 {
        if long > 0 {
            return Some(if complex > 0 { LDoubleComplex } else { LDouble });
        }
        return Some(if complex > 0 { DoubleComplex } else { Double });
    }
    if float > 0 {
        return Some(if complex > 0 { FloatComplex } else { Float });
    }
    if long >= 2 {
        return Some(if unsigned > 0 { ULLong } else { LLong });
    }
    if long == 1 {
        return Some(if unsigned > 0 { ULong } else { Long });
    }
    if int > 0 || signed > 0 || unsigned > 0 {
        return Some(if unsigned > 0 { UInt } else { Int });
    }
    None
}

fn arith_rank(k: SimpleKind) -> u8 {
    use SimpleKind::*;
    match k {
        Bool | Char | SChar | UChar => 1,
        Short | UShort => 2,
        Int | UInt => 3,
        Long | ULong => 4,
        LLong | ULLong => 5,
        Float => 6,
        Double => 7,
        LDouble => 8,
        FloatComplex => 9,
        DoubleComplex => 10,
        LDoubleComplex => 11,
    }
}

fn wider_arith_type(l: &Type, r: &Type, interner: &mut TypeInterner) -> Type {
    let lk = match &l.0.kind {
        crate::types::TypeKind::Simple(k) => *k,
        _ => return interner.simple(SimpleKind::Int),
    };
    let rk = match &r.0.kind {
        crate::types::TypeKind::Simple(k) => *k,
        _ => return interner.simple(SimpleKind::Int),
    };
    let lk = if lk.is_integer() && arith_rank(lk) < arith_rank(SimpleKind::Int) { SimpleKind::Int } else { lk };
    let rk = if rk.is_integer() && arith_rank(rk) < arith_rank(SimpleKind::Int) { SimpleKind::Int } else { rk };
    let winner = if arith_rank(lk) >= arith_rank(rk) { lk } else { rk };
    interner.simple(winner)
}

fn array_element_type(t: Option<&Type>) -> Option<Type> {
    match t.map(|t| &t.0.kind) {
        Some(crate::types::TypeKind::Array(e, _)) | Some(crate::types::TypeKind::IncompleteArray(e)) => Some(e.clone()),
        _ => None,
    }
}

/// Resolves a `.`/`->` member's type, via `Type::member_index` so that a
/// reference through a forward-declared (incomplete) struct/union
/// reports an error instead of silently resolving to no type.
fn member_type(t: &Type, field: Symbol, pos: &SourcePos) -> Result<Option<Type>, CompileError> {
    let idx = t.member_index(field, pos)?;
    Ok(match (idx, &t.0.kind) {
        (Some(i), crate::types::TypeKind::Struct(d)) => Some(d.fields.borrow()[i].ty.clone()),
        _ => None,
    })
}

fn function_params(ty: &Type) -> Vec<Param> {
    match &ty.0.kind {
        crate::types::TypeKind::Function { params, .. } => params.iter().map(|t| Param { name: None, ty: t.clone() }).collect(),
        _ => Vec::new(),
    }
}

fn declarator_root_params(node: &DeclaratorNode) -> Option<Vec<Param>> {
    match node {
        DeclaratorNode::Function(_, params, _) => Some(params.clone()),
        _ => None,
    }
}

/// Parses a pp-number token's full spelling: decimal/hex/octal integers
/// with `u`/`U`/`l`/`L` suffixes, or a floating literal with `f`/`F`/`l`/`L`.
/// The lexer hands back only the raw spelling (`token.rs`'s `Number`
/// variant carries no parsed value), so this is the only place in the
/// compiler that turns pp-number text into a constant.
fn parse_numeric_literal(text: &str, pos: SourcePos, interner: &mut TypeInterner) -> Result<Expr, CompileError> {
    let lower = text.to_ascii_lowercase();
    let is_hex = lower.starts_with("0x");
    let is_float = lower.contains('.') || (!is_hex && lower.contains('e'));

    if is_float {
        let trimmed = lower.trim_end_matches(['f', 'l']);
        let v: f64 = trimmed
            .parse()
            .map_err(|_| CompileError::diag(pos.clone(), format!("invalid floating literal '{}'", text)))?;
        let ty = if lower.ends_with('f') {
            interner.simple(SimpleKind::Float)
        } else {
            interner.simple(SimpleKind::Double)
        };
        return Ok(Expr::new(ExprKind::FloatConstant(v), pos).with_type(ty));
    }

    let mut body = lower.as_str();
    let mut unsigned = false;
    let mut long_count = 0;
    loop {
        if let Some(stripped) = body.strip_suffix('u') {
            unsigned = true;
            body = stripped;
        } else if let Some(stripped) = body.strip_suffix('l') {
            long_count += 1;
            body = stripped;
        } else {
            break;
        }
    }
    let value: u64 = if let Some(hex) = body.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).map_err(|_| CompileError::diag(pos.clone(), format!("invalid hex literal '{}'", text)))?
    } else if body.len() > 1 && body.starts_with('0') {
        u64::from_str_radix(&body[1..], 8).unwrap_or(0)
    } else {
        body.parse().map_err(|_| CompileError::diag(pos.clone(), format!("invalid integer literal '{}'", text)))?
    };

    let kind = match (unsigned, long_count) {
        (false, 0) => SimpleKind::Int,
        (true, 0) => SimpleKind::UInt,
        (false, 1) => SimpleKind::Long,
        (true, 1) => SimpleKind::ULong,
        (false, _) => SimpleKind::LLong,
        (true, _) => SimpleKind::ULLong,
    };
    let ty = interner.simple(kind);
    let lit = if unsigned { IntLit::Unsigned(value) } else { IntLit::Signed(value as i64) };
    Ok(Expr::new(ExprKind::IntConstant(lit), pos).with_type(ty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;

    fn parse_src(src: &str) -> TranslationUnit {
        let cfg = CompilerConfig::new();
        let mut interner = TypeInterner::new();
        let (unit, _) = parse(src, "t.c", &cfg, &mut interner).unwrap();
        unit
    }

    #[test]
    fn parses_main_returning_constant() {
        let unit = parse_src("int main() { return 42; }");
        assert_eq!(unit.decls.len(), 1);
        match &unit.decls[0].kind {
            DeclKind::Function { name, body, .. } => {
                assert_eq!(&*resolve(*name), "main");
                let body = body.as_ref().unwrap();
                assert!(matches!(body[0], Stmt::Return(Some(_))));
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn parses_binary_arithmetic_with_precedence() {
        let unit = parse_src("int main() { return 1 + 2 * 3; }");
        match &unit.decls[0].kind {
            DeclKind::Function { body, .. } => match &body.as_ref().unwrap()[0] {
                Stmt::Return(Some(e)) => match &e.kind {
                    ExprKind::Binary(BinaryOp::Add, _, rhs) => {
                        assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Mul, ..)));
                    }
                    _ => panic!("expected addition at top"),
                },
                _ => panic!("expected return"),
            },
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn parses_global_array_with_string_initializer() {
        let unit = parse_src(r#"char str1[] = "ABC\0\0\0DEF";"#);
        match &unit.decls[0].kind {
            DeclKind::Variable { ty, init, .. } => {
                assert_eq!(ty.size(), 10);
                assert!(init.is_some());
            }
            _ => panic!("expected variable decl"),
        }
    }

    #[test]
    fn parses_designated_initializer() {
        let unit = parse_src("struct P { int x; int y; int z; }; struct P p = { .z = 3, .x = 2, 5 };");
        match &unit.decls[1].kind {
            DeclKind::Variable { init, .. } => {
                let items = &init.as_ref().unwrap().items;
                assert_eq!(items.len(), 3);
                assert_eq!(
                    items[0].0[0].field.map(|s| resolve(s).to_string()),
                    Some("z".to_string())
                );
            }
            _ => panic!("expected variable decl"),
        }
    }

    #[test]
    fn array_of_pointers_declarator_order_is_correct() {
        let unit = parse_src("int *table[10];");
        match &unit.decls[0].kind {
            DeclKind::Variable { ty, .. } => match &ty.0.kind {
                crate::types::TypeKind::Array(elem, n) => {
                    assert_eq!(*n, 10);
                    assert!(elem.is_pointer());
                }
                other => panic!("expected array type, got {:?}", other),
            },
            _ => panic!("expected variable decl"),
        }
    }

    #[test]
    fn pointer_addition_becomes_pointer_add_node() {
        let unit = parse_src("int f(int *p) { return *(p + 1); }");
        match &unit.decls[0].kind {
            DeclKind::Function { body, .. } => match &body.as_ref().unwrap()[0] {
                Stmt::Return(Some(e)) => match &e.kind {
                    ExprKind::Indirection(inner) => {
                        assert!(matches!(inner.kind, ExprKind::PointerAdd { .. }));
                    }
                    _ => panic!("expected indirection"),
                },
                _ => panic!("expected return"),
            },
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn floating_comparison_gets_int_result_type() {
        let unit = parse_src("int main() { return 2.3 < 4.5; }");
        match &unit.decls[0].kind {
            DeclKind::Function { body, .. } => match &body.as_ref().unwrap()[0] {
                Stmt::Return(Some(e)) => {
                    assert!(e.data_type.as_ref().unwrap().is_simple(SimpleKind::Int));
                }
                _ => panic!("expected return"),
            },
            _ => panic!("expected function"),
        }
    }
}
