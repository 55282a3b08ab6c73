//! Lowers the parsed AST to the block-structured IR (`ir.rs`).
//!
//! Grounded on `original_source/src/ir/ir.h`'s instruction/block/function
//! shapes and the teacher's `codegen.rs` driver loop (a single struct
//! walking `ast::Program` with one method per statement/expression kind,
//! appending to a "current block" field as it goes). Every local variable
//! is given a stack slot up front rather than tracked in SSA form — this
//! is a deliberately simple, non-optimizing lowering; spec.md §9 asks for
//! a safer *representation*, not a smarter allocator.
//!
//! Calling-convention lowering (argument/return marshalling) is made
//! explicit via `SetReg`/`GetReg` around each `Call`, per spec.md §4.5's
//! "argument and return marshalling is performed by surrounding
//! `SET_REG`/`GET_REG`/... instructions emitted by the ABI lowerer."
//! `codegen.rs` interprets the small fixed table of register indices
//! these use (see its module doc).

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{
    AssignOp, BinaryOp, Decl, DeclKind, Expr, ExprKind, IntLit, Stmt, TranslationUnit, UnaryOp,
};
use crate::error::CompileError;
use crate::ir::{BinOp, Block, BlockId, CaseLabel, Function, Instruction, Module, Terminator, VarId, Variable};
use crate::rodata::RodataRegistry;
use crate::token::Symbol;
use crate::types::{SimpleKind, Type, TypeInterner, TypeKind};

/// SysV integer argument registers, in order; indices are what `SetReg`/
/// `GetReg`'s `register_index` means for integer/pointer values.
/// `RETURN_REG` is the out-of-band index used to move a call's result.
pub const ARG_REGS: [i32; 6] = [0, 1, 2, 3, 4, 5];
pub const RETURN_REG: i32 = 100;

pub fn build_module(
    unit: &TranslationUnit,
    interner: &mut TypeInterner,
    rodata: &mut RodataRegistry,
) -> Result<Module, CompileError> {
    let mut module = Module::default();
    for decl in &unit.decls {
        if let DeclKind::Function {
            name,
            is_global,
            params,
            variadic,
            body: Some(body),
        } = &decl.kind
        {
            tracing::debug!(function = %name, "lowering function to IR");
            let f = FunctionBuilder::new(*name, *is_global, *variadic, interner, rodata)
                .lower(params, body)?;
            module.functions.push(f);
        }
    }
    Ok(module)
}

struct SwitchFrame {
    labels: Vec<CaseLabel>,
    default: Option<BlockId>,
    end: BlockId,
}

struct FunctionBuilder<'a> {
    interner: &'a mut TypeInterner,
    rodata: &'a mut RodataRegistry,
    func: Function,
    next_var: VarId,
    next_block: BlockId,
    started_blocks: std::collections::HashSet<BlockId>,
    current: BlockId,
    scopes: Vec<HashMap<Symbol, VarId>>,
    frame_offset: i64,
    break_stack: Vec<BlockId>,
    continue_stack: Vec<BlockId>,
    switch_stack: Vec<SwitchFrame>,
    labels: HashMap<Symbol, BlockId>,
}

impl<'a> FunctionBuilder<'a> {
    fn new(
        name: Symbol,
        is_global: bool,
        variadic: bool,
        interner: &'a mut TypeInterner,
        rodata: &'a mut RodataRegistry,
    ) -> Self {
        let name_str = crate::token::resolve(name);
        let mut func = Function::new(name_str.to_string(), is_global, variadic);
        func.blocks.push(Block::new(0));
        FunctionBuilder {
            interner,
            rodata,
            func,
            next_var: 0,
            next_block: 1,
            started_blocks: [0].into_iter().collect(),
            current: 0,
            scopes: vec![HashMap::new()],
            frame_offset: 0,
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            switch_stack: Vec::new(),
            labels: HashMap::new(),
        }
    }

    fn lower(
        mut self,
        params: &[crate::ast::Param],
        body: &[Stmt],
    ) -> Result<Function, CompileError> {
        for p in params {
            let ty = p.ty.clone();
            let var = self.new_named_var(ty);
            if let Some(name) = p.name {
                self.scopes.last_mut().unwrap().insert(name, var);
            }
        }
        // Move incoming argument registers into their parameter slots.
        for (i, p) in params.iter().enumerate().take(ARG_REGS.len()) {
            if p.name.is_none() {
                continue;
            }
            let var = *self.scopes[0].get(&p.name.unwrap()).unwrap();
            self.push(Instruction::GetReg {
                result: var,
                register_index: ARG_REGS[i],
                is_ssa: false,
            });
        }
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        if !self.func.block_mut(self.current).has_terminator() {
            self.func.block_mut(self.current).terminator = Terminator::ReturnVoid;
        }
        self.func.prune_unreachable();
        Ok(self.func)
    }

    fn push(&mut self, instr: Instruction) {
        self.func.block_mut(self.current).push(instr);
    }

    fn terminate(&mut self, term: Terminator) {
        if !self.func.block_mut(self.current).has_terminator() {
            self.func.block_mut(self.current).terminator = term;
        }
    }

    fn new_block_id(&mut self) -> BlockId {
        let id = self.next_block;
        self.next_block += 1;
        id
    }

    /// Begins `id` as the current block, falling through from whatever
    /// was current if it hasn't terminated yet.
    fn begin_block(&mut self, id: BlockId) {
        self.terminate(Terminator::Jump(id));
        if self.started_blocks.insert(id) {
            self.func.blocks.push(Block::new(id));
        }
        self.current = id;
    }

    fn alloc_slot(&mut self, ty: &Type) -> i64 {
        let size = ty.size().max(8);
        let align = ty.align().max(8);
        self.frame_offset = (self.frame_offset + align as i64 - 1) / align as i64 * align as i64;
        self.frame_offset += size as i64;
        -self.frame_offset
    }

    fn new_var_with_ty(&mut self, ty: Type) -> VarId {
        let id = self.next_var;
        self.next_var += 1;
        let slot = self.alloc_slot(&ty);
        self.func.variables.push(Variable { id, ty, stack_slot: Some(slot) });
        id
    }

    fn new_named_var(&mut self, ty: Type) -> VarId {
        self.new_var_with_ty(ty)
    }

    fn new_temp(&mut self, ty: Type) -> VarId {
        self.new_var_with_ty(ty)
    }

    fn default_int(&mut self) -> Type {
        self.interner.simple(SimpleKind::Int)
    }

    fn lookup(&self, name: Symbol) -> Option<VarId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&v) = scope.get(&name) {
                return Some(v);
            }
        }
        None
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Null => Ok(()),
            Stmt::Expr(e) => {
                self.lower_expr(e)?;
                Ok(())
            }
            Stmt::Decl(d) => self.lower_local_decl(d),
            Stmt::Compound(stmts) => {
                self.scopes.push(HashMap::new());
                for s in stmts {
                    self.lower_stmt(s)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Stmt::If { cond, then_branch, else_branch } => self.lower_if(cond, then_branch, else_branch.as_deref()),
            Stmt::While { cond, body } => self.lower_while(cond, body),
            Stmt::DoWhile { body, cond } => self.lower_do_while(body, cond),
            Stmt::For { init, cond, step, body } => self.lower_for(init.as_deref(), cond.as_deref(), step.as_deref(), body),
            Stmt::Return(value) => self.lower_return(value.as_deref()),
            Stmt::Break => {
                let target = *self.break_stack.last().ok_or_else(|| {
                    CompileError::Ice { site: "ir_builder::break", message: "break outside loop/switch".into() }
                })?;
                self.terminate(Terminator::Jump(target));
                let fresh = self.new_block_id();
                self.begin_block(fresh);
                Ok(())
            }
            Stmt::Continue => {
                let target = *self.continue_stack.last().ok_or_else(|| {
                    CompileError::Ice { site: "ir_builder::continue", message: "continue outside loop".into() }
                })?;
                self.terminate(Terminator::Jump(target));
                let fresh = self.new_block_id();
                self.begin_block(fresh);
                Ok(())
            }
            Stmt::Switch { control, body } => self.lower_switch(control, body),
            Stmt::Case(value, inner) => {
                let id = self.new_block_id();
                self.begin_block(id);
                if let Some(frame) = self.switch_stack.last_mut() {
                    let int_ty = self.interner.simple(SimpleKind::Int);
                    frame.labels.push(CaseLabel { value: crate::constant::Constant::Integer(int_ty, *value), block: id });
                }
                self.lower_stmt(inner)
            }
            Stmt::Default(inner) => {
                let id = self.new_block_id();
                self.begin_block(id);
                if let Some(frame) = self.switch_stack.last_mut() {
                    frame.default = Some(id);
                }
                self.lower_stmt(inner)
            }
            Stmt::Label(name, inner) => {
                let id = *self.labels.entry(*name).or_insert_with(|| {
                    // placeholder: id assigned below via begin_block path
                    0
                });
                let id = if id == 0 && !self.started_blocks.contains(&0) {
                    // never actually 0 in practice since block 0 is the entry;
                    // allocate a real id now.
                    let real = self.new_block_id();
                    self.labels.insert(*name, real);
                    real
                } else {
                    id
                };
                self.begin_block(id);
                self.lower_stmt(inner)
            }
            Stmt::Goto(name) => {
                let id = if let Some(&id) = self.labels.get(name) {
                    id
                } else {
                    let id = self.new_block_id();
                    self.labels.insert(*name, id);
                    id
                };
                self.terminate(Terminator::Jump(id));
                let fresh = self.new_block_id();
                self.begin_block(fresh);
                Ok(())
            }
        }
    }

    fn lower_local_decl(&mut self, decl: &Decl) -> Result<(), CompileError> {
        match &decl.kind {
            DeclKind::Variable { name, ty, is_global: false, is_static: false, init } => {
                let var = self.new_named_var(ty.clone());
                self.scopes.last_mut().unwrap().insert(*name, var);
                if let Some(init) = init {
                    self.lower_local_init(var, ty, init)?;
                }
                Ok(())
            }
            // Static locals and file-scope declarations reaching here are
            // emitted to .data/.bss by the object-emission driver, not
            // lowered into this function's instruction stream.
            _ => Ok(()),
        }
    }

    fn lower_local_init(
        &mut self,
        var: VarId,
        ty: &Type,
        init: &crate::ast::Initializer,
    ) -> Result<(), CompileError> {
        if let TypeKind::Array(elem, len) = &ty.0.kind {
            if elem.is_integer() && elem.size() == 1 {
                if let Some((_, crate::ast::InitItem::Single(e))) = init.items.first() {
                    if let ExprKind::StringConstant(bytes) = &e.kind {
                        return self.lower_char_array_init(var, bytes, *len);
                    }
                }
            }
        }
        if ty.is_aggregate() {
            self.push(Instruction::SetZero { result: var });
            let flat = crate::constant::expand_initializer(ty, init)?;
            let base = self.new_temp(self.interner_pointer_to(ty));
            self.push(Instruction::AddressOf { result: base, variable: var });
            for item in flat {
                if let crate::constant::InitPayload::Expr(e) = &item.payload {
                    let value = self.lower_expr(e)?;
                    let dst = self.new_temp(self.interner_pointer_to(&self.expr_type(e)));
                    self.push(Instruction::Copy { result: dst, source: base });
                    if item.byte_offset != 0 {
                        let off = self.const_int(item.byte_offset as i64);
                        self.push(Instruction::BinaryOperator { result: dst, op: BinOp::Add, lhs: dst, rhs: off });
                    }
                    self.push(Instruction::Store { value, pointer: dst });
                }
            }
            Ok(())
        } else if let Some((_, crate::ast::InitItem::Single(e))) = init.items.first() {
            let value = self.lower_expr(e)?;
            self.push(Instruction::Copy { result: var, source: value });
            Ok(())
        } else {
            Ok(())
        }
    }

    /// `char a[N] = "...";`: the string's bytes (plus its implicit
    /// trailing NUL) are written byte by byte, zero-padding any tail
    /// beyond the literal's length (spec.md §8 scenario 5).
    fn lower_char_array_init(&mut self, var: VarId, bytes: &Rc<[u8]>, len: u64) -> Result<(), CompileError> {
        let byte_ty = Type::raw_simple(SimpleKind::Char);
        let ptr_ty = Type::raw_pointer(byte_ty.clone());
        let base = self.new_temp(ptr_ty);
        self.push(Instruction::AddressOf { result: base, variable: var });
        for i in 0..len {
            let byte_val = bytes.get(i as usize).copied().unwrap_or(0);
            let c = self.new_temp(byte_ty.clone());
            self.push(Instruction::Constant {
                result: c,
                value: crate::constant::Constant::Integer(byte_ty.clone(), byte_val as i64),
            });
            if i == 0 {
                self.push(Instruction::Store { value: c, pointer: base });
            } else {
                let dst = self.new_temp(Type::raw_pointer(byte_ty.clone()));
                let off = self.const_int(i as i64);
                self.push(Instruction::Copy { result: dst, source: base });
                self.push(Instruction::BinaryOperator { result: dst, op: BinOp::Add, lhs: dst, rhs: off });
                self.push(Instruction::Store { value: c, pointer: dst });
            }
        }
        Ok(())
    }

    fn interner_pointer_to(&self, ty: &Type) -> Type {
        // Interning mutably would require &mut self; pointers to
        // concrete element types are cheap to keep unintered here since
        // only `.size()`/`.align()` (not identity) are used downstream.
        Type::raw_pointer(ty.clone())
    }

    fn expr_type(&self, e: &Expr) -> Type {
        e.data_type.clone().unwrap_or_else(|| self.interner_int_fallback())
    }

    fn interner_int_fallback(&self) -> Type {
        Type::raw_simple(SimpleKind::Int)
    }

    fn const_int(&mut self, v: i64) -> VarId {
        let ty = self.default_int();
        let t = self.new_temp(ty.clone());
        self.push(Instruction::Constant { result: t, value: crate::constant::Constant::Integer(ty, v) });
        t
    }

    fn lower_if(&mut self, cond: &Expr, then_b: &Stmt, else_b: Option<&Stmt>) -> Result<(), CompileError> {
        let cv = self.lower_expr(cond)?;
        let then_id = self.new_block_id();
        let else_id = self.new_block_id();
        let end_id = self.new_block_id();
        self.terminate(Terminator::If { condition: cv, block_true: then_id, block_false: else_id });
        self.begin_block(then_id);
        self.lower_stmt(then_b)?;
        self.terminate(Terminator::Jump(end_id));
        self.begin_block(else_id);
        if let Some(eb) = else_b {
            self.lower_stmt(eb)?;
        }
        self.terminate(Terminator::Jump(end_id));
        self.begin_block(end_id);
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &Stmt) -> Result<(), CompileError> {
        let head = self.new_block_id();
        let body_id = self.new_block_id();
        let end_id = self.new_block_id();
        self.terminate(Terminator::Jump(head));
        self.begin_block(head);
        let cv = self.lower_expr(cond)?;
        self.terminate(Terminator::If { condition: cv, block_true: body_id, block_false: end_id });
        self.begin_block(body_id);
        self.break_stack.push(end_id);
        self.continue_stack.push(head);
        self.lower_stmt(body)?;
        self.break_stack.pop();
        self.continue_stack.pop();
        self.terminate(Terminator::Jump(head));
        self.begin_block(end_id);
        Ok(())
    }

    fn lower_do_while(&mut self, body: &Stmt, cond: &Expr) -> Result<(), CompileError> {
        let body_id = self.new_block_id();
        let check_id = self.new_block_id();
        let end_id = self.new_block_id();
        self.terminate(Terminator::Jump(body_id));
        self.begin_block(body_id);
        self.break_stack.push(end_id);
        self.continue_stack.push(check_id);
        self.lower_stmt(body)?;
        self.break_stack.pop();
        self.continue_stack.pop();
        self.terminate(Terminator::Jump(check_id));
        self.begin_block(check_id);
        let cv = self.lower_expr(cond)?;
        self.terminate(Terminator::If { condition: cv, block_true: body_id, block_false: end_id });
        self.begin_block(end_id);
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        self.scopes.push(HashMap::new());
        if let Some(init) = init {
            self.lower_stmt(init)?;
        }
        let head = self.new_block_id();
        let body_id = self.new_block_id();
        let step_id = self.new_block_id();
        let end_id = self.new_block_id();
        self.terminate(Terminator::Jump(head));
        self.begin_block(head);
        if let Some(cond) = cond {
            let cv = self.lower_expr(cond)?;
            self.terminate(Terminator::If { condition: cv, block_true: body_id, block_false: end_id });
        } else {
            self.terminate(Terminator::Jump(body_id));
        }
        self.begin_block(body_id);
        self.break_stack.push(end_id);
        self.continue_stack.push(step_id);
        self.lower_stmt(body)?;
        self.break_stack.pop();
        self.continue_stack.pop();
        self.terminate(Terminator::Jump(step_id));
        self.begin_block(step_id);
        if let Some(step) = step {
            self.lower_expr(step)?;
        }
        self.terminate(Terminator::Jump(head));
        self.begin_block(end_id);
        self.scopes.pop();
        Ok(())
    }

    fn lower_switch(&mut self, control: &Expr, body: &Stmt) -> Result<(), CompileError> {
        let dispatch_id = self.current;
        let cv = self.lower_expr(control)?;
        let end_id = self.new_block_id();
        self.switch_stack.push(SwitchFrame { labels: Vec::new(), default: None, end: end_id });
        self.break_stack.push(end_id);
        self.lower_stmt(body)?;
        self.break_stack.pop();
        self.terminate(Terminator::Jump(end_id));
        let frame = self.switch_stack.pop().unwrap();
        let default_block = frame.default.unwrap_or(end_id);
        self.func.block_mut(dispatch_id).terminator = Terminator::Switch { condition: cv, labels: frame.labels, default_block };
        self.begin_block(end_id);
        Ok(())
    }

    fn lower_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        match value {
            Some(e) => {
                let v = self.lower_expr(e)?;
                let ty = self.expr_type(e);
                self.terminate(Terminator::Return { ty, value: v });
            }
            None => self.terminate(Terminator::ReturnVoid),
        }
        let fresh = self.new_block_id();
        self.begin_block(fresh);
        Ok(())
    }

    fn lower_expr(&mut self, e: &Expr) -> Result<VarId, CompileError> {
        match &e.kind {
            ExprKind::IntConstant(lit) => {
                let ty = self.expr_type(e);
                let v = match lit {
                    IntLit::Signed(v) => *v,
                    IntLit::Unsigned(v) => *v as i64,
                };
                let t = self.new_temp(ty.clone());
                self.push(Instruction::Constant { result: t, value: crate::constant::Constant::Integer(ty, v) });
                Ok(t)
            }
            ExprKind::FloatConstant(v) => {
                let ty = self.expr_type(e);
                let t = self.new_temp(ty.clone());
                self.push(Instruction::Constant { result: t, value: crate::constant::Constant::Floating(ty, *v) });
                Ok(t)
            }
            ExprKind::StringConstant(bytes) => {
                let label_id = self.rodata.register_string(bytes);
                let name = self.rodata.get_name(label_id);
                let sym = crate::token::intern(&name);
                let ty = self.expr_type(e);
                let t = self.new_temp(ty.clone());
                self.push(Instruction::Constant {
                    result: t,
                    value: crate::constant::Constant::LabelPointer(sym, 0),
                });
                Ok(t)
            }
            ExprKind::VarRef(name) => {
                if let Some(var) = self.lookup(*name) {
                    Ok(var)
                } else {
                    // File-scope object: materialize its address as a
                    // label-pointer constant and load through it.
                    let ty = self.expr_type(e);
                    let ptr_ty = Type::raw_pointer(ty.clone());
                    let addr = self.new_temp(ptr_ty);
                    self.push(Instruction::Constant { result: addr, value: crate::constant::Constant::LabelPointer(*name, 0) });
                    if ty.is_function() || ty.is_aggregate() {
                        Ok(addr)
                    } else {
                        let t = self.new_temp(ty);
                        self.push(Instruction::Load { result: t, pointer: addr });
                        Ok(t)
                    }
                }
            }
            ExprKind::CompoundLiteral { ty, init } => {
                let var = self.new_temp(ty.clone());
                self.lower_local_init(var, ty, init)?;
                Ok(var)
            }
            ExprKind::Call { callee, args } => self.lower_call(callee, args, e),
            ExprKind::Member { .. } => {
                let (ptr, field_ty) = self.lower_lvalue_address(e)?;
                let t = self.new_temp(field_ty);
                self.push(Instruction::Load { result: t, pointer: ptr });
                Ok(t)
            }
            ExprKind::Index { .. } => {
                let (ptr, elem_ty) = self.lower_lvalue_address(e)?;
                let t = self.new_temp(elem_ty);
                self.push(Instruction::Load { result: t, pointer: ptr });
                Ok(t)
            }
            ExprKind::AddressOf(inner) => {
                let (ptr, _) = self.lower_lvalue_address(inner)?;
                Ok(ptr)
            }
            ExprKind::Indirection(inner) => {
                let p = self.lower_expr(inner)?;
                let ty = self.expr_type(e);
                let t = self.new_temp(ty);
                self.push(Instruction::Load { result: t, pointer: p });
                Ok(t)
            }
            ExprKind::Unary(op, inner) => self.lower_unary(*op, inner, e),
            ExprKind::Binary(op, lhs, rhs) => self.lower_binary(*op, lhs, rhs, e),
            ExprKind::Cast { ty, operand } => {
                let v = self.lower_expr(operand)?;
                self.lower_cast(v, &self.expr_type(operand), ty)
            }
            ExprKind::PointerAdd { ptr, index } => self.lower_pointer_arith(ptr, index, true, e),
            ExprKind::PointerSub { ptr, index } => self.lower_pointer_arith(ptr, index, false, e),
            ExprKind::PointerDiff { lhs, rhs } => {
                let l = self.lower_expr(lhs)?;
                let r = self.lower_expr(rhs)?;
                let elem_size = lhs.data_type.as_ref().and_then(|t| t.pointee()).map(|t| t.size()).unwrap_or(1).max(1);
                let diff = self.new_temp(Type::raw_simple(SimpleKind::Long));
                self.push(Instruction::BinaryOperator { result: diff, op: BinOp::Sub, lhs: l, rhs: r });
                let size_v = self.const_int(elem_size as i64);
                self.push(Instruction::BinaryOperator { result: diff, op: BinOp::IDiv, lhs: diff, rhs: size_v });
                Ok(diff)
            }
            ExprKind::Assign { op, target, value } => self.lower_assign(*op, target, value, e),
            ExprKind::Conditional { cond, then_branch, else_branch } => self.lower_conditional(cond, then_branch, else_branch, e),
            ExprKind::Comma(lhs, rhs) => {
                self.lower_expr(lhs)?;
                self.lower_expr(rhs)
            }
            ExprKind::ArrayToPointerDecay(inner) => {
                let (ptr, _) = self.lower_lvalue_address(inner)?;
                Ok(ptr)
            }
            ExprKind::VaStart { va_list, .. } => {
                let list = self.lower_expr(va_list)?;
                self.func.uses_va = true;
                self.push(Instruction::VaStart { result: list });
                Ok(list)
            }
            ExprKind::VaEnd(_) => Ok(self.const_int(0)),
            ExprKind::VaArg { va_list, ty } => {
                let list = self.lower_expr(va_list)?;
                let t = self.new_temp(ty.clone());
                self.push(Instruction::VaArg { result: t, array: list, ty: ty.clone() });
                Ok(t)
            }
            ExprKind::VaCopy { dst, src } => {
                let d = self.lower_expr(dst)?;
                let s = self.lower_expr(src)?;
                // `va_list` is represented as a single cursor pointer here, so
                // "copy the va_list object" is just an 8-byte value copy.
                self.push(Instruction::VaCopy { dst: d, src: s, size: 8 });
                Ok(d)
            }
            ExprKind::AlignOf(ty) => Ok(self.const_int(ty.align() as i64)),
            ExprKind::SizeOfType(ty) => Ok(self.const_int(ty.size() as i64)),
            ExprKind::SizeOfExpr(inner) => {
                let size = inner.data_type.as_ref().map(|t| t.size()).unwrap_or(0);
                Ok(self.const_int(size as i64))
            }
            ExprKind::GenericSelection { assocs, .. } => {
                // Resolved at parse time in a fully conformant front end;
                // here the first association is evaluated as a fallback.
                if let Some((_, expr)) = assocs.first() {
                    self.lower_expr(expr)
                } else {
                    crate::notimp!("empty _Generic selection")
                }
            }
        }
    }

    fn lower_call(&mut self, callee: &Expr, args: &[Rc<Expr>], call_expr: &Expr) -> Result<VarId, CompileError> {
        let fn_var = self.lower_expr(callee)?;
        // Every argument is evaluated into its own stack slot before any
        // `SetReg` is emitted, so a nested call appearing in a later
        // argument's evaluation can't clobber a register an earlier
        // argument already claimed (registers are only live from the
        // final `SetReg` to the `Call` immediately following).
        let mut arg_vars = Vec::with_capacity(args.len());
        for arg in args {
            arg_vars.push(self.lower_expr(arg)?);
        }
        for (i, v) in arg_vars.iter().enumerate().take(ARG_REGS.len()) {
            self.push(Instruction::SetReg { variable: *v, register_index: ARG_REGS[i], is_ssa: false });
        }
        let result_ty = self.expr_type(call_expr);
        let result = self.new_temp(result_ty);
        self.push(Instruction::Call { result, function: fn_var, non_clobbered_register: -1 });
        self.push(Instruction::GetReg { result, register_index: RETURN_REG, is_ssa: false });
        Ok(result)
    }

    /// Computes the address (pointer-valued `VarId`) of an lvalue, plus
    /// that lvalue's type.
    fn lower_lvalue_address(&mut self, e: &Expr) -> Result<(VarId, Type), CompileError> {
        match &e.kind {
            ExprKind::VarRef(name) => {
                let ty = self.expr_type(e);
                if let Some(var) = self.lookup(*name) {
                    let ptr_ty = Type::raw_pointer(ty.clone());
                    let addr = self.new_temp(ptr_ty);
                    self.push(Instruction::AddressOf { result: addr, variable: var });
                    Ok((addr, ty))
                } else {
                    let ptr_ty = Type::raw_pointer(ty.clone());
                    let addr = self.new_temp(ptr_ty);
                    self.push(Instruction::Constant { result: addr, value: crate::constant::Constant::LabelPointer(*name, 0) });
                    Ok((addr, ty))
                }
            }
            ExprKind::Indirection(inner) => {
                let p = self.lower_expr(inner)?;
                let ty = self.expr_type(e);
                Ok((p, ty))
            }
            ExprKind::Member { base, field, arrow } => {
                let (base_ptr, base_ty) = if *arrow {
                    let p = self.lower_expr(base)?;
                    let pointee = base.data_type.as_ref().and_then(|t| t.pointee()).cloned().unwrap_or_else(|| self.interner_int_fallback());
                    (p, pointee)
                } else {
                    self.lower_lvalue_address(base)?
                };
                let field_ty = self.expr_type(e);
                let TypeKind::Struct(data) = &base_ty.0.kind else {
                    return Err(CompileError::Ice { site: "ir_builder::member", message: "member access on non-struct type".into() });
                };
                let offset = data
                    .fields
                    .borrow()
                    .iter()
                    .find(|f| f.name == Some(*field))
                    .map(|f| f.offset)
                    .unwrap_or(0);
                let ptr_ty = Type::raw_pointer(field_ty.clone());
                let result = self.new_temp(ptr_ty);
                self.push(Instruction::Copy { result, source: base_ptr });
                if offset != 0 {
                    let off = self.const_int(offset as i64);
                    self.push(Instruction::BinaryOperator { result, op: BinOp::Add, lhs: result, rhs: off });
                }
                Ok((result, field_ty))
            }
            ExprKind::Index { base, index } => {
                let elem_ty = self.expr_type(e);
                let base_ptr = match &base.data_type {
                    Some(t) if t.is_pointer() => self.lower_expr(base)?,
                    _ => self.lower_lvalue_address(base)?.0,
                };
                let idx = self.lower_expr(index)?;
                let size = elem_ty.size().max(1);
                let scaled = self.new_temp(Type::raw_simple(SimpleKind::Long));
                let size_v = self.const_int(size as i64);
                self.push(Instruction::BinaryOperator { result: scaled, op: BinOp::IMul, lhs: idx, rhs: size_v });
                let ptr_ty = Type::raw_pointer(elem_ty.clone());
                let result = self.new_temp(ptr_ty);
                self.push(Instruction::BinaryOperator { result, op: BinOp::Add, lhs: base_ptr, rhs: scaled });
                Ok((result, elem_ty))
            }
            ExprKind::ArrayToPointerDecay(inner) => self.lower_lvalue_address(inner),
            _ => crate::notimp!("address-of a non-lvalue expression"),
        }
    }

    fn lower_unary(&mut self, op: UnaryOp, inner: &Expr, e: &Expr) -> Result<VarId, CompileError> {
        match op {
            UnaryOp::Plus => self.lower_expr(inner),
            UnaryOp::Minus => {
                let v = self.lower_expr(inner)?;
                let ty = self.expr_type(e);
                let t = self.new_temp(ty);
                if inner.data_type.as_ref().map(|t| t.is_floating()).unwrap_or(false) {
                    self.push(Instruction::NegateFloat { result: t, operand: v });
                } else {
                    self.push(Instruction::NegateInt { result: t, operand: v });
                }
                Ok(t)
            }
            UnaryOp::BitNot => {
                let v = self.lower_expr(inner)?;
                let t = self.new_temp(self.expr_type(e));
                self.push(Instruction::BinaryNot { result: t, operand: v });
                Ok(t)
            }
            UnaryOp::Not => {
                let v = self.lower_expr(inner)?;
                let t = self.new_temp(self.expr_type(e));
                self.push(Instruction::BoolCast { result: t, rhs: v });
                let zero = self.const_int(0);
                self.push(Instruction::BinaryOperator { result: t, op: BinOp::Equal, lhs: t, rhs: zero });
                Ok(t)
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let (addr, ty) = self.lower_lvalue_address(inner)?;
                let old = self.new_temp(ty.clone());
                self.push(Instruction::Load { result: old, pointer: addr });
                let step = if ty.is_pointer() {
                    ty.pointee().map(|t| t.size() as i64).unwrap_or(1)
                } else {
                    1
                };
                let delta = self.const_int(step);
                let new_val = self.new_temp(ty.clone());
                let bop = match op {
                    UnaryOp::PreInc | UnaryOp::PostInc => {
                        if ty.is_floating() { BinOp::FltAdd } else { BinOp::Add }
                    }
                    _ => {
                        if ty.is_floating() { BinOp::FltSub } else { BinOp::Sub }
                    }
                };
                self.push(Instruction::BinaryOperator { result: new_val, op: bop, lhs: old, rhs: delta });
                self.push(Instruction::Store { value: new_val, pointer: addr });
                match op {
                    UnaryOp::PreInc | UnaryOp::PreDec => Ok(new_val),
                    _ => Ok(old),
                }
            }
        }
    }

    fn lower_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, e: &Expr) -> Result<VarId, CompileError> {
        if matches!(op, BinaryOp::LogAnd | BinaryOp::LogOr) {
            return self.lower_short_circuit(op, lhs, rhs, e);
        }
        let l = self.lower_expr(lhs)?;
        let r = self.lower_expr(rhs)?;
        let floating = lhs.data_type.as_ref().map(|t| t.is_floating()).unwrap_or(false);
        let signed = lhs.data_type.as_ref().map(|t| t.is_integer() && t.is_signed()).unwrap_or(true);
        let bop = map_binop(op, floating, signed);
        let t = self.new_temp(self.expr_type(e));
        self.push(Instruction::BinaryOperator { result: t, op: bop, lhs: l, rhs: r });
        Ok(t)
    }

    fn lower_short_circuit(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, e: &Expr) -> Result<VarId, CompileError> {
        let result_ty = self.expr_type(e);
        let result = self.new_temp(result_ty);
        let l = self.lower_expr(lhs)?;
        let rhs_block = self.new_block_id();
        let short_block = self.new_block_id();
        let end_block = self.new_block_id();
        match op {
            BinaryOp::LogAnd => self.terminate(Terminator::If { condition: l, block_true: rhs_block, block_false: short_block }),
            _ => self.terminate(Terminator::If { condition: l, block_true: short_block, block_false: rhs_block }),
        }
        self.begin_block(short_block);
        let short_val = self.const_int(matches!(op, BinaryOp::LogOr) as i64);
        self.push(Instruction::Copy { result, source: short_val });
        self.terminate(Terminator::Jump(end_block));
        self.begin_block(rhs_block);
        let r = self.lower_expr(rhs)?;
        let bool_r = self.new_temp(self.interner_int_fallback());
        self.push(Instruction::BoolCast { result: bool_r, rhs: r });
        self.push(Instruction::Copy { result, source: bool_r });
        self.terminate(Terminator::Jump(end_block));
        self.begin_block(end_block);
        Ok(result)
    }

    fn lower_pointer_arith(&mut self, ptr: &Expr, index: &Expr, add: bool, e: &Expr) -> Result<VarId, CompileError> {
        let p = self.lower_expr(ptr)?;
        let i = self.lower_expr(index)?;
        let elem_size = ptr.data_type.as_ref().and_then(|t| t.pointee()).map(|t| t.size()).unwrap_or(1).max(1);
        let size_v = self.const_int(elem_size as i64);
        let scaled = self.new_temp(Type::raw_simple(SimpleKind::Long));
        self.push(Instruction::BinaryOperator { result: scaled, op: BinOp::IMul, lhs: i, rhs: size_v });
        let t = self.new_temp(self.expr_type(e));
        let bop = if add { BinOp::Add } else { BinOp::Sub };
        self.push(Instruction::BinaryOperator { result: t, op: bop, lhs: p, rhs: scaled });
        Ok(t)
    }

    fn lower_assign(&mut self, op: AssignOp, target: &Expr, value: &Expr, e: &Expr) -> Result<VarId, CompileError> {
        let (addr, ty) = self.lower_lvalue_address(target)?;
        let rhs = self.lower_expr(value)?;
        let result = if op == AssignOp::Plain {
            rhs
        } else {
            let old = self.new_temp(ty.clone());
            self.push(Instruction::Load { result: old, pointer: addr });
            let floating = ty.is_floating();
            let signed = !floating;
            let bop = map_binop(assign_to_binary(op), floating, signed);
            let t = self.new_temp(self.expr_type(e));
            self.push(Instruction::BinaryOperator { result: t, op: bop, lhs: old, rhs });
            t
        };
        self.push(Instruction::Store { value: result, pointer: addr });
        Ok(result)
    }

    fn lower_conditional(&mut self, cond: &Expr, then_e: &Expr, else_e: &Expr, e: &Expr) -> Result<VarId, CompileError> {
        let result = self.new_temp(self.expr_type(e));
        let cv = self.lower_expr(cond)?;
        let then_id = self.new_block_id();
        let else_id = self.new_block_id();
        let end_id = self.new_block_id();
        self.terminate(Terminator::If { condition: cv, block_true: then_id, block_false: else_id });
        self.begin_block(then_id);
        let tv = self.lower_expr(then_e)?;
        self.push(Instruction::Copy { result, source: tv });
        self.terminate(Terminator::Jump(end_id));
        self.begin_block(else_id);
        let ev = self.lower_expr(else_e)?;
        self.push(Instruction::Copy { result, source: ev });
        self.terminate(Terminator::Jump(end_id));
        self.begin_block(end_id);
        Ok(result)
    }

    fn lower_cast(&mut self, v: VarId, from: &Type, to: &Type) -> Result<VarId, CompileError> {
        let t = self.new_temp(to.clone());
        if to.is_floating() && from.is_floating() {
            self.push(Instruction::FloatCast { result: t, rhs: v });
        } else if to.is_floating() && from.is_integer() {
            self.push(Instruction::IntFloatCast { result: t, rhs: v, from_float: false, signed: from.is_signed() });
        } else if to.is_integer() && from.is_floating() {
            self.push(Instruction::IntFloatCast { result: t, rhs: v, from_float: true, signed: to.is_signed() });
        } else if to.is_integer() && from.is_integer() {
            self.push(Instruction::IntCast { result: t, rhs: v, sign_extend: from.is_signed() });
        } else {
            self.push(Instruction::Copy { result: t, source: v });
        }
        Ok(t)
    }
}

fn assign_to_binary(op: AssignOp) -> BinaryOp {
    match op {
        AssignOp::Plain => unreachable!(),
        AssignOp::Add => BinaryOp::Add,
        AssignOp::Sub => BinaryOp::Sub,
        AssignOp::Mul => BinaryOp::Mul,
        AssignOp::Div => BinaryOp::Div,
        AssignOp::Mod => BinaryOp::Mod,
        AssignOp::Shl => BinaryOp::Shl,
        AssignOp::Shr => BinaryOp::Shr,
        AssignOp::BitXor => BinaryOp::BitXor,
        AssignOp::BitOr => BinaryOp::BitOr,
        AssignOp::BitAnd => BinaryOp::BitAnd,
    }
}

fn map_binop(op: BinaryOp, floating: bool, signed: bool) -> BinOp {
    use BinaryOp as A;
    if floating {
        return match op {
            A::Add => BinOp::FltAdd,
            A::Sub => BinOp::FltSub,
            A::Mul => BinOp::FltMul,
            A::Div => BinOp::FltDiv,
            A::Less => BinOp::FltLess,
            A::Greater => BinOp::FltGreater,
            A::LessEq => BinOp::FltLessEq,
            A::GreaterEq => BinOp::FltGreaterEq,
            A::Equal => BinOp::FltEqual,
            A::NotEqual => BinOp::FltNotEqual,
            _ => BinOp::FltAdd,
        };
    }
    match op {
        A::Add => BinOp::Add,
        A::Sub => BinOp::Sub,
        A::Mul => {
            if signed {
                BinOp::IMul
            } else {
                BinOp::Mul
            }
        }
        A::Div => {
            if signed {
                BinOp::IDiv
            } else {
                BinOp::Div
            }
        }
        A::Mod => {
            if signed {
                BinOp::IMod
            } else {
                BinOp::Mod
            }
        }
        A::Shl => BinOp::LShift,
        A::Shr => {
            if signed {
                BinOp::IRShift
            } else {
                BinOp::RShift
            }
        }
        A::BitXor => BinOp::BXor,
        A::BitOr => BinOp::BOr,
        A::BitAnd => BinOp::BAnd,
        A::Less => {
            if signed {
                BinOp::ILess
            } else {
                BinOp::Less
            }
        }
        A::Greater => {
            if signed {
                BinOp::IGreater
            } else {
                BinOp::Greater
            }
        }
        A::LessEq => {
            if signed {
                BinOp::ILessEq
            } else {
                BinOp::LessEq
            }
        }
        A::GreaterEq => {
            if signed {
                BinOp::IGreaterEq
            } else {
                BinOp::GreaterEq
            }
        }
        A::Equal => BinOp::Equal,
        A::NotEqual => BinOp::NotEqual,
        A::LogAnd | A::LogOr => unreachable!("handled by lower_short_circuit"),
    }
}
