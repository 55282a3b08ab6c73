//! Lowers `ir::Module` to x86-64 machine code and drives `object::ElfWriter`
//! to produce a relocatable ELF64 object.
//!
//! Grounded on `original_source/src/codegen/` for the instruction
//! selection (one pass per `ir::Instruction`, a fixed scratch-register
//! convention instead of a register allocator) and on the teacher's
//! `codegen.rs` for the overall "walk the IR, append bytes to a buffer"
//! shape. Every IR variable lives in a fixed stack slot (see
//! `ir_builder`'s module doc), so this pass never needs to track live
//! ranges: every instruction loads its operands from memory and stores
//! its result back to memory.
//!
//! Function bodies are encoded into a local `Vec<u8>` first. Every
//! intra-function jump (`jmp`/`jcc rel32`) is emitted at a fixed width
//! and back-patched once the whole function's block layout is known, so
//! no relaxation pass is needed. The buffer is then written to the
//! `.text` section in one call, and any relocations against external
//! symbols (calls through a computed address, references to globals or
//! string constants) are registered against that section afterward with
//! offsets computed relative to the post-write cursor.
//!
//! Floating-point values are always carried as 8-byte IEEE-754 doubles
//! in their stack slot, narrowed to `float` width only when stored
//! through a pointer to actual `float`-typed memory (`Load`/`Store`).
//! Call argument/return marshalling (`SetReg`/`GetReg`) moves the slot's
//! raw 8 bytes through a general-purpose register regardless of whether
//! the value is integer or floating-point — a deliberate deviation from
//! the real SysV ABI (which would use `xmm0..xmm7` for float arguments)
//! documented in DESIGN.md: it only matters for interop with externally
//! compiled floating-point-consuming code, which none of this compiler's
//! scenarios exercise.

use std::collections::HashMap;

use crate::ast::{DeclKind, Initializer, InitItem, TranslationUnit};
use crate::config::{CodeModel, CompilerConfig};
use crate::constant::{evaluate_constant_expression, expand_initializer, Constant, InitPayload};
use crate::error::CompileError;
use crate::ir::{BinOp, BlockId, CaseLabel, Function, Instruction, Module, Terminator, VarId};
use crate::ir_builder::{ARG_REGS, RETURN_REG};
use crate::object::{reloc, ElfWriter};
use crate::rodata::RodataRegistry;
use crate::types::{SimpleKind, Type, TypeKind};

// x86-64 general-purpose register numbers.
const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSP: u8 = 4;
const RBP: u8 = 5;
const R10: u8 = 10;

/// SysV integer argument registers in order, indexed by `SetReg`/
/// `GetReg`'s `register_index` (0..6, matching `ir_builder::ARG_REGS`).
const ARG_PHYS: [u8; 6] = [7, 6, 2, 1, 8, 9]; // rdi, rsi, rdx, rcx, r8, r9

const EPILOGUE_BLOCK: BlockId = u32::MAX;

pub fn emit_object(
    unit: &TranslationUnit,
    module: &Module,
    rodata: &RodataRegistry,
    config: &CompilerConfig,
) -> Result<Vec<u8>, CompileError> {
    let mut w = ElfWriter::new();
    emit_rodata(&mut w, rodata);
    emit_globals(&mut w, unit)?;
    w.set_section(".text");
    for func in &module.functions {
        emit_function(&mut w, config, func)?;
    }
    Ok(w.finish())
}

fn emit_rodata(w: &mut ElfWriter, rodata: &RodataRegistry) {
    let entries = rodata.string_entries();
    if entries.is_empty() {
        return;
    }
    w.set_section(".rodata");
    for (name, bytes) in entries {
        w.symbol_set(&name, false);
        w.write(&bytes);
    }
}

fn emit_globals(w: &mut ElfWriter, unit: &TranslationUnit) -> Result<(), CompileError> {
    for decl in &unit.decls {
        if let DeclKind::Variable { name, ty, is_global: true, is_static, init } = &decl.kind {
            let label = crate::token::resolve(*name);
            let bind_global = !is_static;
            match init {
                None => {
                    w.set_section(".bss");
                    w.symbol_set(&label, bind_global);
                    w.write_zero(ty.size() as usize);
                }
                Some(init) => {
                    w.set_section(".data");
                    w.symbol_set(&label, bind_global);
                    emit_global_init(w, ty, init)?;
                }
            }
        }
    }
    Ok(())
}

fn emit_global_init(w: &mut ElfWriter, ty: &Type, init: &Initializer) -> Result<(), CompileError> {
    if let TypeKind::Array(elem, len) = &ty.0.kind {
        if elem.is_integer() && elem.size() == 1 {
            if let Some((_, InitItem::Single(e))) = init.items.first() {
                if let crate::ast::ExprKind::StringConstant(bytes) = &e.kind {
                    let mut buf = vec![0u8; *len as usize];
                    for (i, b) in bytes.iter().enumerate().take(*len as usize) {
                        buf[i] = *b;
                    }
                    w.write(&buf);
                    return Ok(());
                }
            }
        }
    }

    let size = ty.size() as usize;
    let mut buf = vec![0u8; size];
    let mut relocs: Vec<(u64, std::rc::Rc<str>, i64, u32)> = Vec::new();
    for item in expand_initializer(ty, init)? {
        match &item.payload {
            InitPayload::Expr(e) => match evaluate_constant_expression(e)? {
                Some(Constant::Integer(t, v)) => {
                    let sz = (t.size().max(1) as usize).min(8);
                    let off = item.byte_offset as usize;
                    if off + sz <= size {
                        buf[off..off + sz].copy_from_slice(&v.to_le_bytes()[..sz]);
                    }
                }
                Some(Constant::Floating(_, v)) => {
                    let off = item.byte_offset as usize;
                    if off + 8 <= size {
                        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
                    }
                }
                Some(Constant::LabelPointer(label, addend)) => {
                    relocs.push((item.byte_offset, crate::token::resolve(label), addend, reloc::R_X86_64_64));
                }
                Some(Constant::Label(label)) => {
                    relocs.push((item.byte_offset, crate::token::resolve(label), 0, reloc::R_X86_64_64));
                }
                None => {}
            },
            InitPayload::Bytes(bytes) => {
                let off = item.byte_offset as usize;
                let n = bytes.len().min(size.saturating_sub(off));
                buf[off..off + n].copy_from_slice(&bytes[..n]);
            }
        }
    }
    w.write(&buf);
    for (off, label, addend, rtype) in relocs {
        w.symbol_relocate(&label, off as i64 - size as i64, addend, rtype);
    }
    Ok(())
}

// ---- instruction encoding helpers ------------------------------------

fn rex(w: bool, reg: u8, idx: u8, rm: u8) -> u8 {
    0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | (((idx >> 3) & 1) << 1) | ((rm >> 3) & 1)
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

fn mov_load_slot(buf: &mut Vec<u8>, dst: u8, slot: i64) {
    buf.push(rex(true, dst, 0, RBP));
    buf.push(0x8B);
    buf.push(modrm(2, dst, RBP));
    buf.extend_from_slice(&(slot as i32).to_le_bytes());
}

fn mov_store_slot(buf: &mut Vec<u8>, slot: i64, src: u8) {
    buf.push(rex(true, src, 0, RBP));
    buf.push(0x89);
    buf.push(modrm(2, src, RBP));
    buf.extend_from_slice(&(slot as i32).to_le_bytes());
}

fn lea_slot(buf: &mut Vec<u8>, dst: u8, slot: i64) {
    buf.push(rex(true, dst, 0, RBP));
    buf.push(0x8D);
    buf.push(modrm(2, dst, RBP));
    buf.extend_from_slice(&(slot as i32).to_le_bytes());
}

fn mov_byte_zero_to_slot(buf: &mut Vec<u8>, slot: i64) {
    buf.push(rex(false, 0, 0, RBP));
    buf.push(0xC6);
    buf.push(modrm(2, 0, RBP));
    buf.extend_from_slice(&(slot as i32).to_le_bytes());
    buf.push(0);
}

fn mov_imm64(buf: &mut Vec<u8>, dst: u8, imm: i64) {
    buf.push(rex(true, 0, 0, dst));
    buf.push(0xB8 + (dst & 7));
    buf.extend_from_slice(&imm.to_le_bytes());
}

/// `lea dst, [rip+disp32]`. Returns the buffer offset of the disp32 field
/// so the caller can register a `R_X86_64_PC32` relocation with
/// addend `-4` (the field sits at the very end of the instruction, so
/// `site + 4` is the address the CPU computes RIP-relative addresses from).
fn lea_rip(buf: &mut Vec<u8>, dst: u8) -> usize {
    buf.push(rex(true, dst, 0, 0));
    buf.push(0x8D);
    buf.push(modrm(0, dst, 5)); // mod=00, rm=101 => RIP-relative
    let site = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    site
}

fn mov_rr(buf: &mut Vec<u8>, dst: u8, src: u8) {
    buf.push(rex(true, src, 0, dst));
    buf.push(0x89);
    buf.push(modrm(3, src, dst));
}

/// Loads from `[ptr_reg]` into `dst`, sized/extended per `width`
/// (1/2/4/8 bytes) and `signed`.
fn load_via_ptr(buf: &mut Vec<u8>, dst: u8, ptr_reg: u8, width: u64, signed: bool) {
    match width {
        8 => {
            buf.push(rex(true, dst, 0, ptr_reg));
            buf.push(0x8B);
            buf.push(modrm(0, dst, ptr_reg));
        }
        4 => {
            if signed {
                buf.push(rex(true, dst, 0, ptr_reg));
                buf.push(0x63);
                buf.push(modrm(0, dst, ptr_reg));
            } else {
                if dst >= 8 || ptr_reg >= 8 {
                    buf.push(rex(false, dst, 0, ptr_reg));
                }
                buf.push(0x8B);
                buf.push(modrm(0, dst, ptr_reg));
            }
        }
        2 => {
            buf.push(rex(true, dst, 0, ptr_reg));
            buf.push(0x0F);
            buf.push(if signed { 0xBF } else { 0xB7 });
            buf.push(modrm(0, dst, ptr_reg));
        }
        _ => {
            buf.push(rex(true, dst, 0, ptr_reg));
            buf.push(0x0F);
            buf.push(if signed { 0xBE } else { 0xB6 });
            buf.push(modrm(0, dst, ptr_reg));
        }
    }
}

/// Stores `src` (truncated to `width` bytes) to `[ptr_reg]`.
fn store_via_ptr(buf: &mut Vec<u8>, ptr_reg: u8, width: u64, src: u8) {
    match width {
        8 => {
            buf.push(rex(true, src, 0, ptr_reg));
            buf.push(0x89);
            buf.push(modrm(0, src, ptr_reg));
        }
        4 => {
            if src >= 8 || ptr_reg >= 8 {
                buf.push(rex(false, src, 0, ptr_reg));
            }
            buf.push(0x89);
            buf.push(modrm(0, src, ptr_reg));
        }
        2 => {
            buf.push(0x66);
            if src >= 8 || ptr_reg >= 8 {
                buf.push(rex(false, src, 0, ptr_reg));
            }
            buf.push(0x89);
            buf.push(modrm(0, src, ptr_reg));
        }
        _ => {
            buf.push(rex(false, src, 0, ptr_reg));
            buf.push(0x88);
            buf.push(modrm(0, src, ptr_reg));
        }
    }
}

fn alu_rr(buf: &mut Vec<u8>, opcode: u8, dst: u8, src: u8) {
    buf.push(rex(true, src, 0, dst));
    buf.push(opcode);
    buf.push(modrm(3, src, dst));
}

fn imul_rr(buf: &mut Vec<u8>, dst: u8, src: u8) {
    buf.push(rex(true, dst, 0, src));
    buf.push(0x0F);
    buf.push(0xAF);
    buf.push(modrm(3, dst, src));
}

fn cqo(buf: &mut Vec<u8>) {
    buf.push(0x48);
    buf.push(0x99);
}

fn idiv_r(buf: &mut Vec<u8>, src: u8) {
    buf.push(rex(true, 0, 0, src));
    buf.push(0xF7);
    buf.push(modrm(3, 7, src));
}

fn div_r(buf: &mut Vec<u8>, src: u8) {
    buf.push(rex(true, 0, 0, src));
    buf.push(0xF7);
    buf.push(modrm(3, 6, src));
}

fn xor_edx_edx(buf: &mut Vec<u8>) {
    buf.push(0x31);
    buf.push(modrm(3, RDX, RDX));
}

fn shift_cl(buf: &mut Vec<u8>, dst: u8, which: u8) {
    buf.push(rex(true, 0, 0, dst));
    buf.push(0xD3);
    buf.push(modrm(3, which, dst));
}

fn shift_imm(buf: &mut Vec<u8>, dst: u8, which: u8, amount: u8) {
    buf.push(rex(true, 0, 0, dst));
    buf.push(0xC1);
    buf.push(modrm(3, which, dst));
    buf.push(amount);
}

fn neg_r(buf: &mut Vec<u8>, r: u8) {
    buf.push(rex(true, 0, 0, r));
    buf.push(0xF7);
    buf.push(modrm(3, 3, r));
}

fn not_r(buf: &mut Vec<u8>, r: u8) {
    buf.push(rex(true, 0, 0, r));
    buf.push(0xF7);
    buf.push(modrm(3, 2, r));
}

fn setcc(buf: &mut Vec<u8>, cc: u8, dst: u8) {
    if dst >= 4 {
        buf.push(rex(false, 0, 0, dst));
    }
    buf.push(0x0F);
    buf.push(0x90 | cc);
    buf.push(modrm(3, 0, dst));
}

fn movzx_r64_r8(buf: &mut Vec<u8>, dst: u8, src: u8) {
    buf.push(rex(true, dst, 0, src));
    buf.push(0x0F);
    buf.push(0xB6);
    buf.push(modrm(3, dst, src));
}

fn test_rr(buf: &mut Vec<u8>, a: u8, b: u8) {
    buf.push(rex(true, b, 0, a));
    buf.push(0x85);
    buf.push(modrm(3, b, a));
}

fn add_imm32(buf: &mut Vec<u8>, dst: u8, imm: i32) {
    buf.push(rex(true, 0, 0, dst));
    buf.push(0x81);
    buf.push(modrm(3, 0, dst));
    buf.extend_from_slice(&imm.to_le_bytes());
}

fn jmp_rel32(buf: &mut Vec<u8>) -> usize {
    buf.push(0xE9);
    let site = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    site
}

fn jcc_rel32(buf: &mut Vec<u8>, cc: u8) -> usize {
    buf.push(0x0F);
    buf.push(0x80 | cc);
    let site = buf.len();
    buf.extend_from_slice(&0i32.to_le_bytes());
    site
}

const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_BE: u8 = 0x6;
const CC_A: u8 = 0x7;
const CC_L: u8 = 0xC;
const CC_GE: u8 = 0xD;
const CC_LE: u8 = 0xE;
const CC_G: u8 = 0xF;

fn movsd_load_slot(buf: &mut Vec<u8>, xmm: u8, slot: i64) {
    buf.push(0xF2);
    buf.push(0x0F);
    buf.push(0x10);
    buf.push(modrm(2, xmm, RBP));
    buf.extend_from_slice(&(slot as i32).to_le_bytes());
}

fn movsd_store_slot(buf: &mut Vec<u8>, slot: i64, xmm: u8) {
    buf.push(0xF2);
    buf.push(0x0F);
    buf.push(0x11);
    buf.push(modrm(2, xmm, RBP));
    buf.extend_from_slice(&(slot as i32).to_le_bytes());
}

fn sse_load_via_ptr(buf: &mut Vec<u8>, xmm: u8, ptr_reg: u8, width: u64) {
    buf.push(if width == 4 { 0xF3 } else { 0xF2 });
    if ptr_reg >= 8 {
        buf.push(rex(false, xmm, 0, ptr_reg));
    }
    buf.push(0x0F);
    buf.push(0x10);
    buf.push(modrm(0, xmm, ptr_reg));
}

fn sse_store_via_ptr(buf: &mut Vec<u8>, ptr_reg: u8, width: u64, xmm: u8) {
    buf.push(if width == 4 { 0xF3 } else { 0xF2 });
    if ptr_reg >= 8 {
        buf.push(rex(false, xmm, 0, ptr_reg));
    }
    buf.push(0x0F);
    buf.push(0x11);
    buf.push(modrm(0, xmm, ptr_reg));
}

fn sse_rr(buf: &mut Vec<u8>, prefix: u8, opcode: u8, dst: u8, src: u8) {
    buf.push(prefix);
    buf.push(0x0F);
    buf.push(opcode);
    buf.push(modrm(3, dst, src));
}

fn cvtsd2ss(buf: &mut Vec<u8>, dst: u8, src: u8) {
    sse_rr(buf, 0xF2, 0x5A, dst, src);
}

fn cvtss2sd(buf: &mut Vec<u8>, dst: u8, src: u8) {
    sse_rr(buf, 0xF3, 0x5A, dst, src);
}

fn cvttsd2si(buf: &mut Vec<u8>, dst_gpr: u8, src_xmm: u8) {
    buf.push(0xF2);
    buf.push(rex(true, dst_gpr, 0, src_xmm));
    buf.push(0x0F);
    buf.push(0x2C);
    buf.push(modrm(3, dst_gpr, src_xmm));
}

fn cvtsi2sd(buf: &mut Vec<u8>, dst_xmm: u8, src_gpr: u8) {
    buf.push(0xF2);
    buf.push(rex(true, dst_xmm, 0, src_gpr));
    buf.push(0x0F);
    buf.push(0x2A);
    buf.push(modrm(3, dst_xmm, src_gpr));
}

fn width_of(ty: &Type) -> u64 {
    match ty.size() {
        1 => 1,
        2 => 2,
        4 => 4,
        _ => 8,
    }
}

fn int_binop_opcode(op: BinOp) -> Option<u8> {
    match op {
        BinOp::Add => Some(0x01),
        BinOp::Sub => Some(0x29),
        BinOp::BXor => Some(0x31),
        BinOp::BOr => Some(0x09),
        BinOp::BAnd => Some(0x21),
        _ => None,
    }
}

fn compare_cc(op: BinOp) -> Option<u8> {
    match op {
        BinOp::Less => Some(CC_B),
        BinOp::ILess => Some(CC_L),
        BinOp::Greater => Some(CC_A),
        BinOp::IGreater => Some(CC_G),
        BinOp::LessEq => Some(CC_BE),
        BinOp::ILessEq => Some(CC_LE),
        BinOp::GreaterEq => Some(CC_AE),
        BinOp::IGreaterEq => Some(CC_GE),
        BinOp::Equal => Some(CC_E),
        BinOp::NotEqual => Some(CC_NE),
        _ => None,
    }
}

fn float_compare_cc(op: BinOp) -> Option<u8> {
    match op {
        BinOp::FltLess => Some(CC_B),
        BinOp::FltGreater => Some(CC_A),
        BinOp::FltLessEq => Some(CC_BE),
        BinOp::FltGreaterEq => Some(CC_AE),
        BinOp::FltEqual => Some(CC_E),
        BinOp::FltNotEqual => Some(CC_NE),
        _ => None,
    }
}

// ---- per-function driver ----------------------------------------------

struct FuncCodegen<'f> {
    func: &'f Function,
    buf: Vec<u8>,
    block_start: HashMap<BlockId, usize>,
    fixups: Vec<(usize, BlockId)>,
    symbol_fixups: Vec<(usize, std::rc::Rc<str>, i64, u32)>,
    slot_of: HashMap<VarId, i64>,
    ty_of: HashMap<VarId, Type>,
    frame_size: i64,
    reg_save_base: Option<i64>,
    code_model: CodeModel,
}

impl<'f> FuncCodegen<'f> {
    fn new(func: &'f Function, config: &CompilerConfig) -> Self {
        let mut slot_of = HashMap::new();
        let mut ty_of = HashMap::new();
        let mut max_abs = 0i64;
        for v in &func.variables {
            let slot = v.stack_slot.unwrap_or(0);
            max_abs = max_abs.max(-slot);
            slot_of.insert(v.id, slot);
            ty_of.insert(v.id, v.ty.clone());
        }
        let mut frame_size = ((max_abs + 15) / 16) * 16;
        let reg_save_base = if func.uses_va {
            let base = -(frame_size + 48);
            frame_size += 48;
            frame_size = ((frame_size + 15) / 16) * 16;
            Some(base)
        } else {
            None
        };
        FuncCodegen {
            func,
            buf: Vec::new(),
            block_start: HashMap::new(),
            fixups: Vec::new(),
            symbol_fixups: Vec::new(),
            slot_of,
            ty_of,
            frame_size,
            reg_save_base,
            code_model: config.code_model,
        }
    }

    fn slot(&self, v: VarId) -> i64 {
        *self.slot_of.get(&v).unwrap_or(&0)
    }

    fn ty(&self, v: VarId) -> Type {
        self.ty_of.get(&v).cloned().unwrap_or_else(|| Type::raw_simple(SimpleKind::Long))
    }

    fn emit_prologue(&mut self) {
        self.buf.push(0x55); // push rbp
        self.buf.push(rex(true, RSP, 0, RBP));
        self.buf.push(0x89);
        self.buf.push(modrm(3, RSP, RBP)); // mov rbp, rsp
        if self.frame_size > 0 {
            self.buf.push(rex(true, 0, 0, RSP));
            self.buf.push(0x81);
            self.buf.push(modrm(3, 5, RSP));
            self.buf.extend_from_slice(&(self.frame_size as i32).to_le_bytes());
        }
        if let Some(base) = self.reg_save_base {
            for (i, &phys) in ARG_PHYS.iter().enumerate() {
                mov_store_slot(&mut self.buf, base + 8 * i as i64, phys);
            }
        }
    }

    fn emit_epilogue(&mut self) {
        self.block_start.insert(EPILOGUE_BLOCK, self.buf.len());
        self.buf.push(rex(true, RBP, 0, RSP));
        self.buf.push(0x89);
        self.buf.push(modrm(3, RBP, RSP)); // mov rsp, rbp
        self.buf.push(0x5D); // pop rbp
        self.buf.push(0xC3); // ret
    }

    fn jump_fixup(&mut self, target: BlockId) {
        let site = jmp_rel32(&mut self.buf);
        self.fixups.push((site, target));
    }

    fn patch_jumps(&mut self) {
        for (site, target) in &self.fixups {
            let target_off = *self.block_start.get(target).unwrap_or(&0) as i64;
            let rel = target_off - (*site as i64 + 4);
            self.buf[*site..*site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
    }

    /// Loads a symbol's effective address into `dst`, grounded on
    /// DESIGN.md's code-model decision: `Small` emits a RIP-relative
    /// `lea` (`R_X86_64_PC32`), `Large` an absolute `movabs`
    /// (`R_X86_64_64`).
    fn load_label_address(&mut self, dst: u8, label: &std::rc::Rc<str>, addend: i64) {
        match self.code_model {
            CodeModel::Small => {
                let site = lea_rip(&mut self.buf, dst);
                self.symbol_fixups.push((site, label.clone(), addend - 4, reloc::R_X86_64_PC32));
            }
            CodeModel::Large => {
                let site = self.buf.len();
                mov_imm64(&mut self.buf, dst, 0);
                let imm_site = site + (self.buf.len() - site - 8);
                self.symbol_fixups.push((imm_site, label.clone(), addend, reloc::R_X86_64_64));
            }
        }
    }

    fn emit_instruction(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        match instr {
            Instruction::BinaryOperator { result, op, lhs, rhs } => self.emit_binop(*result, *op, *lhs, *rhs),
            Instruction::NegateInt { result, operand } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*operand));
                neg_r(&mut self.buf, RAX);
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::NegateFloat { result, operand } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*operand));
                mov_imm64(&mut self.buf, RCX, i64::MIN);
                alu_rr(&mut self.buf, 0x31, RAX, RCX);
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::BinaryNot { result, operand } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*operand));
                not_r(&mut self.buf, RAX);
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::Load { result, pointer } => self.emit_load(*result, *pointer),
            Instruction::Store { value, pointer } => self.emit_store(*value, *pointer),
            Instruction::AddressOf { result, variable } => {
                lea_slot(&mut self.buf, RAX, self.slot(*variable));
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::SetZero { result } => {
                let size = self.ty(*result).size().max(8);
                let base = self.slot(*result);
                for off in 0..size as i64 {
                    mov_byte_zero_to_slot(&mut self.buf, base + off);
                }
            }
            Instruction::Copy { result, source } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*source));
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::Constant { result, value } => self.emit_constant(*result, value),
            Instruction::Call { function, .. } => {
                mov_load_slot(&mut self.buf, R10, self.slot(*function));
                self.buf.push(rex(false, 0, 0, R10));
                self.buf.push(0xFF);
                self.buf.push(modrm(3, 2, R10));
            }
            Instruction::BoolCast { result, rhs } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*rhs));
                test_rr(&mut self.buf, RAX, RAX);
                setcc(&mut self.buf, CC_NE, RAX);
                movzx_r64_r8(&mut self.buf, RAX, RAX);
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::IntCast { result, rhs, sign_extend } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*rhs));
                let width = width_of(&self.ty(*result));
                if width < 8 {
                    let shift = (64 - width * 8) as u8;
                    shift_imm(&mut self.buf, RAX, 4, shift);
                    shift_imm(&mut self.buf, RAX, if *sign_extend { 7 } else { 5 }, shift);
                }
                mov_store_slot(&mut self.buf, self.slot(*result), RAX);
            }
            Instruction::FloatCast { result, rhs } => {
                movsd_load_slot(&mut self.buf, 0, self.slot(*rhs));
                if self.ty(*result).size() == 4 {
                    cvtsd2ss(&mut self.buf, 0, 0);
                    cvtss2sd(&mut self.buf, 0, 0);
                }
                movsd_store_slot(&mut self.buf, self.slot(*result), 0);
            }
            Instruction::IntFloatCast { result, rhs, from_float, .. } => {
                if *from_float {
                    movsd_load_slot(&mut self.buf, 0, self.slot(*rhs));
                    cvttsd2si(&mut self.buf, RAX, 0);
                    mov_store_slot(&mut self.buf, self.slot(*result), RAX);
                } else {
                    mov_load_slot(&mut self.buf, RAX, self.slot(*rhs));
                    cvtsi2sd(&mut self.buf, 0, RAX);
                    movsd_store_slot(&mut self.buf, self.slot(*result), 0);
                }
            }
            Instruction::VaStart { result } => {
                let base = self.reg_save_base.unwrap_or(0);
                lea_slot(&mut self.buf, R10, base);
                mov_store_slot(&mut self.buf, self.slot(*result), R10);
            }
            Instruction::VaArg { result, array, ty } => {
                mov_load_slot(&mut self.buf, R10, self.slot(*array));
                let width = width_of(ty);
                if ty.is_floating() {
                    sse_load_via_ptr(&mut self.buf, 0, R10, width);
                    if width == 4 {
                        cvtss2sd(&mut self.buf, 0, 0);
                    }
                    movsd_store_slot(&mut self.buf, self.slot(*result), 0);
                } else {
                    load_via_ptr(&mut self.buf, RAX, R10, width, ty.is_signed());
                    mov_store_slot(&mut self.buf, self.slot(*result), RAX);
                }
                add_imm32(&mut self.buf, R10, 8);
                mov_store_slot(&mut self.buf, self.slot(*array), R10);
            }
            Instruction::VaCopy { dst, src, .. } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*src));
                mov_store_slot(&mut self.buf, self.slot(*dst), RAX);
            }
            Instruction::SetReg { variable, register_index, .. } => {
                let phys = ARG_PHYS[*register_index as usize];
                mov_load_slot(&mut self.buf, phys, self.slot(*variable));
            }
            Instruction::GetReg { result, register_index, .. } => {
                if *register_index == RETURN_REG {
                    mov_store_slot(&mut self.buf, self.slot(*result), RAX);
                } else {
                    let phys = ARG_PHYS[*register_index as usize];
                    mov_store_slot(&mut self.buf, self.slot(*result), phys);
                }
            }
            Instruction::StackAlloc { .. }
            | Instruction::AddTemporary { .. }
            | Instruction::ClearStackBucket { .. }
            | Instruction::ModifyStackPointer { .. }
            | Instruction::StoreStackRelative { .. }
            | Instruction::LoadBaseRelative { .. } => {
                return Err(CompileError::Ice {
                    site: "codegen::emit_instruction",
                    message: "opcode never emitted by this IR builder".into(),
                });
            }
        }
        Ok(())
    }

    fn emit_constant(&mut self, result: VarId, value: &Constant) {
        match value {
            Constant::Integer(_, v) => {
                mov_imm64(&mut self.buf, RAX, *v);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            Constant::Floating(_, v) => {
                mov_imm64(&mut self.buf, RAX, v.to_bits() as i64);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            Constant::LabelPointer(sym, addend) => {
                let name = crate::token::resolve(*sym);
                self.load_label_address(RAX, &name, *addend);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            Constant::Label(sym) => {
                let name = crate::token::resolve(*sym);
                self.load_label_address(RAX, &name, 0);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
        }
    }

    fn emit_load(&mut self, result: VarId, pointer: VarId) {
        mov_load_slot(&mut self.buf, R10, self.slot(pointer));
        let ty = self.ty(result);
        let width = width_of(&ty);
        if ty.is_floating() {
            sse_load_via_ptr(&mut self.buf, 0, R10, width);
            if width == 4 {
                cvtss2sd(&mut self.buf, 0, 0);
            }
            movsd_store_slot(&mut self.buf, self.slot(result), 0);
        } else {
            load_via_ptr(&mut self.buf, RAX, R10, width, ty.is_signed());
            mov_store_slot(&mut self.buf, self.slot(result), RAX);
        }
    }

    fn emit_store(&mut self, value: VarId, pointer: VarId) {
        mov_load_slot(&mut self.buf, R10, self.slot(pointer));
        let ty = self.ty(value);
        let width = width_of(&ty);
        if ty.is_floating() {
            movsd_load_slot(&mut self.buf, 0, self.slot(value));
            if width == 4 {
                cvtsd2ss(&mut self.buf, 0, 0);
            }
            sse_store_via_ptr(&mut self.buf, R10, width, 0);
        } else {
            mov_load_slot(&mut self.buf, RAX, self.slot(value));
            store_via_ptr(&mut self.buf, R10, width, RAX);
        }
    }

    fn emit_binop(&mut self, result: VarId, op: BinOp, lhs: VarId, rhs: VarId) {
        use BinOp::*;
        match op {
            Add | Sub | BXor | BOr | BAnd => {
                mov_load_slot(&mut self.buf, RAX, self.slot(lhs));
                mov_load_slot(&mut self.buf, RCX, self.slot(rhs));
                alu_rr(&mut self.buf, int_binop_opcode(op).unwrap(), RAX, RCX);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            Mul | IMul => {
                mov_load_slot(&mut self.buf, RAX, self.slot(lhs));
                mov_load_slot(&mut self.buf, RCX, self.slot(rhs));
                imul_rr(&mut self.buf, RAX, RCX);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            Div | IDiv | Mod | IMod => {
                mov_load_slot(&mut self.buf, RAX, self.slot(lhs));
                mov_load_slot(&mut self.buf, RCX, self.slot(rhs));
                let signed = matches!(op, IDiv | IMod);
                if signed {
                    cqo(&mut self.buf);
                    idiv_r(&mut self.buf, RCX);
                } else {
                    xor_edx_edx(&mut self.buf);
                    div_r(&mut self.buf, RCX);
                }
                let out = if matches!(op, Div | IDiv) { RAX } else { RDX };
                mov_store_slot(&mut self.buf, self.slot(result), out);
            }
            LShift | RShift | IRShift => {
                mov_load_slot(&mut self.buf, RAX, self.slot(lhs));
                mov_load_slot(&mut self.buf, RCX, self.slot(rhs));
                let which = match op {
                    LShift => 4,
                    RShift => 5,
                    _ => 7,
                };
                shift_cl(&mut self.buf, RAX, which);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            Less | ILess | Greater | IGreater | LessEq | ILessEq | GreaterEq | IGreaterEq | Equal | NotEqual => {
                mov_load_slot(&mut self.buf, RAX, self.slot(lhs));
                mov_load_slot(&mut self.buf, RCX, self.slot(rhs));
                alu_rr(&mut self.buf, 0x39, RAX, RCX); // cmp
                setcc(&mut self.buf, compare_cc(op).unwrap(), RAX);
                movzx_r64_r8(&mut self.buf, RAX, RAX);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
            FltAdd | FltSub | FltMul | FltDiv => {
                movsd_load_slot(&mut self.buf, 0, self.slot(lhs));
                movsd_load_slot(&mut self.buf, 1, self.slot(rhs));
                let opcode = match op {
                    FltAdd => 0x58,
                    FltSub => 0x5C,
                    FltMul => 0x59,
                    _ => 0x5E,
                };
                sse_rr(&mut self.buf, 0xF2, opcode, 0, 1);
                movsd_store_slot(&mut self.buf, self.slot(result), 0);
            }
            FltLess | FltGreater | FltLessEq | FltGreaterEq | FltEqual | FltNotEqual => {
                movsd_load_slot(&mut self.buf, 0, self.slot(lhs));
                movsd_load_slot(&mut self.buf, 1, self.slot(rhs));
                sse_rr(&mut self.buf, 0x66, 0x2F, 0, 1); // comisd
                setcc(&mut self.buf, float_compare_cc(op).unwrap(), RAX);
                movzx_r64_r8(&mut self.buf, RAX, RAX);
                mov_store_slot(&mut self.buf, self.slot(result), RAX);
            }
        }
    }

    fn emit_terminator(&mut self, term: &Terminator) -> Result<(), CompileError> {
        match term {
            Terminator::None => {}
            Terminator::Return { value, .. } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*value));
                self.jump_fixup(EPILOGUE_BLOCK);
            }
            Terminator::ReturnVoid => self.jump_fixup(EPILOGUE_BLOCK),
            Terminator::Jump(target) => self.jump_fixup(*target),
            Terminator::If { condition, block_true, block_false } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*condition));
                test_rr(&mut self.buf, RAX, RAX);
                let site = jcc_rel32(&mut self.buf, CC_NE);
                self.fixups.push((site, *block_true));
                self.jump_fixup(*block_false);
            }
            Terminator::Switch { condition, labels, default_block } => {
                mov_load_slot(&mut self.buf, RAX, self.slot(*condition));
                for CaseLabel { value, block } in labels {
                    let imm = match value {
                        Constant::Integer(_, v) => *v,
                        _ => {
                            return Err(CompileError::Ice {
                                site: "codegen::switch",
                                message: "non-integer case label".into(),
                            })
                        }
                    };
                    mov_imm64(&mut self.buf, RCX, imm);
                    alu_rr(&mut self.buf, 0x39, RAX, RCX);
                    let site = jcc_rel32(&mut self.buf, CC_E);
                    self.fixups.push((site, *block));
                }
                self.jump_fixup(*default_block);
            }
        }
        Ok(())
    }
}

fn emit_function(w: &mut ElfWriter, config: &CompilerConfig, func: &Function) -> Result<(), CompileError> {
    let mut cg = FuncCodegen::new(func, config);
    cg.emit_prologue();
    for block in &func.blocks {
        cg.block_start.insert(block.id, cg.buf.len());
        for instr in &block.instructions {
            cg.emit_instruction(instr)?;
        }
        cg.emit_terminator(&block.terminator)?;
    }
    cg.emit_epilogue();
    cg.patch_jumps();

    w.set_section(".text");
    w.symbol_set(&func.name, func.is_global);
    w.write(&cg.buf);
    let total = cg.buf.len() as i64;
    for (site, label, addend, rtype) in cg.symbol_fixups {
        w.symbol_relocate(&label, site as i64 - total, addend, rtype);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rex_sets_w_bit() {
        assert_eq!(rex(true, 0, 0, 0), 0x48);
    }

    #[test]
    fn rex_sets_extension_bits_for_high_registers() {
        // r8 as rm (bit 3 set) should set REX.B.
        assert_eq!(rex(false, 0, 0, 8) & 0x41, 0x41);
    }

    #[test]
    fn modrm_packs_fields() {
        assert_eq!(modrm(0b10, 0b011, 0b101), 0b10_011_101);
    }

    #[test]
    fn jmp_rel32_leaves_a_patchable_site() {
        let mut buf = Vec::new();
        let site = jmp_rel32(&mut buf);
        assert_eq!(buf[0], 0xE9);
        assert_eq!(site, 1);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn width_of_clamps_to_known_sizes() {
        assert_eq!(width_of(&Type::raw_simple(SimpleKind::Char)), 1);
        assert_eq!(width_of(&Type::raw_simple(SimpleKind::Int)), 4);
        assert_eq!(width_of(&Type::raw_simple(SimpleKind::Long)), 8);
    }

    #[test]
    fn compare_cc_distinguishes_signed_and_unsigned() {
        assert_eq!(compare_cc(BinOp::Less), Some(CC_B));
        assert_eq!(compare_cc(BinOp::ILess), Some(CC_L));
    }
}
