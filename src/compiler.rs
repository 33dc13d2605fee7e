//! The baseline function compiler.
//!
//! Translates one function body to x86-64 in a single pass. The machine
//! operand stack is the real stack: every wasm value lives in an 8-byte
//! slot below the frame's locals, 32-bit values zero-extended. The emitter
//! mirrors each push and pop on a compile-time [`StaticStack`], records
//! branch placeholders against integer continuation ids, and back-patches
//! them once the whole body has been emitted.
//!
//! Register conventions within a function body are deliberately simple:
//! between instructions every value is on the stack, and RAX/RCX/RDX/RSI/RDI
//! are free scratch. Results of a function return in RAX.

use log::{debug, trace};

use crate::codebuf::CodeBuffer;
use crate::frame::{FrameLayout, SpillSource};
use crate::reloc::{Reloc, RelocKind};
use crate::runtime::{
    FUNC_COMPILED_CODE_OFFSET, GLOBAL_VALUE_OFFSET, MEM_DATA_OFFSET, MEM_SIZE_OFFSET,
};
use crate::stack::{EXIT_CONTINUATION, StaticStack};
use crate::wasm::{BlockType, FuncBody, FuncType, Instruction, ValType};
use crate::x86_64::{AluOp, Cond, Reg, ShiftOp, X86_64Assembler};

/// Error type for compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileError {
    /// The function uses a construct outside the supported subset.
    UnsupportedOp(&'static str),
    /// An offset, arity or size computation overflowed.
    Overflow(&'static str),
    /// A local index has no frame slot.
    BadLocal(u32),
    /// A branch depth has no matching label.
    BadLabel(u32),
    /// A function, type or global index is out of range.
    BadIndex(&'static str, u32),
    /// The frame layout exceeds the addressable range.
    FrameTooLarge,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnsupportedOp(what) => write!(f, "unsupported operation: {}", what),
            CompileError::Overflow(what) => write!(f, "arithmetic overflow computing {}", what),
            CompileError::BadLocal(idx) => write!(f, "local index {} out of range", idx),
            CompileError::BadLabel(depth) => {
                write!(f, "branch depth {} has no matching label", depth)
            }
            CompileError::BadIndex(what, idx) => write!(f, "{} index {} out of range", what, idx),
            CompileError::FrameTooLarge => write!(f, "frame layout exceeds addressable range"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Compilation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Emit an `int3` at the top of every prologue so a debugger stops on
    /// entry to generated code.
    pub debug_trap: bool,
}

/// Module-level tables the compiler consults while emitting calls and
/// global accesses.
#[derive(Debug, Clone, Copy)]
pub struct ModuleContext<'a> {
    /// The module's type section, indexed by `call_indirect` immediates.
    pub types: &'a [FuncType],
    /// Signature of every function in the module, indexed by `call`
    /// immediates.
    pub func_types: &'a [FuncType],
    /// Declared type of every global, indexed by `get_global`/`set_global`
    /// immediates.
    pub globals: &'a [ValType],
}

/// The output of one compilation: raw position-independent code plus the
/// relocation records the loader must patch before execution.
#[derive(Debug)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
}

/// A pending branch: a 5-byte near-jump placeholder at `site` waiting for
/// continuation `cont` to resolve.
struct BranchSite {
    site: usize,
    cont: usize,
}

/// Where one call argument goes under the System V mapping.
#[derive(Debug, Clone, Copy)]
enum ArgLoc {
    Gpr(Reg),
    Xmm(u8),
    Stack,
}

/// Compile a single function.
///
/// `func_type` is the signature of the function being compiled; `body`
/// carries its local declarations and instruction tree. On error the
/// partial buffer is discarded.
pub fn compile_function(
    cx: &ModuleContext,
    func_type: &FuncType,
    body: &FuncBody,
    opts: &CompileOptions,
) -> Result<CompiledFunction, CompileError> {
    if func_type.results.len() > 1 {
        return Err(CompileError::UnsupportedOp("multi-value result"));
    }
    let frame = FrameLayout::for_function(&func_type.params, &body.locals)?;
    debug!(
        "compiling function: {} params, {} frame locals, result {:?}",
        func_type.params.len(),
        frame.n_frame_locals(),
        func_type.results.first()
    );

    let mut c = FunctionCompiler {
        cx,
        buf: CodeBuffer::with_capacity(1024),
        stack: StaticStack::new(),
        labels: Vec::new(),
        branches: Vec::new(),
        relocs: Vec::new(),
        frame,
        result: func_type.results.first().copied(),
        debug_trap: opts.debug_trap,
    };

    c.emit_prologue();

    // The body behaves like a block whose label is the function exit.
    let result = c.result;
    let arity = result.map_or(0, |_| 1);
    c.stack.push_label(arity, EXIT_CONTINUATION);
    c.emit_seq(&body.instrs)?;
    c.end_block(0, arity, result);
    debug_assert_eq!(c.stack.len(), arity);

    let exit = c.buf.offset();
    c.patch_branches(exit)?;
    c.emit_epilogue();

    debug!(
        "compiled: {} bytes, {} relocations, {} branch sites",
        c.buf.len(),
        c.relocs.len(),
        c.branches.len()
    );
    Ok(CompiledFunction {
        code: c.buf.into_code(),
        relocs: c.relocs,
    })
}

struct FunctionCompiler<'a> {
    cx: &'a ModuleContext<'a>,
    buf: CodeBuffer,
    stack: StaticStack,
    /// Continuation id -> resolved code offset.
    labels: Vec<Option<usize>>,
    branches: Vec<BranchSite>,
    relocs: Vec<Reloc>,
    frame: FrameLayout,
    result: Option<ValType>,
    debug_trap: bool,
}

impl<'a> FunctionCompiler<'a> {
    // ==================== Prologue / Epilogue ====================

    fn emit_prologue(&mut self) {
        let frame_bytes = self.frame.frame_bytes();
        let decl_base = self.frame.decl_locals_base();
        let n_decl = self.frame.n_decl_locals();
        let spills: Vec<(SpillSource, i32)> = self.frame.spills().to_vec();

        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        if self.debug_trap {
            asm.int3();
        }
        if frame_bytes > 0 {
            asm.sub_ri32(Reg::Rsp, frame_bytes);
        }

        // Spill register parameters to their frame slots.
        for (src, fp_offset) in spills {
            match src {
                SpillSource::Gpr(reg) => asm.mov_mr(Reg::Rbp, fp_offset, reg),
                SpillSource::Xmm(xmm) => asm.movsd_mr(Reg::Rbp, fp_offset, xmm),
            }
        }

        // Zero the declared locals: single store for one, string store loop
        // for more.
        match n_decl {
            0 => {}
            1 => asm.mov_mi(Reg::Rbp, decl_base, 0),
            n => {
                asm.lea(Reg::Rdi, Reg::Rbp, decl_base);
                asm.mov_r32_i32(Reg::Rcx, n as i32);
                asm.alu_rr32(AluOp::Xor, Reg::Rax, Reg::Rax);
                asm.rep_stosq();
            }
        }
    }

    fn emit_epilogue(&mut self) {
        let frame_bytes = self.frame.frame_bytes();
        let has_result = self.result.is_some();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        if has_result {
            asm.pop(Reg::Rax);
        }
        if frame_bytes > 0 {
            asm.add_ri32(Reg::Rsp, frame_bytes);
        }
        asm.pop(Reg::Rbp);
        asm.ret();
    }

    // ==================== Labels and branches ====================

    fn alloc_continuation(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn resolve_continuation(&mut self, cont: usize, offset: usize) {
        debug_assert!(self.labels[cont].is_none());
        self.labels[cont] = Some(offset);
    }

    /// Byte size of `slots` 8-byte stack slots, checked against the i32
    /// displacement range.
    fn slot_bytes(slots: usize) -> Result<i32, CompileError> {
        let bytes = (slots as u64)
            .checked_mul(8)
            .ok_or(CompileError::Overflow("stack offset"))?;
        i32::try_from(bytes).map_err(|_| CompileError::Overflow("stack offset"))
    }

    /// Emit the stack adjustment and placeholder jump for a branch to the
    /// label at relative depth `labelidx`.
    ///
    /// The static stack is left untouched: instructions after an
    /// unconditional branch are unreachable but must still emit.
    fn emit_branch(&mut self, labelidx: u32) -> Result<(), CompileError> {
        let (idx, arity, cont) = self
            .stack
            .find_label(labelidx)
            .ok_or(CompileError::BadLabel(labelidx))?;
        let depth = self.stack.len() - idx;
        // Slots to discard: everything above the label except the label
        // slots still in scope and the values the target receives.
        let shift = depth as i64 - (labelidx as i64 + 1) - arity as i64;

        if shift > 0 {
            let shift = usize::try_from(shift).unwrap_or(usize::MAX);
            let shift_bytes = Self::slot_bytes(shift)?;
            let mut asm = X86_64Assembler::new(&mut self.buf);
            if arity > 0 {
                // Copy the top `arity` values down over the discarded slots.
                // The regions overlap and the destination is above the
                // source, so the copy must run downward from the top.
                let top = Self::slot_bytes(arity - 1)?;
                asm.mov_r32_i32(Reg::Rcx, arity as i32);
                asm.lea(Reg::Rsi, Reg::Rsp, top);
                asm.lea(Reg::Rdi, Reg::Rsp, shift_bytes + top);
                asm.std();
                asm.rep_movsq();
                asm.cld();
            }
            asm.add_ri32(Reg::Rsp, shift_bytes);
        }

        let site = self.buf.offset();
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.jmp_rel32(0);
        }
        self.branches.push(BranchSite { site, cont });
        Ok(())
    }

    fn patch_branches(&mut self, exit: usize) -> Result<(), CompileError> {
        for branch in &self.branches {
            let target = if branch.cont == EXIT_CONTINUATION {
                exit
            } else {
                self.labels[branch.cont]
                    .ok_or(CompileError::BadLabel(branch.cont as u32))?
            };
            let rel = target as i64 - branch.site as i64 - 5;
            let rel =
                i32::try_from(rel).map_err(|_| CompileError::Overflow("branch displacement"))?;
            trace!("patching branch at {:#x} -> {:#x}", branch.site, target);
            self.buf.patch_u32(branch.site + 1, rel as u32);
        }
        Ok(())
    }

    /// Close the block whose label sits at `label_pos`: shift the top
    /// `arity` values down over the label slot and discard any slack. This
    /// is a static-stack operation only; on a live path the machine stack
    /// already has exactly the block's results on top.
    fn end_block(&mut self, label_pos: usize, arity: usize, result_ty: Option<ValType>) {
        debug_assert!(arity <= 1);
        let avail = self.stack.len() - label_pos - 1;
        if arity == 1 {
            let ty = if avail >= 1 {
                // The top value is the block's result.
                self.stack.peek().or(result_ty).unwrap_or(ValType::I32)
            } else {
                // Unreachable tail produced nothing; track the declared type.
                result_ty.unwrap_or(ValType::I32)
            };
            self.stack.truncate(label_pos);
            self.stack.push(ty);
        } else {
            self.stack.truncate(label_pos);
        }
    }

    // ==================== Instruction dispatch ====================

    fn emit_seq(&mut self, instrs: &[Instruction]) -> Result<(), CompileError> {
        for instr in instrs {
            self.emit_instr(instr)?;
        }
        Ok(())
    }

    fn emit_instr(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        match instr {
            Instruction::Unreachable => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.ud2();
                Ok(())
            }
            Instruction::Nop => Ok(()),

            Instruction::Block { ty, body } => self.emit_block(*ty, body),
            Instruction::Loop { ty, body } => self.emit_loop(*ty, body),
            Instruction::If {
                ty,
                then_body,
                else_body,
            } => self.emit_if(*ty, then_body, else_body.as_deref()),
            Instruction::Br(depth) => self.emit_branch(*depth),
            Instruction::BrIf(depth) => self.emit_br_if(*depth),
            Instruction::BrTable { targets, default } => self.emit_br_table(targets, *default),
            Instruction::Return => self.emit_return(),
            Instruction::Call(idx) => self.emit_call(*idx),
            Instruction::CallIndirect(type_idx) => self.emit_call_indirect(*type_idx),

            Instruction::Drop => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.add_ri32(Reg::Rsp, 8);
                }
                self.stack.pop();
                Ok(())
            }

            Instruction::GetLocal(idx) => self.emit_get_local(*idx),
            Instruction::SetLocal(idx) => self.emit_set_local(*idx),
            Instruction::TeeLocal(idx) => self.emit_tee_local(*idx),
            Instruction::GetGlobal(idx) => self.emit_get_global(*idx),
            Instruction::SetGlobal(idx) => self.emit_set_global(*idx),

            Instruction::I32Load { offset } => self.emit_load(*offset, LoadKind::I32),
            Instruction::I64Load { offset } => self.emit_load(*offset, LoadKind::I64),
            Instruction::F64Load { offset } => self.emit_load(*offset, LoadKind::F64),
            Instruction::I32Load8S { offset } => self.emit_load(*offset, LoadKind::I32S8),
            Instruction::I32Store { offset } => self.emit_store(*offset, StoreKind::Word),
            Instruction::I64Store { offset } => self.emit_store(*offset, StoreKind::Qword),
            Instruction::F64Store { offset } => self.emit_store(*offset, StoreKind::Qword),
            Instruction::I32Store8 { offset } => self.emit_store(*offset, StoreKind::Byte),
            Instruction::I32Store16 { offset } => self.emit_store(*offset, StoreKind::Half),

            Instruction::I32Const(v) => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.mov_r32_i32(Reg::Rax, *v);
                    asm.push(Reg::Rax);
                }
                self.stack.push(ValType::I32);
                Ok(())
            }
            Instruction::I64Const(v) => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.mov_ri64(Reg::Rax, *v);
                    asm.push(Reg::Rax);
                }
                self.stack.push(ValType::I64);
                Ok(())
            }
            Instruction::F64Const(v) => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.mov_ri64(Reg::Rax, v.to_bits() as i64);
                    asm.push(Reg::Rax);
                }
                self.stack.push(ValType::F64);
                Ok(())
            }

            Instruction::I32Eqz => self.emit_eqz(),
            Instruction::I32Eq => self.emit_cmp_i32(Cond::E),
            Instruction::I32Ne => self.emit_cmp_i32(Cond::Ne),
            Instruction::I32LtS => self.emit_cmp_i32(Cond::L),
            Instruction::I32LtU => self.emit_cmp_i32(Cond::B),
            Instruction::I32GtS => self.emit_cmp_i32(Cond::G),
            Instruction::I32GtU => self.emit_cmp_i32(Cond::A),
            Instruction::I32LeS => self.emit_cmp_i32(Cond::Le),
            Instruction::I32LeU => self.emit_cmp_i32(Cond::Be),
            Instruction::I32GeS => self.emit_cmp_i32(Cond::Ge),
            Instruction::I64Eq => self.emit_cmp_i64(Cond::E),
            Instruction::I64Ne => self.emit_cmp_i64(Cond::Ne),
            Instruction::I64LtS => self.emit_cmp_i64(Cond::L),
            Instruction::I64LtU => self.emit_cmp_i64(Cond::B),
            Instruction::I64GtS => self.emit_cmp_i64(Cond::G),
            Instruction::I64GtU => self.emit_cmp_i64(Cond::A),
            Instruction::I64LeS => self.emit_cmp_i64(Cond::Le),
            Instruction::I64LeU => self.emit_cmp_i64(Cond::Be),
            Instruction::I64GeS => self.emit_cmp_i64(Cond::Ge),
            Instruction::F64Eq => self.emit_cmp_f64(Cond::E),
            Instruction::F64Ne => self.emit_cmp_f64(Cond::Ne),

            Instruction::I32Add => self.emit_binop_i32(AluOp::Add),
            Instruction::I32Sub => self.emit_binop_i32(AluOp::Sub),
            Instruction::I32And => self.emit_binop_i32(AluOp::And),
            Instruction::I32Or => self.emit_binop_i32(AluOp::Or),
            Instruction::I32Xor => self.emit_binop_i32(AluOp::Xor),
            Instruction::I64Add => self.emit_binop_i64(AluOp::Add),
            Instruction::I64Sub => self.emit_binop_i64(AluOp::Sub),
            Instruction::I64And => self.emit_binop_i64(AluOp::And),
            Instruction::I64Or => self.emit_binop_i64(AluOp::Or),
            Instruction::I64Xor => self.emit_binop_i64(AluOp::Xor),
            Instruction::I32Shl => self.emit_shift_i32(ShiftOp::Shl),
            Instruction::I32ShrS => self.emit_shift_i32(ShiftOp::Sar),
            Instruction::I32ShrU => self.emit_shift_i32(ShiftOp::Shr),
            Instruction::I64Shl => self.emit_shift_i64(ShiftOp::Shl),
            Instruction::I64ShrS => self.emit_shift_i64(ShiftOp::Sar),
            Instruction::I64ShrU => self.emit_shift_i64(ShiftOp::Shr),
            Instruction::I32Mul => self.emit_mul(false),
            Instruction::I64Mul => self.emit_mul(true),
            Instruction::I32DivS => self.emit_div(false, true, false),
            Instruction::I32DivU => self.emit_div(false, false, false),
            Instruction::I32RemS => self.emit_div(false, true, true),
            Instruction::I32RemU => self.emit_div(false, false, true),
            Instruction::I64DivS => self.emit_div(true, true, false),
            Instruction::I64DivU => self.emit_div(true, false, false),
            Instruction::I64RemS => self.emit_div(true, true, true),
            Instruction::I64RemU => self.emit_div(true, false, true),

            Instruction::F64Neg => {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.mov_ri64(Reg::Rax, i64::MIN);
                asm.alu_mr(AluOp::Xor, Reg::Rsp, 0, Reg::Rax);
                Ok(())
            }
            Instruction::F64Add => self.emit_f64_binop(F64Op::Add),
            Instruction::F64Sub => self.emit_f64_binop(F64Op::Sub),
            Instruction::F64Mul => self.emit_f64_binop(F64Op::Mul),

            Instruction::I32WrapI64 => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.pop(Reg::Rax);
                    asm.mov_r32_r32(Reg::Rax, Reg::Rax);
                    asm.push(Reg::Rax);
                }
                self.retype(ValType::I32);
                Ok(())
            }
            Instruction::I64ExtendSI32 => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.pop(Reg::Rax);
                    asm.movsxd(Reg::Rax, Reg::Rax);
                    asm.push(Reg::Rax);
                }
                self.retype(ValType::I64);
                Ok(())
            }
            Instruction::I64ExtendUI32 => {
                // The upper half of an i32 slot is already zero.
                self.retype(ValType::I64);
                Ok(())
            }
            Instruction::I32TruncSF64 => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.pop(Reg::Rax);
                    asm.movq_xmm_r64(0, Reg::Rax);
                    asm.cvttsd2si_r32_xmm(Reg::Rax, 0);
                    asm.push(Reg::Rax);
                }
                self.retype(ValType::I32);
                Ok(())
            }
            Instruction::I32TruncUF64 => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.pop(Reg::Rax);
                    asm.movq_xmm_r64(0, Reg::Rax);
                    asm.cvttsd2si_r64_xmm(Reg::Rax, 0);
                    asm.mov_r32_r32(Reg::Rax, Reg::Rax);
                    asm.push(Reg::Rax);
                }
                self.retype(ValType::I32);
                Ok(())
            }
            Instruction::F64ConvertSI32 => {
                {
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.pop(Reg::Rax);
                    asm.cvtsi2sd_xmm_r32(0, Reg::Rax);
                    asm.movq_r64_xmm(Reg::Rax, 0);
                    asm.push(Reg::Rax);
                }
                self.retype(ValType::F64);
                Ok(())
            }
            Instruction::F64ConvertUI32 => {
                {
                    // The slot's upper half is zero, so the 64-bit signed
                    // conversion is exact for any u32.
                    let mut asm = X86_64Assembler::new(&mut self.buf);
                    asm.pop(Reg::Rax);
                    asm.cvtsi2sd_xmm_r64(0, Reg::Rax);
                    asm.movq_r64_xmm(Reg::Rax, 0);
                    asm.push(Reg::Rax);
                }
                self.retype(ValType::F64);
                Ok(())
            }
            Instruction::I64ReinterpretF64 => {
                self.retype(ValType::I64);
                Ok(())
            }
            Instruction::F64ReinterpretI64 => {
                self.retype(ValType::F64);
                Ok(())
            }
        }
    }

    /// Replace the type of the top value slot (conversions that reuse the
    /// slot's bit pattern).
    fn retype(&mut self, ty: ValType) {
        if self.stack.pop().is_some() {
            self.stack.push(ty);
        }
    }

    // ==================== Control structures ====================

    fn emit_block(&mut self, ty: BlockType, body: &[Instruction]) -> Result<(), CompileError> {
        let cont = self.alloc_continuation();
        self.stack.push_label(ty.arity(), cont);
        let label_pos = self.stack.len() - 1;
        self.emit_seq(body)?;
        self.end_block(label_pos, ty.arity(), ty.0);
        let after = self.buf.offset();
        self.resolve_continuation(cont, after);
        Ok(())
    }

    fn emit_loop(&mut self, ty: BlockType, body: &[Instruction]) -> Result<(), CompileError> {
        let cont = self.alloc_continuation();
        // Branches to a loop label go backwards, to the first byte of the
        // loop body.
        let head = self.buf.offset();
        self.resolve_continuation(cont, head);
        self.stack.push_label(ty.arity(), cont);
        let label_pos = self.stack.len() - 1;
        self.emit_seq(body)?;
        self.end_block(label_pos, ty.arity(), ty.0);
        Ok(())
    }

    fn emit_if(
        &mut self,
        ty: BlockType,
        then_body: &[Instruction],
        else_body: Option<&[Instruction]>,
    ) -> Result<(), CompileError> {
        // Consume the predicate and jump over the then-sequence when it is
        // zero.
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rax);
            asm.test_rr32(Reg::Rax, Reg::Rax);
            asm.jcc_rel32(Cond::E, 0);
        }
        self.stack.pop();
        let skip_then_at = self.buf.offset() - 4;

        let cont = self.alloc_continuation();
        self.stack.push_label(ty.arity(), cont);
        let label_pos = self.stack.len() - 1;
        self.emit_seq(then_body)?;

        if let Some(else_body) = else_body {
            {
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.jmp_rel32(0);
            }
            let skip_else_at = self.buf.offset() - 4;
            let else_start = self.buf.offset();
            self.patch_rel32(skip_then_at, else_start)?;

            // The else-arm starts from the same stack as the then-arm did.
            self.stack.truncate(label_pos + 1);
            self.emit_seq(else_body)?;
            self.end_block(label_pos, ty.arity(), ty.0);
            let join = self.buf.offset();
            self.patch_rel32(skip_else_at, join)?;
        } else {
            self.end_block(label_pos, ty.arity(), ty.0);
            let join = self.buf.offset();
            self.patch_rel32(skip_then_at, join)?;
        }

        let after = self.buf.offset();
        self.resolve_continuation(cont, after);
        Ok(())
    }

    /// Patch a rel32 field at `field_at` to land on `target`.
    fn patch_rel32(&mut self, field_at: usize, target: usize) -> Result<(), CompileError> {
        let rel = target as i64 - (field_at as i64 + 4);
        let rel = i32::try_from(rel).map_err(|_| CompileError::Overflow("branch displacement"))?;
        self.buf.patch_u32(field_at, rel as u32);
        Ok(())
    }

    fn emit_br_if(&mut self, depth: u32) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rax);
            asm.test_rr32(Reg::Rax, Reg::Rax);
            asm.jcc_rel8(Cond::E, 0);
        }
        self.stack.pop();
        let skip_at = self.buf.offset() - 1;

        self.emit_branch(depth)?;

        let dist = self.buf.offset() - (skip_at + 1);
        debug_assert!(dist <= i8::MAX as usize);
        self.buf.patch_u8(skip_at, dist as u8);
        Ok(())
    }

    fn emit_br_table(&mut self, targets: &[u32], default: u32) -> Result<(), CompileError> {
        let len = i32::try_from(targets.len())
            .map_err(|_| CompileError::Overflow("branch table length"))?;

        // Selector bounds check, then a pc-relative dispatch through an
        // inline table of 32-bit offsets from the table base.
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rax);
            asm.cmp_r32_i32(Reg::Rax, len);
            asm.jcc_rel32(Cond::Ae, 0);
        }
        self.stack.pop();
        let default_jump_at = self.buf.offset() - 4;

        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.lea_rip(Reg::Rcx, 0);
        }
        let lea_disp_at = self.buf.offset() - 4;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.movsxd_rm_s4(Reg::Rax, Reg::Rcx, Reg::Rax);
            asm.alu_rr(AluOp::Add, Reg::Rax, Reg::Rcx);
            asm.jmp_r(Reg::Rax);
        }

        let table_at = self.buf.offset();
        self.patch_rel32(lea_disp_at, table_at)?;
        for _ in targets {
            self.buf.emit_u32(0);
        }

        // Every case starts from the same static stack, and a branch
        // sequence never mutates it, so the cases can be emitted back to
        // back.
        for (i, &target) in targets.iter().enumerate() {
            let case_at = self.buf.offset();
            let entry = i32::try_from(case_at - table_at)
                .map_err(|_| CompileError::Overflow("branch table entry"))?;
            self.buf.patch_u32(table_at + i * 4, entry as u32);
            self.emit_branch(target)?;
        }

        let default_at = self.buf.offset();
        self.patch_rel32(default_jump_at, default_at)?;
        self.emit_branch(default)?;
        Ok(())
    }

    fn emit_return(&mut self) -> Result<(), CompileError> {
        // A return is a branch to the function's own label, which is always
        // the outermost one.
        let mut labels = 0u32;
        for entry in self.stack.entries() {
            if matches!(entry, crate::stack::StackEntry::Label { .. }) {
                labels += 1;
            }
        }
        debug_assert!(labels > 0);
        self.emit_branch(labels - 1)
    }

    // ==================== Locals and globals ====================

    fn emit_get_local(&mut self, idx: u32) -> Result<(), CompileError> {
        let slot = self.frame.local(idx)?;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.push_m(Reg::Rbp, slot.fp_offset);
        }
        self.stack.push(slot.ty);
        Ok(())
    }

    fn emit_set_local(&mut self, idx: u32) -> Result<(), CompileError> {
        let slot = self.frame.local(idx)?;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop_m(Reg::Rbp, slot.fp_offset);
        }
        self.stack.pop();
        Ok(())
    }

    fn emit_tee_local(&mut self, idx: u32) -> Result<(), CompileError> {
        let slot = self.frame.local(idx)?;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.mov_rm(Reg::Rax, Reg::Rsp, 0);
        asm.mov_mr(Reg::Rbp, slot.fp_offset, Reg::Rax);
        Ok(())
    }

    fn emit_get_global(&mut self, idx: u32) -> Result<(), CompileError> {
        let ty = *self
            .cx
            .globals
            .get(idx as usize)
            .ok_or(CompileError::BadIndex("global", idx))?;
        self.emit_reloc_mov(Reg::Rax, RelocKind::Global, idx);
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            match ty {
                ValType::I32 | ValType::F32 => asm.mov_rm32(Reg::Rax, Reg::Rax, GLOBAL_VALUE_OFFSET),
                ValType::I64 | ValType::F64 => asm.mov_rm(Reg::Rax, Reg::Rax, GLOBAL_VALUE_OFFSET),
            }
            asm.push(Reg::Rax);
        }
        self.stack.push(ty);
        Ok(())
    }

    fn emit_set_global(&mut self, idx: u32) -> Result<(), CompileError> {
        let ty = *self
            .cx
            .globals
            .get(idx as usize)
            .ok_or(CompileError::BadIndex("global", idx))?;
        self.emit_reloc_mov(Reg::Rax, RelocKind::Global, idx);
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            match ty {
                ValType::I32 | ValType::F32 => {
                    asm.mov_mr32(Reg::Rax, GLOBAL_VALUE_OFFSET, Reg::Rcx)
                }
                ValType::I64 | ValType::F64 => asm.mov_mr(Reg::Rax, GLOBAL_VALUE_OFFSET, Reg::Rcx),
            }
        }
        self.stack.pop();
        Ok(())
    }

    // ==================== Memory access ====================

    /// Emit the shared prelude of every load and store: compute the padded
    /// effective address in RAX, trap if it exceeds the memory's size, and
    /// leave the data pointer in RCX.
    ///
    /// The 4-byte pad makes the single compare cover the width of a word
    /// access at the unpadded address; the access itself then targets
    /// `[data + ea - 4]`.
    fn emit_memory_check(&mut self, offset: u32, size_scratch: Reg) -> Result<(), CompileError> {
        let padded = offset
            .checked_add(4)
            .ok_or(CompileError::Overflow("memory offset"))?;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.add_r32_i32(Reg::Rax, padded as i32);
        }
        self.emit_reloc_mov(Reg::Rcx, RelocKind::Mem, 0);
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.mov_rm(size_scratch, Reg::Rcx, MEM_SIZE_OFFSET);
        asm.alu_rr(AluOp::Cmp, Reg::Rax, size_scratch);
        asm.jcc_rel8(Cond::Be, 1);
        asm.int3();
        asm.mov_rm(Reg::Rcx, Reg::Rcx, MEM_DATA_OFFSET);
        Ok(())
    }

    fn emit_load(&mut self, offset: u32, kind: LoadKind) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rax);
        }
        self.stack.pop();
        self.emit_memory_check(offset, Reg::Rdx)?;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            match kind {
                LoadKind::I32 => asm.mov_rm32_bi(Reg::Rax, Reg::Rcx, Reg::Rax, -4),
                LoadKind::I64 | LoadKind::F64 => asm.mov_rm_bi(Reg::Rax, Reg::Rcx, Reg::Rax, -4),
                LoadKind::I32S8 => asm.movsx_r32_m8_bi(Reg::Rax, Reg::Rcx, Reg::Rax, -4),
            }
            asm.push(Reg::Rax);
        }
        self.stack.push(kind.result_type());
        Ok(())
    }

    fn emit_store(&mut self, offset: u32, kind: StoreKind) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rdx);
            asm.pop(Reg::Rax);
        }
        self.stack.pop();
        self.stack.pop();
        self.emit_memory_check(offset, Reg::Rsi)?;
        let mut asm = X86_64Assembler::new(&mut self.buf);
        match kind {
            StoreKind::Byte => asm.mov_mr8_bi(Reg::Rcx, Reg::Rax, -4, Reg::Rdx),
            StoreKind::Half => asm.mov_mr16_bi(Reg::Rcx, Reg::Rax, -4, Reg::Rdx),
            StoreKind::Word => asm.mov_mr32_bi(Reg::Rcx, Reg::Rax, -4, Reg::Rdx),
            StoreKind::Qword => asm.mov_mr_bi(Reg::Rcx, Reg::Rax, -4, Reg::Rdx),
        }
        Ok(())
    }

    // ==================== Comparisons ====================

    fn emit_eqz(&mut self) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rax);
            asm.test_rr32(Reg::Rax, Reg::Rax);
            asm.setcc(Cond::E, Reg::Rax);
            asm.movzx_r32_r8(Reg::Rax, Reg::Rax);
            asm.push(Reg::Rax);
        }
        self.stack.pop();
        self.stack.push(ValType::I32);
        Ok(())
    }

    fn emit_cmp_i32(&mut self, cond: Cond) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            asm.alu_rr32(AluOp::Cmp, Reg::Rax, Reg::Rcx);
            asm.setcc(cond, Reg::Rax);
            asm.movzx_r32_r8(Reg::Rax, Reg::Rax);
            asm.push(Reg::Rax);
        }
        self.finish_cmp();
        Ok(())
    }

    fn emit_cmp_i64(&mut self, cond: Cond) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            asm.alu_rr(AluOp::Cmp, Reg::Rax, Reg::Rcx);
            asm.setcc(cond, Reg::Rax);
            asm.movzx_r32_r8(Reg::Rax, Reg::Rax);
            asm.push(Reg::Rax);
        }
        self.finish_cmp();
        Ok(())
    }

    fn emit_cmp_f64(&mut self, cond: Cond) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            asm.movq_xmm_r64(0, Reg::Rax);
            asm.movq_xmm_r64(1, Reg::Rcx);
            asm.ucomisd(0, 1);
            asm.setcc(cond, Reg::Rax);
            asm.movzx_r32_r8(Reg::Rax, Reg::Rax);
            asm.push(Reg::Rax);
        }
        self.finish_cmp();
        Ok(())
    }

    fn finish_cmp(&mut self) {
        self.stack.pop();
        self.stack.pop();
        self.stack.push(ValType::I32);
    }

    // ==================== Integer arithmetic ====================

    fn emit_binop_i32(&mut self, op: AluOp) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.alu_mr32(op, Reg::Rsp, 0, Reg::Rcx);
        }
        self.stack.pop();
        Ok(())
    }

    fn emit_binop_i64(&mut self, op: AluOp) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.alu_mr(op, Reg::Rsp, 0, Reg::Rcx);
        }
        self.stack.pop();
        Ok(())
    }

    fn emit_shift_i32(&mut self, op: ShiftOp) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.shift_m32_cl(op, Reg::Rsp, 0);
        }
        self.stack.pop();
        Ok(())
    }

    fn emit_shift_i64(&mut self, op: ShiftOp) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.shift_m_cl(op, Reg::Rsp, 0);
        }
        self.stack.pop();
        Ok(())
    }

    fn emit_mul(&mut self, wide: bool) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            if wide {
                asm.imul_rr(Reg::Rax, Reg::Rcx);
            } else {
                asm.imul_rr32(Reg::Rax, Reg::Rcx);
            }
            asm.push(Reg::Rax);
        }
        self.stack.pop();
        Ok(())
    }

    fn emit_div(&mut self, wide: bool, signed: bool, rem: bool) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rcx);
            asm.pop(Reg::Rax);
            match (wide, signed) {
                (false, true) => {
                    asm.cdq();
                    asm.idiv_r32(Reg::Rcx);
                }
                (false, false) => {
                    asm.alu_rr32(AluOp::Xor, Reg::Rdx, Reg::Rdx);
                    asm.div_r32(Reg::Rcx);
                }
                (true, true) => {
                    asm.cqo();
                    asm.idiv(Reg::Rcx);
                }
                (true, false) => {
                    asm.alu_rr32(AluOp::Xor, Reg::Rdx, Reg::Rdx);
                    asm.div(Reg::Rcx);
                }
            }
            asm.push(if rem { Reg::Rdx } else { Reg::Rax });
        }
        self.stack.pop();
        Ok(())
    }

    // ==================== Floating point ====================

    fn emit_f64_binop(&mut self, op: F64Op) -> Result<(), CompileError> {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rax);
            asm.movq_xmm_r64(1, Reg::Rax);
            asm.movsd_rm(0, Reg::Rsp, 0);
            match op {
                F64Op::Add => asm.addsd(0, 1),
                F64Op::Sub => asm.subsd(0, 1),
                F64Op::Mul => asm.mulsd(0, 1),
            }
            asm.movsd_mr(Reg::Rsp, 0, 0);
        }
        self.stack.pop();
        Ok(())
    }

    // ==================== Calls ====================

    fn emit_reloc_mov(&mut self, reg: Reg, kind: RelocKind, index: u32) {
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.mov_ri64(reg, 0);
        }
        let offset = self.buf.offset() - 8;
        self.relocs.push(Reloc {
            kind,
            offset,
            index,
        });
    }

    /// Map call inputs to the System V argument protocol: the first six
    /// integers to RDI..R9, the first eight floats to XMM0..XMM7, the rest
    /// pushed as 8-byte slots in left-to-right order.
    fn assign_args(params: &[ValType]) -> Vec<ArgLoc> {
        let mut n_int = 0usize;
        let mut n_float = 0u8;
        params
            .iter()
            .map(|ty| {
                if ty.is_int() && n_int < crate::frame::INT_ARG_REGS.len() {
                    n_int += 1;
                    ArgLoc::Gpr(crate::frame::INT_ARG_REGS[n_int - 1])
                } else if ty.is_float() && n_float < crate::frame::FLOAT_ARG_REGS {
                    n_float += 1;
                    ArgLoc::Xmm(n_float - 1)
                } else {
                    ArgLoc::Stack
                }
            })
            .collect()
    }

    /// Marshal the top `params.len()` operand-stack values into argument
    /// registers and outgoing stack slots. Returns `(pad, n_spilled)`.
    ///
    /// The stack pointer must be 16-byte aligned at the `call` itself, so an
    /// 8-byte pad goes in first whenever the slot count at the call would
    /// come out odd. RAX is left untouched throughout.
    fn marshal_args(&mut self, locs: &[ArgLoc]) -> Result<(usize, usize), CompileError> {
        let n_inputs = locs.len();
        let n_spilled = locs.iter().filter(|l| matches!(l, ArgLoc::Stack)).count();
        let pad =
            (self.frame.n_frame_locals() as usize + self.stack.value_slots() + n_spilled) % 2;

        if pad == 1 {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.sub_ri32(Reg::Rsp, 8);
        }

        // Outgoing stack arguments, left to right. Earlier pushes shift the
        // source offsets of later ones.
        let mut pushed = 0usize;
        for (i, loc) in locs.iter().enumerate() {
            if matches!(loc, ArgLoc::Stack) {
                let off = Self::slot_bytes(n_inputs - 1 - i + pad + pushed)?;
                let mut asm = X86_64Assembler::new(&mut self.buf);
                asm.push_m(Reg::Rsp, off);
                pushed += 1;
            }
        }

        // Register arguments, now at fixed offsets.
        for (i, loc) in locs.iter().enumerate() {
            let off = Self::slot_bytes(n_inputs - 1 - i + pad + n_spilled)?;
            let mut asm = X86_64Assembler::new(&mut self.buf);
            match loc {
                ArgLoc::Gpr(reg) => asm.mov_rm(*reg, Reg::Rsp, off),
                ArgLoc::Xmm(xmm) => asm.movsd_rm(*xmm, Reg::Rsp, off),
                ArgLoc::Stack => {}
            }
        }
        Ok((pad, n_spilled))
    }

    /// Release argument and alignment slots after a call and push the
    /// result, if any.
    fn finish_call(
        &mut self,
        n_inputs: usize,
        pad: usize,
        n_spilled: usize,
        result: Option<ValType>,
    ) -> Result<(), CompileError> {
        let restore = Self::slot_bytes(pad + n_spilled + n_inputs)?;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            if restore > 0 {
                asm.add_ri32(Reg::Rsp, restore);
            }
            if let Some(ty) = result {
                if ty.is_float() {
                    asm.movq_r64_xmm(Reg::Rax, 0);
                }
                asm.push(Reg::Rax);
            }
        }
        for _ in 0..n_inputs {
            self.stack.pop();
        }
        if let Some(ty) = result {
            self.stack.push(ty);
        }
        Ok(())
    }

    fn emit_call(&mut self, func_idx: u32) -> Result<(), CompileError> {
        let ty = self
            .cx
            .func_types
            .get(func_idx as usize)
            .ok_or(CompileError::BadIndex("function", func_idx))?
            .clone();
        if ty.results.len() > 1 {
            return Err(CompileError::UnsupportedOp("multi-value result"));
        }

        let locs = Self::assign_args(&ty.params);
        let (pad, n_spilled) = self.marshal_args(&locs)?;

        // Load the function instance and jump through its entry pointer.
        self.emit_reloc_mov(Reg::Rax, RelocKind::Func, func_idx);
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.mov_rm(Reg::Rax, Reg::Rax, FUNC_COMPILED_CODE_OFFSET);
            asm.call_r(Reg::Rax);
        }

        self.finish_call(ty.params.len(), pad, n_spilled, ty.results.first().copied())
    }

    fn emit_call_indirect(&mut self, type_idx: u32) -> Result<(), CompileError> {
        let ty = self
            .cx
            .types
            .get(type_idx as usize)
            .ok_or(CompileError::BadIndex("type", type_idx))?
            .clone();
        if ty.results.len() > 1 {
            return Err(CompileError::UnsupportedOp("multi-value result"));
        }

        // The table index sits on top of the arguments. Hand it to the
        // resolver together with the table pointer and the expected
        // signature token; the resolver traps on bounds or type mismatch
        // and returns the target entry address in RAX.
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.pop(Reg::Rdx);
        }
        self.stack.pop();
        self.emit_reloc_mov(Reg::Rdi, RelocKind::Table, 0);
        self.emit_reloc_mov(Reg::Rsi, RelocKind::Type, type_idx);

        let resolver_pad =
            (self.frame.n_frame_locals() as usize + self.stack.value_slots()) % 2;
        if resolver_pad == 1 {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.sub_ri32(Reg::Rsp, 8);
        }
        self.emit_reloc_mov(Reg::Rax, RelocKind::ResolveIndirectCall, 0);
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.call_r(Reg::Rax);
        }
        if resolver_pad == 1 {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.add_ri32(Reg::Rsp, 8);
        }

        // Marshalling only touches argument registers, so the entry address
        // survives in RAX.
        let locs = Self::assign_args(&ty.params);
        let (pad, n_spilled) = self.marshal_args(&locs)?;
        {
            let mut asm = X86_64Assembler::new(&mut self.buf);
            asm.call_r(Reg::Rax);
        }

        self.finish_call(ty.params.len(), pad, n_spilled, ty.results.first().copied())
    }
}

/// Width and extension of a memory load.
#[derive(Debug, Clone, Copy)]
enum LoadKind {
    I32,
    I64,
    F64,
    I32S8,
}

impl LoadKind {
    fn result_type(self) -> ValType {
        match self {
            LoadKind::I32 | LoadKind::I32S8 => ValType::I32,
            LoadKind::I64 => ValType::I64,
            LoadKind::F64 => ValType::F64,
        }
    }
}

/// Width of a memory store.
#[derive(Debug, Clone, Copy)]
enum StoreKind {
    Byte,
    Half,
    Word,
    Qword,
}

/// Two-operand scalar-double operations.
#[derive(Debug, Clone, Copy)]
enum F64Op {
    Add,
    Sub,
    Mul,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::LocalDecl;

    fn empty_cx() -> ModuleContext<'static> {
        ModuleContext {
            types: &[],
            func_types: &[],
            globals: &[],
        }
    }

    fn compile(
        cx: &ModuleContext,
        params: Vec<ValType>,
        results: Vec<ValType>,
        locals: Vec<LocalDecl>,
        instrs: Vec<Instruction>,
    ) -> Result<CompiledFunction, CompileError> {
        let ty = FuncType::new(params, results);
        let body = FuncBody { locals, instrs };
        compile_function(cx, &ty, &body, &CompileOptions::default())
    }

    #[test]
    fn test_const_return() {
        // () -> i32 { i32.const 42 }
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![],
            vec![ValType::I32],
            vec![],
            vec![Instruction::I32Const(42)],
        )
        .unwrap();
        assert_eq!(
            out.code,
            [
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
                0x50, // push rax
                0x58, // pop rax
                0x5D, // pop rbp
                0xC3, // ret
            ]
        );
        assert!(out.relocs.is_empty());
    }

    #[test]
    fn test_identity_i64() {
        // (i64) -> i64 { get_local 0 }
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![ValType::I64],
            vec![ValType::I64],
            vec![],
            vec![Instruction::GetLocal(0)],
        )
        .unwrap();
        assert_eq!(
            out.code,
            [
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x48, 0x89, 0x7D, 0xF8, // mov [rbp-8], rdi
                0xFF, 0x75, 0xF8, // push qword [rbp-8]
                0x58, // pop rax
                0x48, 0x83, 0xC4, 0x08, // add rsp, 8
                0x5D, // pop rbp
                0xC3, // ret
            ]
        );
    }

    #[test]
    fn test_debug_trap_gate() {
        let cx = empty_cx();
        let ty = FuncType::new(vec![], vec![]);
        let body = FuncBody {
            locals: vec![],
            instrs: vec![],
        };
        let plain = compile_function(&cx, &ty, &body, &CompileOptions::default()).unwrap();
        assert!(!plain.code.contains(&0xCC));
        let trapping = compile_function(&cx, &ty, &body, &CompileOptions { debug_trap: true })
            .unwrap();
        assert_eq!(&trapping.code[..5], &[0x55, 0x48, 0x89, 0xE5, 0xCC]);
    }

    #[test]
    fn test_forward_branch_over_dead_code() {
        // () -> i32 { block i32 { i32.const 7; br 0; i32.const 9 } }
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![],
            vec![ValType::I32],
            vec![],
            vec![Instruction::Block {
                ty: BlockType(Some(ValType::I32)),
                body: vec![
                    Instruction::I32Const(7),
                    Instruction::Br(0),
                    Instruction::I32Const(9),
                ],
            }],
        )
        .unwrap();
        assert_eq!(
            out.code,
            [
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0xB8, 0x07, 0x00, 0x00, 0x00, // mov eax, 7
                0x50, // push rax
                0xE9, 0x06, 0x00, 0x00, 0x00, // jmp +6 (to block end)
                0xB8, 0x09, 0x00, 0x00, 0x00, // mov eax, 9 (dead)
                0x50, // push rax (dead)
                0x58, // pop rax
                0x5D, // pop rbp
                0xC3, // ret
            ]
        );
    }

    #[test]
    fn test_branch_targets_inside_buffer() {
        // Loop with a conditional backward branch.
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![ValType::I32],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::Block {
                    ty: BlockType(None),
                    body: vec![Instruction::Loop {
                        ty: BlockType(None),
                        body: vec![
                            Instruction::GetLocal(0),
                            Instruction::I32Eqz,
                            Instruction::BrIf(1),
                            Instruction::GetLocal(0),
                            Instruction::I32Const(1),
                            Instruction::I32Sub,
                            Instruction::SetLocal(0),
                            Instruction::Br(0),
                        ],
                    }],
                },
                Instruction::GetLocal(0),
            ],
        )
        .unwrap();
        // Every patched 5-byte jump must land inside the buffer.
        let code = &out.code;
        let mut jumps = 0;
        let mut i = 0;
        while i < code.len() {
            if code[i] == 0xE9 && i + 5 <= code.len() {
                let rel = i32::from_le_bytes(code[i + 1..i + 5].try_into().unwrap());
                let target = i as i64 + 5 + rel as i64;
                assert!(target >= 0 && (target as usize) < code.len());
                jumps += 1;
                i += 5;
            } else {
                i += 1;
            }
        }
        assert!(jumps >= 2);
    }

    #[test]
    fn test_memory_access_has_bounds_check_and_reloc() {
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::I32Const(16),
                Instruction::I32Load { offset: 0 },
            ],
        )
        .unwrap();
        assert_eq!(out.relocs.len(), 1);
        let reloc = out.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Mem);
        // The relocation covers an 8-byte immediate inside the buffer.
        assert!(reloc.offset + 8 <= out.code.len());
        // A skip-one-byte jump over the trap must be present.
        let has_guard = out
            .code
            .windows(3)
            .any(|w| w == [0x76, 0x01, 0xCC]);
        assert!(has_guard);
    }

    #[test]
    fn test_store_emits_mem_reloc_per_access() {
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::I32Const(100),
                Instruction::I32Const(0x1234),
                Instruction::I32Store { offset: 0 },
                Instruction::I32Const(100),
                Instruction::I32Load { offset: 0 },
            ],
        )
        .unwrap();
        let mems = out
            .relocs
            .iter()
            .filter(|r| r.kind == RelocKind::Mem)
            .count();
        assert_eq!(mems, 2);
        assert_eq!(out.code.windows(3).filter(|w| *w == [0x76, 0x01, 0xCC]).count(), 2);
    }

    #[test]
    fn test_call_emits_func_reloc() {
        let func_types = [FuncType::new(vec![ValType::I32, ValType::I32], vec![ValType::I32])];
        let cx = ModuleContext {
            types: &[],
            func_types: &func_types,
            globals: &[],
        };
        let out = compile(
            &cx,
            vec![],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::I32Const(40),
                Instruction::I32Const(2),
                Instruction::Call(0),
            ],
        )
        .unwrap();
        assert_eq!(out.relocs.len(), 1);
        assert_eq!(out.relocs[0].kind, RelocKind::Func);
        assert_eq!(out.relocs[0].index, 0);
        // call rax
        assert!(out.code.windows(2).any(|w| w == [0xFF, 0xD0]));
    }

    #[test]
    fn test_call_indirect_relocs() {
        let types = [FuncType::new(vec![ValType::I32], vec![ValType::I32])];
        let cx = ModuleContext {
            types: &types,
            func_types: &[],
            globals: &[],
        };
        let out = compile(
            &cx,
            vec![],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::I32Const(5),
                Instruction::I32Const(0),
                Instruction::CallIndirect(0),
            ],
        )
        .unwrap();
        let kinds: Vec<RelocKind> = out.relocs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                RelocKind::Table,
                RelocKind::Type,
                RelocKind::ResolveIndirectCall
            ]
        );
        assert_eq!(out.relocs[1].index, 0);
        // Two indirect calls: the resolver and the target.
        assert_eq!(out.code.windows(2).filter(|w| *w == [0xFF, 0xD0]).count(), 2);
    }

    #[test]
    fn test_br_table_layout() {
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![ValType::I32],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::Block {
                    ty: BlockType(None),
                    body: vec![
                        Instruction::Block {
                            ty: BlockType(None),
                            body: vec![
                                Instruction::GetLocal(0),
                                Instruction::BrTable {
                                    targets: vec![0, 1],
                                    default: 1,
                                },
                            ],
                        },
                        Instruction::I32Const(10),
                        Instruction::Return,
                    ],
                },
                Instruction::I32Const(20),
            ],
        )
        .unwrap();
        // An indirect jmp through rax dispatches the table.
        assert!(out.code.windows(2).any(|w| w == [0xFF, 0xE0]));
        // cmp eax, 2 guards the selector.
        assert!(out.code.windows(3).any(|w| w == [0x83, 0xF8, 0x02]));
    }

    #[test]
    fn test_multi_value_result_rejected() {
        let cx = empty_cx();
        let err = compile(
            &cx,
            vec![],
            vec![ValType::I32, ValType::I32],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, CompileError::UnsupportedOp("multi-value result"));
    }

    #[test]
    fn test_bad_local_index() {
        let cx = empty_cx();
        let err = compile(
            &cx,
            vec![],
            vec![],
            vec![],
            vec![Instruction::GetLocal(3)],
        )
        .unwrap_err();
        assert_eq!(err, CompileError::BadLocal(3));
    }

    #[test]
    fn test_bad_branch_depth() {
        let cx = empty_cx();
        let err = compile(&cx, vec![], vec![], vec![], vec![Instruction::Br(4)]).unwrap_err();
        assert_eq!(err, CompileError::BadLabel(4));
    }

    #[test]
    fn test_memory_offset_overflow() {
        let cx = empty_cx();
        let err = compile(
            &cx,
            vec![],
            vec![],
            vec![],
            vec![
                Instruction::I32Const(0),
                Instruction::I32Load { offset: u32::MAX },
                Instruction::Drop,
            ],
        )
        .unwrap_err();
        assert_eq!(err, CompileError::Overflow("memory offset"));
    }

    #[test]
    fn test_bad_global_index() {
        let cx = empty_cx();
        let err = compile(
            &cx,
            vec![],
            vec![],
            vec![],
            vec![Instruction::GetGlobal(0), Instruction::Drop],
        )
        .unwrap_err();
        assert_eq!(err, CompileError::BadIndex("global", 0));
    }

    #[test]
    fn test_locals_zeroed_fast_path() {
        // One declared local uses a single qword store.
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![],
            vec![],
            vec![LocalDecl {
                count: 1,
                ty: ValType::I32,
            }],
            vec![],
        )
        .unwrap();
        // mov qword [rbp-8], 0
        assert!(
            out.code
                .windows(8)
                .any(|w| w == [0x48, 0xC7, 0x45, 0xF8, 0x00, 0x00, 0x00, 0x00])
        );
        // Several declared locals use rep stosq instead.
        let out = compile(
            &cx,
            vec![],
            vec![],
            vec![LocalDecl {
                count: 3,
                ty: ValType::I64,
            }],
            vec![],
        )
        .unwrap();
        assert!(out.code.windows(3).any(|w| w == [0xF3, 0x48, 0xAB]));
    }

    #[test]
    fn test_if_else_shapes() {
        // (i32) -> i32 { if (local 0) { 1 } else { 2 } }
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![ValType::I32],
            vec![ValType::I32],
            vec![],
            vec![
                Instruction::GetLocal(0),
                Instruction::If {
                    ty: BlockType(Some(ValType::I32)),
                    then_body: vec![Instruction::I32Const(1)],
                    else_body: Some(vec![Instruction::I32Const(2)]),
                },
            ],
        )
        .unwrap();
        // One conditional forward jump and one unconditional join jump.
        assert!(out.code.windows(2).any(|w| w == [0x0F, 0x84]));
        assert!(out.code.contains(&0xE9));
    }

    #[test]
    fn test_stack_depth_stays_balanced() {
        // A function mixing arithmetic, locals and drops compiles with the
        // static stack ending balanced (checked internally by the final
        // truncate assert in compile_function).
        let cx = empty_cx();
        let out = compile(
            &cx,
            vec![ValType::I32, ValType::I32],
            vec![ValType::I32],
            vec![LocalDecl {
                count: 1,
                ty: ValType::I32,
            }],
            vec![
                Instruction::GetLocal(0),
                Instruction::GetLocal(1),
                Instruction::I32Add,
                Instruction::TeeLocal(2),
                Instruction::I32Const(3),
                Instruction::I32Mul,
                Instruction::GetLocal(2),
                Instruction::Drop,
            ],
        )
        .unwrap();
        assert!(!out.code.is_empty());
    }
}
