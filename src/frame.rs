//! Stack-frame layout for compiled functions.
//!
//! Every parameter and declared local occupies one fixed 8-byte slot
//! addressed relative to the base pointer. Parameters that arrive in
//! registers are spilled to negative offsets by the prologue, in assignment
//! order; declared locals follow below them. Parameters the caller already
//! pushed stay where they are, at positive offsets above the saved base
//! pointer and return address.

use crate::compiler::CompileError;
use crate::wasm::{LocalDecl, ValType};
use crate::x86_64::Reg;

/// Integer argument registers of the System V AMD64 ABI, in order.
pub const INT_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Number of SSE argument registers (xmm0..xmm7).
pub const FLOAT_ARG_REGS: u8 = 8;

/// Where a register parameter arrives, for the prologue's spill sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillSource {
    Gpr(Reg),
    Xmm(u8),
}

/// One frame slot: a parameter or a declared local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSlot {
    pub ty: ValType,
    /// Signed byte offset from the base pointer.
    pub fp_offset: i32,
}

/// The computed frame layout of one function.
#[derive(Debug)]
pub struct FrameLayout {
    /// Slots indexed by local index: parameters first, then declared locals.
    slots: Vec<LocalSlot>,
    /// Register parameters and the slot each one spills to.
    spills: Vec<(SpillSource, i32)>,
    /// Slots the prologue owns below the base pointer: register parameters
    /// plus declared locals.
    n_frame_locals: u32,
    /// Declared (non-parameter) locals, all zero-initialized.
    n_decl_locals: u32,
}

impl FrameLayout {
    /// Compute the layout for a function with the given parameter types and
    /// local declarations.
    pub fn for_function(
        params: &[ValType],
        locals: &[LocalDecl],
    ) -> Result<FrameLayout, CompileError> {
        let mut slots = Vec::with_capacity(params.len());
        let mut spills = Vec::new();

        // First pass: hand out argument registers left to right and note
        // which parameters the caller spilled instead.
        let mut n_int = 0usize;
        let mut n_float = 0u8;
        let mut stack_params = Vec::new();
        for (i, &ty) in params.iter().enumerate() {
            if ty.is_int() && n_int < INT_ARG_REGS.len() {
                let fp_offset = Self::negative_offset(spills.len())?;
                spills.push((SpillSource::Gpr(INT_ARG_REGS[n_int]), fp_offset));
                slots.push(LocalSlot { ty, fp_offset });
                n_int += 1;
            } else if ty.is_float() && n_float < FLOAT_ARG_REGS {
                let fp_offset = Self::negative_offset(spills.len())?;
                spills.push((SpillSource::Xmm(n_float), fp_offset));
                slots.push(LocalSlot { ty, fp_offset });
                n_float += 1;
            } else {
                // Placeholder offset; fixed up once the spilled count is known.
                slots.push(LocalSlot { ty, fp_offset: 0 });
                stack_params.push(i);
            }
        }

        // Caller-pushed parameters sit above the return address. Arguments
        // are pushed left to right, so the rightmost one is nearest +16.
        let n_stack = stack_params.len();
        for (j, &i) in stack_params.iter().enumerate() {
            let up = ((n_stack - 1 - j) as u64)
                .checked_mul(8)
                .ok_or(CompileError::FrameTooLarge)?;
            let up = i32::try_from(up).map_err(|_| CompileError::FrameTooLarge)?;
            let fp_offset = 16i32.checked_add(up).ok_or(CompileError::FrameTooLarge)?;
            slots[i].fp_offset = fp_offset;
        }

        // Declared locals get consecutive slots below the register parameters.
        let n_reg_params = spills.len();
        let mut n_decl_locals = 0u32;
        for decl in locals {
            for _ in 0..decl.count {
                let idx = n_reg_params + n_decl_locals as usize;
                let fp_offset = Self::negative_offset(idx)?;
                slots.push(LocalSlot {
                    ty: decl.ty,
                    fp_offset,
                });
                n_decl_locals = n_decl_locals
                    .checked_add(1)
                    .ok_or(CompileError::FrameTooLarge)?;
            }
        }

        let n_frame_locals = u32::try_from(n_reg_params)
            .ok()
            .and_then(|n| n.checked_add(n_decl_locals))
            .ok_or(CompileError::FrameTooLarge)?;
        // All fp offsets and the prologue's frame adjustment must fit in i32.
        if u64::from(n_frame_locals) * 8 > i32::MAX as u64 {
            return Err(CompileError::FrameTooLarge);
        }

        Ok(FrameLayout {
            slots,
            spills,
            n_frame_locals,
            n_decl_locals,
        })
    }

    fn negative_offset(slot_index: usize) -> Result<i32, CompileError> {
        let n = u64::try_from(slot_index).unwrap_or(u64::MAX);
        let bytes = (n + 1).checked_mul(8).ok_or(CompileError::FrameTooLarge)?;
        if bytes > i32::MAX as u64 {
            return Err(CompileError::FrameTooLarge);
        }
        Ok(-(bytes as i32))
    }

    /// Look up the slot of a local index.
    pub fn local(&self, idx: u32) -> Result<LocalSlot, CompileError> {
        self.slots
            .get(idx as usize)
            .copied()
            .ok_or(CompileError::BadLocal(idx))
    }

    /// Register parameters with their spill slots, in assignment order.
    pub fn spills(&self) -> &[(SpillSource, i32)] {
        &self.spills
    }

    pub fn n_frame_locals(&self) -> u32 {
        self.n_frame_locals
    }

    pub fn n_decl_locals(&self) -> u32 {
        self.n_decl_locals
    }

    /// Byte size of the prologue's frame adjustment.
    pub fn frame_bytes(&self) -> i32 {
        self.n_frame_locals as i32 * 8
    }

    /// Base-pointer offset of the lowest declared-local slot, i.e. the start
    /// of the region the prologue zero-initializes.
    pub fn decl_locals_base(&self) -> i32 {
        -self.frame_bytes()
    }
}
