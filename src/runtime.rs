//! Runtime instance layouts referenced by emitted code.
//!
//! The compiler never touches runtime objects itself; it bakes their field
//! offsets into loads and stores, and the loader patches the instance
//! addresses over the recorded relocations. The `#[repr(C)]` layouts here
//! are therefore part of the ABI: they must match whatever runtime the
//! emitted code is linked against.

use std::mem::offset_of;

/// An instantiated function. Emitted `call` sequences load a pointer to one
/// of these and jump through `compiled_code`.
#[repr(C)]
#[derive(Debug)]
pub struct FunctionInstance {
    /// Entry address of the function's native code.
    pub compiled_code: *const u8,
    /// Size of the native code in bytes.
    pub code_size: usize,
}

/// An instantiated linear memory. Emitted loads and stores bounds-check
/// against `size` and address relative to `data`.
#[repr(C)]
#[derive(Debug)]
pub struct MemoryInstance {
    /// Base of the memory's backing bytes.
    pub data: *mut u8,
    /// Current size of the memory in bytes.
    pub size: usize,
}

/// Value storage of a global instance. All members alias the same 8 bytes;
/// the declared type of the global selects the member.
#[repr(C)]
#[derive(Clone, Copy)]
pub union GlobalValue {
    pub i32: i32,
    pub i64: i64,
    pub f32: f32,
    pub f64: f64,
}

/// An instantiated global variable.
#[repr(C)]
pub struct GlobalInstance {
    pub value: GlobalValue,
    pub mutable: bool,
}

/// One element of a function table.
#[repr(C)]
#[derive(Debug)]
pub struct TableElement {
    /// Identity token of the element's function signature.
    pub type_token: u64,
    /// The element's function, or null for an uninitialized slot.
    pub func: *const FunctionInstance,
}

/// An instantiated function table.
#[repr(C)]
#[derive(Debug)]
pub struct TableInstance {
    pub elems: *const TableElement,
    pub count: usize,
}

/// Field offsets baked into emitted code.
pub const FUNC_COMPILED_CODE_OFFSET: i32 = offset_of!(FunctionInstance, compiled_code) as i32;
pub const MEM_DATA_OFFSET: i32 = offset_of!(MemoryInstance, data) as i32;
pub const MEM_SIZE_OFFSET: i32 = offset_of!(MemoryInstance, size) as i32;
pub const GLOBAL_VALUE_OFFSET: i32 = offset_of!(GlobalInstance, value) as i32;

/// Signature of the indirect-call resolver the emitted code calls through a
/// [`RelocKind::ResolveIndirectCall`](crate::reloc::RelocKind) relocation.
pub type ResolveIndirectCallFn =
    unsafe extern "C" fn(*const TableInstance, u64, u64) -> *const u8;

/// Reference resolver for `call_indirect`.
///
/// Looks up `index` in `table`, checks the stored signature token against
/// `type_token`, and returns the target's entry address. Out-of-bounds
/// indices, uninitialized slots and signature mismatches abort the process,
/// matching trap semantics.
///
/// # Safety
/// `table` must point to a live [`TableInstance`] whose `elems` array has
/// `count` valid entries.
pub unsafe extern "C" fn resolve_indirect_call(
    table: *const TableInstance,
    type_token: u64,
    index: u64,
) -> *const u8 {
    let table = unsafe { &*table };
    if index >= table.count as u64 {
        std::process::abort();
    }
    let elem = unsafe { &*table.elems.add(index as usize) };
    if elem.func.is_null() || elem.type_token != type_token {
        std::process::abort();
    }
    unsafe { (*elem.func).compiled_code }
}
