//! wasmjit - a baseline JIT code generator for WebAssembly functions.
//!
//! This library translates a single WebAssembly MVP function (type
//! signature, local declarations, instruction tree) into position-independent
//! x86-64 machine code for the System V AMD64 ABI, in one pass and with no
//! optimization. The output is a raw code buffer plus a list of relocation
//! records; an external loader patches the recorded 8-byte immediates with
//! concrete runtime addresses before the code is executed.
//!
//! Compilation is strictly single-threaded and per-function: every internal
//! structure lives for exactly one [`compile_function`] call.

pub mod codebuf;
pub mod compiler;
pub mod frame;
pub mod memory;
pub mod reloc;
pub mod runtime;
pub mod stack;
pub mod wasm;
pub mod x86_64;

pub use compiler::{
    CompileError, CompileOptions, CompiledFunction, ModuleContext, compile_function,
};
pub use reloc::{CodeOffset, Reloc, RelocKind};
pub use wasm::{BlockType, FuncBody, FuncType, Instruction, LocalDecl, ValType};
