//! Bytecode representation: opcodes, chunks, and the disassembler.
//!
//! The compiler emits directly into a function's [`Chunk`]; the VM decodes
//! with [`Opcode::from_repr`]. There is no on-disk format; chunks live only
//! in memory for the lifetime of their Function object.

pub(crate) use code::{Chunk, PropertyCache};
pub(crate) use debug::disassemble;
pub(crate) use op::Opcode;

mod code;
mod debug;
mod op;
