//! Bytecode disassembler, used when `debug_print_code` is set.

use std::fmt::Write;

use crate::{bytecode::{Chunk, Opcode}, heap::Heap};

/// Renders a whole chunk, one instruction per line.
pub(crate) fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line(offset) == chunk.line(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line(offset));
    }

    let Some(op) = Opcode::from_repr(chunk.code[offset]) else {
        let _ = writeln!(out, "unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::SetGlobal
        | Opcode::DefineGlobal
        | Opcode::DefineGlobalVal
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::GetSuper
        | Opcode::Class
        | Opcode::Trait
        | Opcode::Method
        | Opcode::StaticMethod
        | Opcode::BeginNamespace => constant_instruction(heap, chunk, op, offset, out),
        Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpvalue
        | Opcode::SetUpvalue
        | Opcode::Call
        | Opcode::Array
        | Opcode::Dictionary
        | Opcode::ImplementTraits => byte_instruction(chunk, op, offset, out),
        Opcode::Jump | Opcode::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        Opcode::Loop => jump_instruction(chunk, op, -1, offset, out),
        Opcode::Invoke | Opcode::SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        Opcode::Closure => closure_instruction(heap, chunk, offset, out),
        Opcode::PushHandler => handler_instruction(heap, chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{}", op.mnemonic());
            offset + 1
        }
    }
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: Opcode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constant(index);
    let _ = writeln!(out, "{:<16} {index:4} '{}'", op.mnemonic(), value.display(heap));
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: Opcode, offset: usize, out: &mut String) -> usize {
    let operand = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {operand:4}", op.mnemonic());
    offset + 2
}

fn jump_instruction(
    chunk: &Chunk,
    op: Opcode,
    sign: isize,
    offset: usize,
    out: &mut String,
) -> usize {
    let jump = usize::from(u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]));
    let target = (offset as isize + 3) + sign * (jump as isize);
    let _ = writeln!(out, "{:<16} {offset:4} -> {target}", op.mnemonic());
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: Opcode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    let name = chunk.constant(index).display(heap);
    let _ = writeln!(out, "{:<16} ({argc} args) {index:4} '{name}'", op.mnemonic());
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let function = chunk.constant(index);
    let _ = writeln!(out, "{:<16} {index:4} {}", "Closure", function.display(heap));
    let mut offset = offset + 2;
    let upvalue_count = match function {
        crate::value::Value::Obj(id) => usize::from(heap.function(id).upvalue_count),
        _ => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let slot = chunk.code[offset + 1];
        let kind = if is_local == 1 { "local" } else { "upvalue" };
        let _ = writeln!(out, "{offset:04}      |                     {kind} {slot}");
        offset += 2;
    }
    offset
}

fn handler_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let class_index = chunk.code[offset + 1];
    let handler = u16::from_be_bytes([chunk.code[offset + 2], chunk.code[offset + 3]]);
    let finally = u16::from_be_bytes([chunk.code[offset + 4], chunk.code[offset + 5]]);
    let class = if class_index == u8::MAX {
        "<none>".to_owned()
    } else {
        chunk.constant(class_index).display(heap)
    };
    let _ = writeln!(
        out,
        "{:<16} catch {class} handler {handler} finally {finally:#x}",
        "PushHandler"
    );
    offset + 6
}
