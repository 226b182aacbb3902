//! Human-readable bytecode dumps, for `--disassemble` and debugging.

use std::fmt::Write;

use crate::vm::opcode::OpCode;
use crate::vm::value::{FnObj, Value};
use crate::vm::vm::Vm;

/// Disassemble a function and, recursively, every function in its constant
/// pool.
pub fn disassemble_function(vm: &Vm, function: &FnObj) -> String {
    let mut out = String::new();
    write_function(vm, function, &mut out);

    for constant in &function.chunk.constants {
        if let Some(nested) = constant.as_obj().and_then(|obj| obj.as_fn()) {
            out.push('\n');
            out.push_str(&disassemble_function(vm, nested));
        }
    }
    out
}

fn write_function(vm: &Vm, function: &FnObj, out: &mut String) {
    let _ = writeln!(out, "== {} (arity {}) ==", function.name, function.arity);

    let chunk = &function.chunk;
    let mut offset = 0;
    while offset < chunk.code.len() {
        let Some(op) = OpCode::from_u8(chunk.code[offset]) else {
            let _ = writeln!(out, "{:04}  <bad opcode {}>", offset, chunk.code[offset]);
            offset += 1;
            continue;
        };

        let line = chunk.line_at(offset);
        let _ = write!(out, "{:04} {:4} {:?}", offset, line, op);
        offset += 1;

        match op {
            OpCode::Constant => {
                let index = chunk.read_u16(offset);
                offset += 2;
                let _ = write!(
                    out,
                    " {} ({:?})",
                    index,
                    chunk.constants.get(index as usize).unwrap_or(&Value::Nil)
                );
            }
            OpCode::LoadLocal
            | OpCode::StoreLocal
            | OpCode::LoadUpvalue
            | OpCode::StoreUpvalue
            | OpCode::LoadField
            | OpCode::StoreField
            | OpCode::BuildList
            | OpCode::BuildMap
            | OpCode::Class
            | OpCode::Subclass => {
                let _ = write!(out, " {}", chunk.code[offset]);
                offset += 1;
            }
            OpCode::LoadGlobal | OpCode::StoreGlobal => {
                let slot = chunk.read_u16(offset);
                offset += 2;
                let name = vm.global_names.name(slot).unwrap_or("?");
                let _ = write!(out, " {} ({})", slot, name);
            }
            OpCode::Jump | OpCode::JumpIf | OpCode::And | OpCode::Or => {
                let jump = chunk.read_u16(offset) as usize;
                offset += 2;
                let _ = write!(out, " -> {}", offset + jump);
            }
            OpCode::Loop => {
                let jump = chunk.read_u16(offset) as usize;
                offset += 2;
                let _ = write!(out, " -> {}", offset - jump);
            }
            OpCode::Call0
            | OpCode::Call1
            | OpCode::Call2
            | OpCode::Call3
            | OpCode::Call4
            | OpCode::Call5
            | OpCode::Call6
            | OpCode::Call7
            | OpCode::Call8
            | OpCode::Method
            | OpCode::StaticMethod => {
                let symbol = chunk.read_u16(offset);
                offset += 2;
                let name = vm.method_names.name(symbol).unwrap_or("?");
                let _ = write!(out, " {} ('{}')", symbol, name.trim_end());
            }
            OpCode::Closure => {
                let index = chunk.read_u16(offset);
                offset += 2;
                let captures = chunk
                    .constants
                    .get(index as usize)
                    .and_then(|c| c.as_obj())
                    .and_then(|obj| obj.as_fn())
                    .map(|f| f.upvalue_count)
                    .unwrap_or(0);
                let _ = write!(
                    out,
                    " {} ({:?})",
                    index,
                    chunk.constants.get(index as usize).unwrap_or(&Value::Nil)
                );
                for _ in 0..captures {
                    let is_local = chunk.code[offset] != 0;
                    let capture_index = chunk.code[offset + 1];
                    offset += 2;
                    let _ = write!(
                        out,
                        " [{} {}]",
                        if is_local { "local" } else { "upvalue" },
                        capture_index
                    );
                }
            }
            _ => {}
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;

    #[test]
    fn test_disassembles_arithmetic() {
        let mut vm = Vm::new();
        let function = compiler::compile(&mut vm, "dis", "1 + 2").unwrap();
        let listing = disassemble_function(&vm, function.as_fn().unwrap());
        assert!(listing.contains("Constant"));
        assert!(listing.contains("Call1"));
        assert!(listing.contains("'+'"));
        assert!(listing.contains("End"));
    }

    #[test]
    fn test_disassembles_nested_functions() {
        let mut vm = Vm::new();
        let function = compiler::compile(&mut vm, "dis", "var f = fn (x) { x }").unwrap();
        let listing = disassemble_function(&vm, function.as_fn().unwrap());
        assert!(listing.contains("== <fn> (arity 1) =="));
        assert!(listing.contains("Closure"));
    }

    #[test]
    fn test_disassembles_jumps() {
        let mut vm = Vm::new();
        let function =
            compiler::compile(&mut vm, "dis", "var x = 0 if (true) x = 1 else x = 2").unwrap();
        let listing = disassemble_function(&vm, function.as_fn().unwrap());
        assert!(listing.contains("JumpIf ->"));
        assert!(listing.contains("Jump ->"));
    }
}
