//! Tern: a dynamically-typed, class-based scripting language with
//! cooperative fibers, running on a bytecode virtual machine.
//!
//! The pipeline is a hand-written scanner, a single-pass Pratt compiler
//! that emits bytecode directly, and a stack-based interpreter executing
//! inside fibers, with a mark-and-sweep garbage collector over the object
//! heap.

#![allow(clippy::new_without_default)]
#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_arguments)]

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod span;
pub mod vm;

pub use error::{CompileError, Diagnostics, RuntimeError, TernError};
pub use vm::{Value, Vm};

/// Run a Tern program from source code. The returned value is the
/// program's last expression, or nil.
pub fn run(source: &str) -> Result<Value, TernError> {
    Vm::new().interpret("main", source)
}

/// Run a Tern program under a module name, optionally dumping the
/// compiled bytecode first.
pub fn run_with_options(
    module: &str,
    source: &str,
    disassemble: bool,
) -> Result<Value, TernError> {
    if disassemble {
        // Compile into a scratch VM so the real run still sees a clean
        // global table.
        let mut scratch = Vm::new();
        println!("{}", compile_to_listing(&mut scratch, module, source)?);
        println!("---");
    }
    Vm::new().interpret(module, source)
}

/// Compile source without executing; returns diagnostics on failure.
pub fn check(module: &str, source: &str) -> Result<(), Diagnostics> {
    let mut vm = Vm::new();
    compiler::compile(&mut vm, module, source).map(|_| ())
}

/// Compile source and render its bytecode listing.
pub fn disassemble(module: &str, source: &str) -> Result<String, TernError> {
    let mut vm = Vm::new();
    compile_to_listing(&mut vm, module, source)
}

fn compile_to_listing(vm: &mut Vm, module: &str, source: &str) -> Result<String, TernError> {
    let function = compiler::compile(vm, module, source)?;
    let function = function
        .as_fn()
        .expect("compilation produces a function object");
    Ok(vm::disassembler::disassemble_function(vm, function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_round_trip() {
        assert_eq!(run("1 + 2").unwrap(), Value::Num(3.0));
    }

    #[test]
    fn test_check_reports_diagnostics_without_running() {
        let diags = check("main", "var x = missing").unwrap_err();
        assert_eq!(diags.len(), 1);
        assert!(diags.to_string().contains("[main line 1]"));
    }

    #[test]
    fn test_disassemble_does_not_execute() {
        // A program that would error at runtime still disassembles.
        let listing = disassemble("main", "1.frob").unwrap();
        assert!(listing.contains("'frob'"));
    }

    #[test]
    fn test_compile_error_is_unified_error() {
        let err = run("var = 1").unwrap_err();
        assert!(matches!(err, TernError::Compile(_)));
    }

    #[test]
    fn test_runtime_error_is_unified_error() {
        let err = run("nil.frob").unwrap_err();
        assert!(matches!(err, TernError::Runtime(_)));
    }
}
