//! Error types for compilation and execution.

use std::fmt;

use thiserror::Error;

/// A single compile-time diagnostic: module, line, message.
///
/// The compiler accumulates these instead of stopping at the first problem,
/// so one run surfaces as many issues as possible.
#[derive(Debug, Clone, Error)]
#[error("[{module} line {line}] {message}")]
pub struct CompileError {
    pub module: String,
    pub line: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(module: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            line,
            message: message.into(),
        }
    }
}

/// Every diagnostic produced while compiling one unit.
///
/// A unit that produced any diagnostics is never handed to the VM.
#[derive(Debug, Clone, Error)]
pub struct Diagnostics(pub Vec<CompileError>);

impl Diagnostics {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub line: usize,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.function)
    }
}

/// A fatal runtime error: the failure reached a fiber with no caller.
///
/// Non-fatal runtime errors never surface here; they travel up the fiber
/// caller chain as values and a `try` caller receives them as an ordinary
/// return value.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self {
            message: message.into(),
            trace,
        }
    }

    /// Render the captured call stack, one frame per line, innermost first.
    pub fn stack_trace(&self) -> String {
        self.trace
            .iter()
            .map(|frame| frame.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum TernError {
    #[error("{0}")]
    Compile(#[from] Diagnostics),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display() {
        let err = CompileError::new("main", 3, "Expected ')'");
        assert_eq!(err.to_string(), "[main line 3] Expected ')'");
    }

    #[test]
    fn diagnostics_display_joins_lines() {
        let diags = Diagnostics(vec![
            CompileError::new("main", 1, "first"),
            CompileError::new("main", 2, "second"),
        ]);
        assert_eq!(
            diags.to_string(),
            "[main line 1] first\n[main line 2] second"
        );
    }

    #[test]
    fn runtime_error_stack_trace() {
        let err = RuntimeError::new(
            "Num does not implement 'frob'",
            vec![
                TraceFrame {
                    function: "inner".to_string(),
                    line: 4,
                },
                TraceFrame {
                    function: "<main>".to_string(),
                    line: 9,
                },
            ],
        );
        assert_eq!(err.stack_trace(), "[line 4] in inner\n[line 9] in <main>");
    }
}
