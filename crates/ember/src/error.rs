//! Public error surface and the internal unwinding type.
//!
//! Compile-time problems are collected into [`CompileErrors`] (the compiler
//! keeps going after the first error, throttled by panic mode). Runtime
//! problems become Exception objects on the heap and unwind through the
//! handler chain as [`RunError`]; if nothing catches them, `interpret`
//! surfaces a [`RuntimeReport`] with the captured stack trace.

use std::fmt;

use crate::value::Value;

/// Result alias for operations that can raise an Ember exception.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// An in-flight exception unwinding the VM.
///
/// The payload is always a heap Exception object (or a user value thrown
/// with `throw`). The value is additionally rooted in the VM's thrown slot
/// while it propagates, so allocation during unwinding cannot collect it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunError {
    pub exception: Value,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// 1-based source line.
    pub line: u32,
    /// Lexeme the error is anchored to, or "end" at EOF.
    pub at: String,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.at.is_empty() {
            write!(f, "[line {}] Error: {}", self.line, self.message)
        } else {
            write!(f, "[line {}] Error at '{}': {}", self.line, self.at, self.message)
        }
    }
}

/// All diagnostics produced by one failed compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors {
    pub errors: Vec<CompileError>,
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// An uncaught runtime exception, formatted for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeReport {
    /// The exception message.
    pub message: String,
    /// `function-name:line` entries from the innermost frame outward.
    pub stack_trace: Vec<String>,
}

impl fmt::Display for RuntimeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for entry in &self.stack_trace {
            write!(f, "\n{entry}")?;
        }
        Ok(())
    }
}

/// Outcome of [`crate::Vm::interpret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpretError {
    /// The source failed to compile; no code ran.
    Compile(CompileErrors),
    /// An exception escaped the script.
    Runtime(RuntimeReport),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => write!(f, "{errors}"),
            Self::Runtime(report) => write!(f, "{report}"),
        }
    }
}

impl std::error::Error for InterpretError {}
