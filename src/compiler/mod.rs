//! Expression compiler: source text in, a flat [`crate::tape::Program`] out.

pub mod emitter;
pub mod lexer;
pub mod parser;

use crate::error::CompileDiagnostic;
use crate::opcode::ExtensionSignature;
use crate::tape::Program;

/// Compile an expression into a tape bound to `sample_rate`.
pub fn compile(source: &str, sample_rate: u32) -> Result<Program, CompileDiagnostic> {
    emitter::compile(source, sample_rate)
}

/// Compile an expression that may call into registered extension opcodes (§4.7).
pub fn compile_with_extensions(
    source: &str,
    sample_rate: u32,
    extensions: &[ExtensionSignature],
) -> Result<Program, CompileDiagnostic> {
    emitter::compile_with_extensions(source, sample_rate, extensions)
}
