//! Engine-wide error type.
//!
//! Only the conditions the spec treats as hard failures (§7 "Error handling design") are
//! represented here. Everything the spec calls a silent no-op — `set_param` on a dead voice,
//! an unknown extension opcode, a wave-table miss — stays a plain return value, never an `Err`.

use thiserror::Error;

/// A single compiler diagnostic: byte offset into the source plus a short message.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileDiagnostic {
    pub position: usize,
    pub message: String,
}

impl CompileDiagnostic {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at byte {}: {}", self.position, self.message)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("compile error {0}")]
    Compile(CompileDiagnostic),

    #[error("failed to open audio output device: {0}")]
    Device(String),

    #[error("failed to load wave '{name}': {reason}")]
    WaveLoad { name: String, reason: String },

    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

pub type EngineResult<T> = Result<T, EngineError>;
