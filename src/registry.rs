//! Extension registry (§4.7): opcodes beyond the closed builtin set, added at runtime by the
//! host and addressed by the same flat numeric id space the tape already uses for builtins.
//!
//! Two kinds of extension. A *native* op is a `process`/`init` pair operating on state the
//! extension owns (the `free` half of that triple is just `Drop` on the `Box` `init` returns —
//! idiomatic in place of a raw C-style teardown pointer). A *macro* op is a precompiled
//! [`Program`] run as a nested [`crate::filter::Filter`], its arguments fed in as `input(k)`.

use crate::opcode::{Arity, ExtensionSignature, Opcode};
use crate::tape::Program;
use std::sync::Arc;

pub type NativeInit = fn() -> Box<dyn std::any::Any + Send>;
pub type NativeProcess = fn(state: &mut dyn std::any::Any, inputs: &[f32]) -> f32;

#[derive(Clone)]
pub struct NativeOp {
    pub arity: Arity,
    pub init: NativeInit,
    pub process: NativeProcess,
}

#[derive(Clone)]
pub enum ExtensionKind {
    Native(NativeOp),
    Macro(Arc<Program>),
}

#[derive(Clone)]
pub struct ExtensionDef {
    pub name: String,
    pub id: u16,
    pub kind: ExtensionKind,
}

impl ExtensionDef {
    pub fn arity(&self) -> Arity {
        match &self.kind {
            ExtensionKind::Native(native) => native.arity,
            // A macro op's arity is however many inputs its tape actually reads.
            ExtensionKind::Macro(program) => {
                let n_inputs = program
                    .commands
                    .iter()
                    .filter(|c| c.opcode() == Some(Opcode::Input))
                    .map(|c| c.args[0] as u8 + 1)
                    .max()
                    .unwrap_or(0);
                Arity { min: n_inputs, max: n_inputs }
            }
        }
    }
}

/// Extension ids are assigned sequentially starting at [`Opcode::BUILTIN_COUNT`], so a tape
/// command's `op_code` needs no extra tag to tell a builtin from an extension (§4.7).
///
/// Registering a new extension produces a new registry rather than mutating one shared across
/// threads: [`crate::mixer::Engine::add_op`]/`add_op_program` clone-and-replace their `Arc`, so
/// voices already holding the old `Arc` keep running against the snapshot they were built with.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    defs: Vec<ExtensionDef>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self { defs: Vec::new() }
    }

    /// Register a native op, returning the numeric id it was assigned (§6 `add_op`).
    pub fn add_native(
        &mut self,
        name: impl Into<String>,
        arity: Arity,
        init: NativeInit,
        process: NativeProcess,
    ) -> u16 {
        let id = self.next_id();
        self.defs.push(ExtensionDef {
            name: name.into(),
            id,
            kind: ExtensionKind::Native(NativeOp { arity, init, process }),
        });
        id
    }

    /// Register a macro op backed by a precompiled tape (§6 `add_op_program`).
    pub fn add_macro(&mut self, name: impl Into<String>, program: Arc<Program>) -> u16 {
        let id = self.next_id();
        self.defs.push(ExtensionDef {
            name: name.into(),
            id,
            kind: ExtensionKind::Macro(program),
        });
        id
    }

    fn next_id(&self) -> u16 {
        (Opcode::BUILTIN_COUNT + self.defs.len()) as u16
    }

    pub fn get(&self, op_code: u16) -> Option<&ExtensionDef> {
        let i = (op_code as usize).checked_sub(Opcode::BUILTIN_COUNT)?;
        self.defs.get(i)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ExtensionDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    /// Catalog of every registered extension's name/id/arity, for the compiler to resolve
    /// unrecognized call names against (threaded through [`crate::compiler::compile_with_extensions`]).
    pub fn signatures(&self) -> Vec<ExtensionSignature> {
        self.defs
            .iter()
            .map(|d| ExtensionSignature {
                name: d.name.clone(),
                id: d.id,
                arity: d.arity(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_init() -> Box<dyn std::any::Any + Send> {
        Box::new(0.0f32)
    }

    fn sum_process(_state: &mut dyn std::any::Any, inputs: &[f32]) -> f32 {
        inputs.iter().sum()
    }

    #[test]
    fn ids_continue_after_builtins() {
        let mut reg = ExtensionRegistry::new();
        let first = reg.add_native("my_sum", Arity { min: 1, max: 4 }, noop_init, sum_process);
        assert_eq!(first as usize, Opcode::BUILTIN_COUNT);
        let second = reg.add_native("my_other", Arity { min: 1, max: 1 }, noop_init, sum_process);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn lookup_by_code_and_name_agree() {
        let mut reg = ExtensionRegistry::new();
        let id = reg.add_native("my_sum", Arity { min: 1, max: 4 }, noop_init, sum_process);
        let by_code = reg.get(id).unwrap();
        let by_name = reg.find_by_name("my_sum").unwrap();
        assert_eq!(by_code.id, by_name.id);
    }

    #[test]
    fn signatures_reflect_registered_arity() {
        let mut reg = ExtensionRegistry::new();
        reg.add_native("my_sum", Arity { min: 2, max: 3 }, noop_init, sum_process);
        let sigs = reg.signatures();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].name, "my_sum");
        assert_eq!(sigs[0].arity.min, 2);
        assert_eq!(sigs[0].arity.max, 3);
    }
}
