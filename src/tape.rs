//! The flat, executable form a compiled expression is reduced to.
//!
//! A [`Program`] is a sequential array of [`Command`]s in reverse post-order (root last).
//! Each argument slot holds either a literal `f32` or, when negative, a signed offset from the
//! command's own index to the command whose output it consumes — `target = index + offset`.
//! Offsets are always negative because every operand of a command was necessarily emitted
//! earlier in the array (post-order), and the prelude of per-variable NOPs always sits before
//! everything else, at indices `0..variable_count`.

use crate::opcode::Opcode;
use crate::constants::MAX_ARGS;

#[derive(Clone, Debug)]
pub struct Command {
    /// Flat numeric op-code space: `0..Opcode::BUILTIN_COUNT` is a builtin (see
    /// [`Opcode::code`]/[`Opcode::from_code`]); ids at or past that are extensions registered
    /// with [`crate::registry::ExtensionRegistry`] (§4.7).
    pub op_code: u16,
    pub arg_count: u8,
    /// Each slot is either a literal value or, if negative, an offset to another command's
    /// output (`this_index + offset` gives the source command's index).
    pub args: [f32; MAX_ARGS],
}

impl Command {
    pub fn new(opcode: Opcode) -> Self {
        Self::with_code(opcode.code())
    }

    pub fn with_code(op_code: u16) -> Self {
        Self {
            op_code,
            arg_count: 0,
            args: [0.0; MAX_ARGS],
        }
    }

    /// The builtin this command runs, or `None` if it's an extension opcode.
    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_code(self.op_code)
    }

    #[inline]
    pub fn is_extension(&self) -> bool {
        self.op_code as usize >= Opcode::BUILTIN_COUNT
    }

    #[inline]
    pub fn is_arg_reference(arg: f32) -> bool {
        arg < 0.0
    }

    /// Resolve an argument slot against this command's own index, returning the index of the
    /// command whose output this references. Caller must already know `arg` is a reference
    /// (`is_arg_reference`).
    #[inline]
    pub fn resolve_reference(my_index: usize, arg: f32) -> usize {
        debug_assert!(arg < 0.0);
        (my_index as isize + arg as isize) as usize
    }
}

/// A compiled program: the flat tape plus bookkeeping needed to re-bind it to a voice.
#[derive(Clone, Debug)]
pub struct Program {
    pub commands: Vec<Command>,
    /// Number of leading NOP commands that make up the variable prelude.
    pub variable_count: usize,
    /// Parallel to the prelude: `(name, hash)` for each live variable, in prelude order.
    pub variables: Vec<(String, f32)>,
    /// Sample rate this program was compiled for.
    pub sample_rate: u32,
    /// Wave names referenced by `wave`/`wave_loop` calls, indexed by the id embedded in the
    /// command's first argument.
    pub wave_names: Vec<String>,
}

impl Program {
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// The root command is always last in a reverse-post-order tape.
    pub fn root_index(&self) -> usize {
        self.commands.len() - 1
    }

    /// Find the prelude slot for a named variable, if it was referenced anywhere in source.
    pub fn variable_index(&self, name: &str) -> Option<usize> {
        let hash = crate::hash::str2float(name);
        self.variables
            .iter()
            .position(|(_, h)| *h == hash)
            .or_else(|| self.variables.iter().position(|(n, _)| n == name))
    }
}
