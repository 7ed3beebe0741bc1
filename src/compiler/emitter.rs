//! Flattens a parsed [`Expr`] tree into a [`Program`] tape.
//!
//! Two passes: first, every [`Expr::Var`] in the tree is collected into a variable prelude,
//! deduplicated by name hash (not string equality — a hash collision between two distinct
//! names silently merges them, same as the reference this hash is ported from). Second, the
//! tree is walked post-order and each node appended to the command array; operands that are
//! themselves commands become negative offsets, operands that are plain numbers are inlined as
//! literals directly in the argument slot.

use crate::compiler::parser::{Expr, Parser};
use crate::error::CompileDiagnostic;
use crate::hash::str2float;
use crate::opcode::{ExtensionSignature, Opcode};
use crate::tape::{Command, Program};

/// Compile with no extension opcodes available — the common case for builtin-only sources.
pub fn compile(source: &str, sample_rate: u32) -> Result<Program, CompileDiagnostic> {
    compile_with_extensions(source, sample_rate, &[])
}

pub fn compile_with_extensions(
    source: &str,
    sample_rate: u32,
    extensions: &[ExtensionSignature],
) -> Result<Program, CompileDiagnostic> {
    let root = Parser::parse(source)?;

    let mut variables: Vec<(String, f32, f32)> = Vec::new(); // (name, hash, default)
    collect_variables(&root, &mut variables)?;

    let mut commands = Vec::with_capacity(variables.len() + 16);
    for (name, hash, default) in &variables {
        let mut cmd = Command::new(Opcode::Nop);
        cmd.arg_count = 2;
        cmd.args[0] = *default;
        cmd.args[1] = *hash;
        commands.push(cmd);
        let _ = name;
    }

    let mut wave_names = Vec::new();
    let mut emitter = Emitter {
        commands: &mut commands,
        variables: &variables,
        wave_names: &mut wave_names,
        extensions,
        sample_rate,
    };
    emitter.emit(&root)?;

    let variable_count = variables.len();
    let variables = variables.into_iter().map(|(n, h, _)| (n, h)).collect();

    Ok(Program {
        commands,
        variable_count,
        variables,
        sample_rate,
        wave_names,
    })
}

enum Operand {
    Literal(f32),
    Ref(usize),
}

struct Emitter<'a> {
    commands: &'a mut Vec<Command>,
    variables: &'a [(String, f32, f32)],
    wave_names: &'a mut Vec<String>,
    extensions: &'a [ExtensionSignature],
    sample_rate: u32,
}

impl<'a> Emitter<'a> {
    fn emit(&mut self, expr: &Expr) -> Result<Operand, CompileDiagnostic> {
        match expr {
            Expr::Number(n) => Ok(Operand::Literal(*n)),
            Expr::Var { name, .. } => {
                let hash = str2float(name);
                let slot = self
                    .variables
                    .iter()
                    .position(|(_, h, _)| *h == hash)
                    .expect("variable was registered during collection pass");
                Ok(Operand::Ref(slot))
            }
            Expr::WaveName(_) => Err(CompileDiagnostic::new(
                0,
                "string literal may only appear as the first argument of wave()/wave_loop()",
            )),
            Expr::Neg(inner) => self.emit_call(Opcode::Neg, std::slice::from_ref(inner.as_ref())),
            Expr::Call(Opcode::Wave, args) | Expr::Call(Opcode::WaveLoop, args) => {
                self.emit_wave_call(expr, args)
            }
            Expr::Call(opcode, args) => self.emit_call(*opcode, args),
            Expr::ExtCall(name, args) => self.emit_ext_call(name, args),
        }
    }

    fn emit_ext_call(&mut self, name: &str, args: &[Expr]) -> Result<Operand, CompileDiagnostic> {
        let sig = self
            .extensions
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CompileDiagnostic::new(0, format!("unknown operation '{name}'")))?
            .clone();

        let count = args.len() as u8;
        if count < sig.arity.min || count > sig.arity.max {
            return Err(CompileDiagnostic::new(
                0,
                format!(
                    "'{name}' expects {}..{} argument(s), got {count}",
                    sig.arity.min, sig.arity.max
                ),
            ));
        }

        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            operands.push(self.emit(arg)?);
        }

        let my_index = self.commands.len();
        let mut cmd = Command::with_code(sig.id);
        cmd.arg_count = operands.len() as u8;
        for (i, operand) in operands.into_iter().enumerate() {
            cmd.args[i] = resolve(operand, my_index);
        }
        self.commands.push(cmd);
        Ok(Operand::Ref(my_index))
    }

    fn emit_wave_call(&mut self, expr: &Expr, args: &[Expr]) -> Result<Operand, CompileDiagnostic> {
        let opcode = match expr {
            Expr::Call(op, _) => *op,
            _ => unreachable!(),
        };
        let name = match &args[0] {
            Expr::WaveName(n) => n.clone(),
            _ => {
                return Err(CompileDiagnostic::new(
                    0,
                    format!("'{opcode}' requires a string literal as its first argument"),
                ));
            }
        };
        let id = self
            .wave_names
            .iter()
            .position(|n| n == &name)
            .unwrap_or_else(|| {
                self.wave_names.push(name);
                self.wave_names.len() - 1
            });

        // hz is optional (middle-C default) when only the wave name is given.
        let hz_operand = if args.len() > 1 {
            self.emit(&args[1])?
        } else {
            Operand::Literal(crate::constants::MIDDLE_C_HZ)
        };
        let my_index = self.commands.len();

        let mut cmd = Command::new(opcode);
        cmd.arg_count = 2;
        cmd.args[0] = id as f32;
        cmd.args[1] = resolve(hz_operand, my_index);
        self.commands.push(cmd);
        Ok(Operand::Ref(my_index))
    }

    fn emit_call(&mut self, opcode: Opcode, args: &[Expr]) -> Result<Operand, CompileDiagnostic> {
        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            operands.push(self.emit(arg)?);
        }

        // Time-in-seconds literal arguments of adsr/ddadsr are premultiplied by the sample
        // rate at compile time, so the VM only ever deals in sample counts (§4.1).
        let time_arg_indices: &[usize] = match opcode {
            Opcode::Adsr => &[0, 1, 3],         // attack, decay, release (index 2 is sustain level)
            Opcode::Ddadsr => &[0, 1, 2, 3, 5], // delay, dur, attack, decay, release
            _ => &[],
        };

        let my_index = self.commands.len();
        let mut cmd = Command::new(opcode);
        cmd.arg_count = operands.len() as u8;
        for (i, operand) in operands.into_iter().enumerate() {
            let resolved = match operand {
                Operand::Literal(v) if time_arg_indices.contains(&i) => v * self.sample_rate as f32,
                other => resolve(other, my_index),
            };
            cmd.args[i] = resolved;
        }
        self.commands.push(cmd);
        Ok(Operand::Ref(my_index))
    }
}

fn resolve(operand: Operand, my_index: usize) -> f32 {
    match operand {
        Operand::Literal(v) => v,
        Operand::Ref(idx) => (idx as isize - my_index as isize) as f32,
    }
}

/// First pass: gather every variable reference in source order, folding constant default
/// expressions, and dedup by name hash (first occurrence's default wins).
fn collect_variables(
    expr: &Expr,
    out: &mut Vec<(String, f32, f32)>,
) -> Result<(), CompileDiagnostic> {
    match expr {
        Expr::Number(_) | Expr::WaveName(_) => Ok(()),
        Expr::Neg(inner) => collect_variables(inner, out),
        Expr::Var { name, default } => {
            let hash = str2float(name);
            if out.iter().any(|(_, h, _)| *h == hash) {
                return Ok(());
            }
            let value = match default {
                Some(expr) => eval_constant(expr)?,
                None => 0.0,
            };
            out.push((name.clone(), hash, value));
            Ok(())
        }
        Expr::Call(_, args) | Expr::ExtCall(_, args) => {
            for arg in args {
                collect_variables(arg, out)?;
            }
            Ok(())
        }
    }
}

/// Evaluate a default-value expression at compile time. Defaults must be constant: numbers,
/// negation, and `+ - * / ^` combinations of constants.
fn eval_constant(expr: &Expr) -> Result<f32, CompileDiagnostic> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Neg(inner) => Ok(-eval_constant(inner)?),
        Expr::Call(Opcode::Add, args) => Ok(eval_constant(&args[0])? + eval_constant(&args[1])?),
        Expr::Call(Opcode::Sub, args) => Ok(eval_constant(&args[0])? - eval_constant(&args[1])?),
        Expr::Call(Opcode::Mul, args) => Ok(eval_constant(&args[0])? * eval_constant(&args[1])?),
        Expr::Call(Opcode::Div, args) => Ok(eval_constant(&args[0])? / eval_constant(&args[1])?),
        Expr::Call(Opcode::Pow, args) => Ok(eval_constant(&args[0])?.powf(eval_constant(&args[1])?)),
        _ => Err(CompileDiagnostic::new(
            0,
            "variable default must be a constant expression",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_prelude_before_tree() {
        let program = compile("sin(hz=440) * amp=0.5", 44100).unwrap();
        assert_eq!(program.variable_count, 2);
        assert_eq!(program.root_index(), program.commands.len() - 1);
        assert_eq!(program.commands[program.root_index()].opcode(), Some(Opcode::Mul));
    }

    #[test]
    fn dedups_repeated_variable_by_name() {
        let program = compile("sin(hz=440) + sin(hz)", 44100).unwrap();
        assert_eq!(program.variable_count, 1);
    }

    #[test]
    fn wave_name_becomes_stable_id() {
        let program = compile("wave('kick', 1.0) + wave('kick', 2.0)", 44100).unwrap();
        assert_eq!(program.wave_names, vec!["kick".to_string()]);
    }

    #[test]
    fn rejects_non_constant_default() {
        assert!(compile("sin(hz=sin(1))", 44100).is_err());
    }
}
