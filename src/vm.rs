//! Per-voice tape executor.
//!
//! A [`Vm`] binds one compiled [`Program`] to one chunk allocator and one wave table, and
//! renders it forward in slices of at most [`CHUNK`] samples. Every command owns a full
//! `CHUNK`-sample output buffer; commands are evaluated strictly in tape order, one sample at a
//! time, so that a command's operands — which can only reference earlier indices — are always
//! already written for the current sample before they're read.

use crate::chunk_alloc::ChunkAllocator;
use crate::constants::{CHUNK, DEFAULT_NOISE_SEED, MIDDLE_C_HZ, NOISE_LCG_MODULUS, NOISE_LCG_MULTIPLIER};
use crate::dsp::biquad::{BiquadFilter, FilterType};
use crate::dsp::delay_line::DelayLine;
use crate::dsp::tables::table_sin;
use crate::opcode::Opcode;
use crate::registry::ExtensionRegistry;
use crate::scheduler::Scheduler;
use crate::tape::{Command, Program};
use crate::wave::WaveTable;
use std::ptr::NonNull;
use std::sync::Arc;

/// Per-command state for operations that need to remember more than a single sample of history.
enum OpState {
    None,
    Envelope { latched_release_value: Option<f32> },
    Biquad(BiquadFilter),
    Delay(DelayLine),
    Reverb(DelayLine),
    /// Native extension op (§4.7): the `Box` is the extension's own `init()` result, dropped
    /// (its `free()`) when the voice is torn down.
    NativeExt(Box<dyn std::any::Any + Send>),
    /// Macro extension op (§4.7): a nested filter running the extension's own precompiled tape,
    /// fed this command's arguments as its inputs.
    MacroExt(Box<crate::filter::Filter>),
}

pub struct Vm {
    program: Arc<Program>,
    allocator: Arc<ChunkAllocator>,
    waves: Arc<WaveTable>,
    extensions: Option<Arc<ExtensionRegistry>>,
    buffers: Vec<NonNull<f32>>,
    phase: Vec<f32>,
    op_state: Vec<OpState>,
    /// Current held value for each variable slot, used when no automation timeline covers
    /// "now". Updated directly by `set_param`.
    defaults: Vec<f32>,
    noise_seed: i64,
    sample_rate: f32,
    /// External channels for the current chunk, read by `input(k)` under [`crate::filter::Filter`].
    filter_inputs: Vec<Vec<f32>>,
}

unsafe impl Send for Vm {}

impl Vm {
    pub fn new(program: Arc<Program>, allocator: Arc<ChunkAllocator>, waves: Arc<WaveTable>) -> Self {
        Self::with_extensions(program, allocator, waves, None)
    }

    pub fn with_extensions(
        program: Arc<Program>,
        allocator: Arc<ChunkAllocator>,
        waves: Arc<WaveTable>,
        extensions: Option<Arc<ExtensionRegistry>>,
    ) -> Self {
        let n = program.command_count();
        let buffers = (0..n).map(|_| allocator.alloc()).collect();
        let defaults = program.commands[..program.variable_count]
            .iter()
            .map(|cmd| cmd.args[0])
            .collect();
        let op_state = program
            .commands
            .iter()
            .map(|cmd| state_for(cmd, extensions.as_deref()))
            .collect();

        Self {
            program,
            allocator,
            waves,
            extensions,
            buffers,
            phase: vec![0.0; n],
            op_state,
            defaults,
            noise_seed: DEFAULT_NOISE_SEED,
            sample_rate: 44100.0,
            filter_inputs: Vec::new(),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate as f32;
        self
    }

    /// Bind this chunk's external input channels ahead of a `compute()` call (§4.5 Filter mode).
    pub fn load_inputs(&mut self, inputs: &[&[f32]]) {
        self.filter_inputs.clear();
        self.filter_inputs.extend(inputs.iter().map(|c| c.to_vec()));
    }

    /// Override a variable's held value immediately, bypassing any automation timeline.
    pub fn set_param(&mut self, slot: usize, value: f32) {
        if let Some(v) = self.defaults.get_mut(slot) {
            *v = value;
        }
    }

    pub fn variable_slot(&self, name: &str) -> Option<usize> {
        self.program.variable_index(name)
    }

    /// Render up to `CHUNK` samples starting at absolute sample `global_sample`. `age` is
    /// samples elapsed since the voice began (used by envelopes); `released` is the number of
    /// samples since release began, if any.
    pub fn compute(
        &mut self,
        scheduler: &mut Scheduler,
        global_sample: u64,
        age: u64,
        released: Option<u64>,
        chunk_len: usize,
    ) -> &[f32] {
        let chunk_len = chunk_len.min(CHUNK);
        let sample_rate = self.sample_rate;

        let mut scratch = self.defaults.clone();
        for s in 0..chunk_len {
            scratch.copy_from_slice(&self.defaults);
            scheduler.evaluate_into(global_sample + s as u64, &mut scratch);
            for slot in 0..self.program.variable_count {
                self.write(slot, s, scratch[slot]);
            }

            for idx in self.program.variable_count..self.program.commands.len() {
                let age_at_sample = age + s as u64;
                let released_at_sample = released.map(|r| r + s as u64);
                self.exec(idx, s, sample_rate, age_at_sample, released_at_sample);
            }
        }

        let root = self.program.root_index();
        unsafe { std::slice::from_raw_parts(self.buffers[root].as_ptr(), chunk_len) }
    }

    #[inline]
    fn read(&self, idx: usize, s: usize) -> f32 {
        unsafe { *self.buffers[idx].as_ptr().add(s) }
    }

    #[inline]
    fn write(&self, idx: usize, s: usize, value: f32) {
        unsafe {
            *self.buffers[idx].as_ptr().add(s) = value;
        }
    }

    #[inline]
    fn arg(&self, idx: usize, arg: f32, s: usize) -> f32 {
        if Command::is_arg_reference(arg) {
            self.read(Command::resolve_reference(idx, arg), s)
        } else {
            arg
        }
    }

    /// Read a time-denoting `adsr`/`ddadsr` argument, converting seconds to samples.
    ///
    /// A compile-time literal was already premultiplied by the sample rate when the tape was
    /// emitted (§4.1 "semantic premultiplication"); a variable reference holds the live value
    /// in seconds (the unit the host's `set_param` calls use) and must be converted here instead.
    #[inline]
    fn time_arg(&self, idx: usize, arg: f32, s: usize, sample_rate: f32) -> f32 {
        if Command::is_arg_reference(arg) {
            self.read(Command::resolve_reference(idx, arg), s) * sample_rate
        } else {
            arg
        }
    }

    fn next_noise(&mut self) -> f32 {
        self.noise_seed = (self.noise_seed * NOISE_LCG_MULTIPLIER) % NOISE_LCG_MODULUS;
        (self.noise_seed as f32 / NOISE_LCG_MODULUS as f32) * 2.0 - 1.0
    }

    fn exec(&mut self, idx: usize, s: usize, sample_rate: f32, age: u64, released: Option<u64>) {
        let command = self.program.commands[idx].clone();
        let args = command.args;

        let Some(opcode) = command.opcode() else {
            let value = self.exec_extension(idx, s, &command);
            self.write(idx, s, value);
            return;
        };

        let value = match opcode {
            Opcode::Nop => unreachable!("prelude handled separately"),

            Opcode::Add => self.arg(idx, args[0], s) + self.arg(idx, args[1], s),
            Opcode::Sub => self.arg(idx, args[0], s) - self.arg(idx, args[1], s),
            Opcode::Mul => self.arg(idx, args[0], s) * self.arg(idx, args[1], s),
            Opcode::Div => {
                let denom = self.arg(idx, args[1], s);
                if denom == 0.0 { 0.0 } else { self.arg(idx, args[0], s) / denom }
            }
            Opcode::Mod => {
                let m = self.arg(idx, args[1], s);
                if m == 0.0 { 0.0 } else { self.arg(idx, args[0], s).rem_euclid(m) }
            }
            Opcode::Pow => self.arg(idx, args[0], s).powf(self.arg(idx, args[1], s)),

            Opcode::Neg => -self.arg(idx, args[0], s),
            Opcode::Abs => self.arg(idx, args[0], s).abs(),
            Opcode::Sqrt => self.arg(idx, args[0], s).max(0.0).sqrt(),

            Opcode::Mix => (self.arg(idx, args[0], s) + self.arg(idx, args[1], s)) / 2.0,
            Opcode::Mix3 => {
                (self.arg(idx, args[0], s) + self.arg(idx, args[1], s) + self.arg(idx, args[2], s)) / 3.0
            }
            Opcode::Mix4 => {
                (self.arg(idx, args[0], s)
                    + self.arg(idx, args[1], s)
                    + self.arg(idx, args[2], s)
                    + self.arg(idx, args[3], s))
                    / 4.0
            }

            Opcode::Sin => {
                let hz = self.arg(idx, args[0], s);
                self.advance_phase(idx, hz, sample_rate);
                table_sin(self.phase[idx])
            }
            Opcode::Saw => {
                let hz = self.arg(idx, args[0], s);
                self.advance_phase(idx, hz, sample_rate);
                2.0 * self.phase[idx] - 1.0
            }
            Opcode::Ramp => {
                let hz = self.arg(idx, args[0], s);
                self.advance_phase(idx, hz, sample_rate);
                self.phase[idx]
            }
            Opcode::Square => {
                let hz = self.arg(idx, args[0], s);
                self.advance_phase(idx, hz, sample_rate);
                if self.phase[idx] < 0.5 { 1.0 } else { -1.0 }
            }
            Opcode::Pulse => {
                let hz = self.arg(idx, args[0], s);
                let duty = self.arg(idx, args[1], s).clamp(0.0, 1.0);
                self.advance_phase(idx, hz, sample_rate);
                if self.phase[idx] < duty { 1.0 } else { -1.0 }
            }
            Opcode::Triangle => {
                let hz = self.arg(idx, args[0], s);
                self.advance_phase(idx, hz, sample_rate);
                triangle(self.phase[idx])
            }

            Opcode::Noise => self.next_noise(),

            Opcode::Adsr => self.exec_adsr(idx, s, args, age, released, sample_rate),
            Opcode::Ddadsr => self.exec_ddadsr(idx, s, args, age, sample_rate),

            op if op.is_biquad() => self.exec_biquad(idx, s, op, args, sample_rate),

            Opcode::Reverb => self.exec_reverb(idx, s, args, sample_rate),
            Opcode::Delay => self.exec_delay(idx, s, args, sample_rate),
            Opcode::Cycle => self.exec_cycle(idx, s, args, sample_rate),

            Opcode::Wave => self.exec_wave(idx, s, args, sample_rate, false),
            Opcode::WaveLoop => self.exec_wave(idx, s, args, sample_rate, true),

            Opcode::Input => {
                let channel = args[0] as usize;
                self.filter_inputs.get(channel).and_then(|buf| buf.get(s)).copied().unwrap_or(0.0)
            }
        };

        self.write(idx, s, value);
    }

    /// Dispatch a command whose op code is past [`Opcode::BUILTIN_COUNT`] to the registry
    /// (§4.7): either a native function operating on its own `init()`-allocated state, or a
    /// macro op's precompiled tape run as a nested filter over this command's arguments.
    fn exec_extension(&mut self, idx: usize, s: usize, command: &Command) -> f32 {
        let Some(registry) = self.extensions.clone() else {
            return 0.0;
        };
        let Some(def) = registry.get(command.op_code) else {
            return 0.0;
        };

        let inputs: Vec<f32> = (0..command.arg_count as usize)
            .map(|i| self.arg(idx, command.args[i], s))
            .collect();

        match &def.kind {
            crate::registry::ExtensionKind::Native(native) => {
                if !matches!(self.op_state[idx], OpState::NativeExt(_)) {
                    self.op_state[idx] = OpState::NativeExt((native.init)());
                }
                match &mut self.op_state[idx] {
                    OpState::NativeExt(state) => (native.process)(state.as_mut(), &inputs),
                    _ => 0.0,
                }
            }
            crate::registry::ExtensionKind::Macro(program) => {
                if !matches!(self.op_state[idx], OpState::MacroExt(_)) {
                    let filter = crate::filter::Filter::new(
                        program.clone(),
                        self.allocator.clone(),
                        self.waves.clone(),
                        self.sample_rate as u32,
                    );
                    self.op_state[idx] = OpState::MacroExt(Box::new(filter));
                }
                match &mut self.op_state[idx] {
                    OpState::MacroExt(filter) => filter.run_single(&inputs),
                    _ => 0.0,
                }
            }
        }
    }

    #[inline]
    fn advance_phase(&mut self, idx: usize, hz: f32, sample_rate: f32) {
        self.phase[idx] = (self.phase[idx] + hz / sample_rate).rem_euclid(1.0);
    }

    fn exec_adsr(
        &mut self,
        idx: usize,
        s: usize,
        args: [f32; crate::constants::MAX_ARGS],
        age: u64,
        released: Option<u64>,
        sample_rate: f32,
    ) -> f32 {
        let attack = self.time_arg(idx, args[0], s, sample_rate).max(1.0);
        let decay = self.time_arg(idx, args[1], s, sample_rate).max(1.0);
        let sustain = self.arg(idx, args[2], s);
        let release = self.time_arg(idx, args[3], s, sample_rate).max(1.0);

        let shape = |t: f32| adsr_shape(t, attack, decay, sustain);

        match released {
            None => shape(age as f32),
            Some(rel) => {
                let latched = match &mut self.op_state[idx] {
                    OpState::Envelope { latched_release_value } => {
                        if latched_release_value.is_none() {
                            let age_at_release = age.saturating_sub(rel);
                            *latched_release_value = Some(shape(age_at_release as f32));
                        }
                        latched_release_value.unwrap()
                    }
                    _ => shape(age as f32),
                };
                latched * (1.0 - (rel as f32 / release).min(1.0))
            }
        }
    }

    fn exec_ddadsr(
        &mut self,
        idx: usize,
        s: usize,
        args: [f32; crate::constants::MAX_ARGS],
        age: u64,
        sample_rate: f32,
    ) -> f32 {
        let delay = self.time_arg(idx, args[0], s, sample_rate).max(0.0) as u64;
        let duration = self.time_arg(idx, args[1], s, sample_rate).max(0.0) as u64;
        let attack = self.time_arg(idx, args[2], s, sample_rate).max(1.0);
        let decay = self.time_arg(idx, args[3], s, sample_rate).max(1.0);
        let sustain = self.arg(idx, args[4], s);
        let release = self.time_arg(idx, args[5], s, sample_rate).max(1.0);

        if age < delay {
            return 0.0;
        }
        let t = age - delay;
        let shape = |t: f32| adsr_shape(t, attack, decay, sustain);

        if t < duration {
            shape(t as f32)
        } else {
            let rel = t - duration;
            let latched = match &mut self.op_state[idx] {
                OpState::Envelope { latched_release_value } => {
                    if latched_release_value.is_none() {
                        *latched_release_value = Some(shape(duration as f32));
                    }
                    latched_release_value.unwrap()
                }
                _ => shape(duration as f32),
            };
            latched * (1.0 - (rel as f32 / release).min(1.0))
        }
    }

    fn exec_biquad(
        &mut self,
        idx: usize,
        s: usize,
        opcode: Opcode,
        args: [f32; crate::constants::MAX_ARGS],
        sample_rate: f32,
    ) -> f32 {
        let (gain_arg, freq_arg, bw_arg, input_arg) = (args[0], args[1], args[2], args[3]);

        if s == 0 {
            let gain_db = self.arg(idx, gain_arg, s);
            let freq = self.arg(idx, freq_arg, s).max(1.0);
            let bandwidth = self.arg(idx, bw_arg, s).max(0.01);
            let filter_type = filter_type_for(opcode);
            if !matches!(self.op_state[idx], OpState::Biquad(_)) {
                self.op_state[idx] = OpState::Biquad(BiquadFilter::new());
            }
            if let OpState::Biquad(filter) = &mut self.op_state[idx] {
                filter.configure(filter_type, freq, bandwidth, gain_db, sample_rate);
            }
        }

        let input = self.arg(idx, input_arg, s);
        match &mut self.op_state[idx] {
            OpState::Biquad(filter) => filter.process(input),
            _ => input,
        }
    }

    fn exec_delay(&mut self, idx: usize, s: usize, args: [f32; crate::constants::MAX_ARGS], sample_rate: f32) -> f32 {
        let time = self.arg(idx, args[0], s).max(0.0);
        let input = self.arg(idx, args[1], s);
        let len_samples = (time * sample_rate) as usize;
        if len_samples == 0 {
            return input;
        }
        if !matches!(&self.op_state[idx], OpState::Delay(d) if d.len() == len_samples) {
            self.op_state[idx] = OpState::Delay(DelayLine::new(len_samples));
        }
        match &mut self.op_state[idx] {
            OpState::Delay(line) => line.read_write(input),
            _ => input,
        }
    }

    fn exec_reverb(&mut self, idx: usize, s: usize, args: [f32; crate::constants::MAX_ARGS], sample_rate: f32) -> f32 {
        let feedback = self.arg(idx, args[0], s).clamp(-0.999, 0.999);
        let time = self.arg(idx, args[1], s).max(0.0);
        let input = self.arg(idx, args[2], s);
        let len_samples = (time * sample_rate) as usize;
        if len_samples == 0 {
            return input;
        }
        if !matches!(&self.op_state[idx], OpState::Reverb(d) if d.len() == len_samples) {
            self.op_state[idx] = OpState::Reverb(DelayLine::new(len_samples));
        }
        match &mut self.op_state[idx] {
            OpState::Reverb(line) => {
                let tapped = line.read();
                line.write(input + tapped * feedback);
                (input + tapped) * 0.5
            }
            _ => input,
        }
    }

    fn exec_cycle(&mut self, idx: usize, s: usize, args: [f32; crate::constants::MAX_ARGS], sample_rate: f32) -> f32 {
        let rate = self.arg(idx, args[0], s);
        let count = self.program.commands[idx].arg_count as usize - 1;
        if count == 0 {
            return 0.0;
        }
        self.phase[idx] = (self.phase[idx] + rate / sample_rate).rem_euclid(count as f32);
        let selected = (self.phase[idx] as usize).min(count - 1);
        self.arg(idx, args[1 + selected], s)
    }

    fn exec_wave(
        &mut self,
        idx: usize,
        s: usize,
        args: [f32; crate::constants::MAX_ARGS],
        sample_rate: f32,
        looping: bool,
    ) -> f32 {
        let wave_id = args[0] as usize;
        let hz = self.arg(idx, args[1], s);
        let Some(name) = self.program.wave_names.get(wave_id) else {
            return 0.0;
        };
        let Some(wave) = self.waves.get(name) else {
            return 0.0;
        };

        let phase_inc = if hz.abs() > 0.001 { hz / MIDDLE_C_HZ } else { 1.0 } / sample_rate;
        self.phase[idx] += phase_inc;

        match wave.sample_at(self.phase[idx]) {
            Some(v) => v,
            None if looping => {
                self.phase[idx] = 0.0;
                wave.sample_at(0.0).unwrap_or(0.0)
            }
            None => 0.0,
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        for &buf in &self.buffers {
            self.allocator.free(buf);
        }
    }
}

fn adsr_shape(t: f32, attack: f32, decay: f32, sustain: f32) -> f32 {
    if t < attack {
        (t / attack).powi(2)
    } else if t < attack + decay {
        1.0 + (sustain - 1.0) * ((t - attack) / decay)
    } else {
        sustain
    }
}

fn triangle(phase: f32) -> f32 {
    if phase < 0.25 {
        4.0 * phase
    } else if phase < 0.75 {
        2.0 - 4.0 * phase
    } else {
        4.0 * phase - 4.0
    }
}

fn filter_type_for(opcode: Opcode) -> FilterType {
    match opcode {
        Opcode::LowPass => FilterType::LowPass,
        Opcode::HighPass => FilterType::HighPass,
        Opcode::BandPass => FilterType::BandPass,
        Opcode::Notch => FilterType::Notch,
        Opcode::PeakEq => FilterType::Peak,
        Opcode::LowShelf => FilterType::LowShelf,
        Opcode::HighShelf => FilterType::HighShelf,
        _ => unreachable!("filter_type_for called with non-biquad opcode"),
    }
}

fn state_for(command: &Command, _registry: Option<&ExtensionRegistry>) -> OpState {
    match command.opcode() {
        Some(Opcode::Adsr) | Some(Opcode::Ddadsr) => OpState::Envelope { latched_release_value: None },
        Some(op) if op.is_biquad() => OpState::Biquad(BiquadFilter::new()),
        // Native extension state is lazily created on first `exec_extension` call, since
        // `init()` may need state the registry doesn't expose at construction time.
        _ => OpState::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn vm_for(source: &str) -> Vm {
        let program = Arc::new(compile(source, 44100).unwrap());
        let allocator = Arc::new(ChunkAllocator::new());
        let waves = Arc::new(WaveTable::new(44100));
        Vm::new(program, allocator, waves).with_sample_rate(44100)
    }

    #[test]
    fn sine_stays_in_unit_range() {
        let mut vm = vm_for("sin(440)");
        let mut scheduler = Scheduler::new();
        let out = vm.compute(&mut scheduler, 0, 0, None, CHUNK);
        assert!(out.iter().all(|&v| v.abs() <= 1.0001));
    }

    #[test]
    fn mix_averages_inputs() {
        let mut vm = vm_for("mix(1.0, -1.0)");
        let mut scheduler = Scheduler::new();
        let out = vm.compute(&mut scheduler, 0, 0, None, 4);
        assert!(out.iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn zero_length_delay_is_passthrough() {
        let mut vm = vm_for("delay(0.0, 0.75)");
        let mut scheduler = Scheduler::new();
        let out = vm.compute(&mut scheduler, 0, 0, None, 4);
        assert!(out.iter().all(|&v| (v - 0.75).abs() < 1e-6));
    }

    #[test]
    fn adsr_starts_at_zero_and_climbs() {
        let mut vm = vm_for("adsr(0.01, 0.01, 0.5, 0.01)");
        let mut scheduler = Scheduler::new();
        let out = vm.compute(&mut scheduler, 0, 0, None, 4);
        assert_eq!(out[0], 0.0);
        assert!(out[3] > out[0]);
    }
}
