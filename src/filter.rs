//! A compiled tape run as an N-input, one-output signal processor (§4.5 "Filter mode").
//!
//! Unlike a [`crate::voice::Voice`], a filter has no pan, duration, release, or silence
//! detection — it just runs its tape forward in lockstep with whatever external buffers are
//! handed to it, read through `input(k)`. The mixer's global-filter slot and macro extension
//! opcodes (§4.7) both use this as their execution vehicle.

use crate::chunk_alloc::ChunkAllocator;
use crate::constants::CHUNK;
use crate::registry::ExtensionRegistry;
use crate::scheduler::{Interpolation, Scheduler, SetPoint};
use crate::tape::Program;
use crate::vm::Vm;
use crate::wave::WaveTable;
use std::sync::Arc;

pub struct Filter {
    vm: Vm,
    scheduler: Scheduler,
    sample: u64,
}

impl Filter {
    pub fn new(program: Arc<Program>, allocator: Arc<ChunkAllocator>, waves: Arc<WaveTable>, sample_rate: u32) -> Self {
        let vm = Vm::new(program, allocator, waves).with_sample_rate(sample_rate);
        Self { vm, scheduler: Scheduler::new(), sample: 0 }
    }

    pub fn with_extensions(
        program: Arc<Program>,
        allocator: Arc<ChunkAllocator>,
        waves: Arc<WaveTable>,
        extensions: Arc<ExtensionRegistry>,
        sample_rate: u32,
    ) -> Self {
        let vm = Vm::with_extensions(program, allocator, waves, Some(extensions)).with_sample_rate(sample_rate);
        Self { vm, scheduler: Scheduler::new(), sample: 0 }
    }

    pub fn variable_slot(&self, name: &str) -> Option<usize> {
        self.vm.variable_slot(name)
    }

    pub fn set_param_now(&mut self, slot: usize, value: f32) {
        self.vm.set_param(slot, value);
    }

    pub fn schedule_param(&mut self, slot: usize, at_sample: i64, mode: Interpolation, value: f32) {
        let at_sample = at_sample.max(0) as u64;
        self.scheduler.schedule(
            slot,
            SetPoint {
                sample: at_sample,
                value,
                interpolation: mode,
            },
        );
    }

    /// Process `output.len()` samples of `inputs` (one slice per channel) in CHUNK-sized slices
    /// (§6 `filter_process`). `inputs` channels shorter than `output` are treated as silent past
    /// their end.
    pub fn process(&mut self, inputs: &[&[f32]], output: &mut [f32]) {
        let n = output.len();
        let mut done = 0;
        let mut scratch: Vec<Vec<f32>> = vec![Vec::new(); inputs.len()];

        while done < n {
            let slice = (n - done).min(CHUNK);
            let chunk_inputs: Vec<&[f32]> = inputs
                .iter()
                .zip(scratch.iter_mut())
                .map(|(channel, pad)| {
                    if done + slice <= channel.len() {
                        &channel[done..done + slice]
                    } else {
                        pad.clear();
                        pad.resize(slice, 0.0);
                        let available = channel.len().saturating_sub(done);
                        pad[..available].copy_from_slice(&channel[done..done + available]);
                        pad.as_slice()
                    }
                })
                .collect();
            self.vm.load_inputs(&chunk_inputs);
            let samples = self
                .vm
                .compute(&mut self.scheduler, self.sample, self.sample, None, slice);
            output[done..done + slice].copy_from_slice(samples);
            self.sample += slice as u64;
            done += slice;
        }
    }

    /// Single-sample entry point used when this filter backs a macro extension opcode (§4.7):
    /// each VM sample that reaches the macro call runs one sample of the nested tape.
    pub fn run_single(&mut self, inputs: &[f32]) -> f32 {
        let channels: Vec<&[f32]> = inputs.iter().map(std::slice::from_ref).collect();
        let mut out = [0.0f32];
        self.process(&channels, &mut out);
        out[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn filter_for(source: &str, sample_rate: u32) -> Filter {
        let program = Arc::new(compile(source, sample_rate).unwrap());
        let allocator = Arc::new(ChunkAllocator::new());
        let waves = Arc::new(WaveTable::new(sample_rate));
        Filter::new(program, allocator, waves, sample_rate)
    }

    #[test]
    fn input_echoes_external_channel() {
        let mut f = filter_for("input(0) * 0.5", 1000);
        let input = vec![1.0f32; 8];
        let mut out = vec![0.0f32; 8];
        f.process(&[&input], &mut out);
        assert!(out.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn short_input_channel_pads_with_silence() {
        let mut f = filter_for("input(0)", 1000);
        let input = vec![1.0f32; 2];
        let mut out = vec![0.0f32; 4];
        f.process(&[&input], &mut out);
        assert_eq!(out[0], 1.0);
        assert_eq!(out[3], 0.0);
    }

    #[test]
    fn run_single_produces_one_sample() {
        let mut f = filter_for("input(0) + 1.0", 1000);
        assert!((f.run_single(&[0.5]) - 1.5).abs() < 1e-6);
    }
}
