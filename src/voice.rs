//! A single playing note: a bound [`Vm`] plus the lifetime state the mixer advances each render
//! call (§3 "Voice", §4.8 "State machine").
//!
//! A voice's `sample` counter is the same signed-offset trick the tape uses for arguments: while
//! negative, the voice is still queued (waiting out its pre-delay); render clamps the silent
//! prefix and only starts executing the tape once `sample` crosses zero.

use crate::constants::{RELEASE_MIN_SECONDS, RELEASE_TIMEOUT_SECONDS, SILENCE_DECAY, SILENCE_THRESHOLD};
use crate::scheduler::{Interpolation, Scheduler, SetPoint};
use crate::tape::Program;
use crate::vm::Vm;
use std::sync::Arc;

pub type VoiceId = u64;

/// Host-supplied hook invoked exactly once when a voice is reaped, carrying the tag it was
/// created with (§6 `voice_set_complete_cb`).
pub type CompleteCallback = Box<dyn FnMut(VoiceId, i64) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceState {
    Queued,
    Playing,
    Releasing,
    Reaped,
}

pub struct Voice {
    pub id: VoiceId,
    vm: Vm,
    scheduler: Scheduler,
    /// Global sample index at chunk start; negative while queued (§3 Voice, §4.8).
    pub sample: i64,
    /// 0 until `release()`/duration timeout; monotonically increasing samples-since-release after.
    pub released: u64,
    /// 0 = unbounded.
    pub duration: u64,
    pub pan: f32,
    pub tag: i64,
    sample_rate: u32,
    silence_max: f32,
    silence_min: f32,
    complete_cb: Option<CompleteCallback>,
    completed: bool,
}

impl Voice {
    pub fn new(
        id: VoiceId,
        program: Arc<Program>,
        vm: Vm,
        delay_seconds: f32,
        tag: i64,
        sample_rate: u32,
    ) -> Self {
        let _ = &program;
        Self {
            id,
            vm,
            scheduler: Scheduler::new(),
            sample: -((delay_seconds.max(0.0) * sample_rate as f32) as i64),
            released: 0,
            duration: 0,
            pan: 0.0,
            tag,
            sample_rate,
            silence_max: 0.0,
            silence_min: 0.0,
            complete_cb: None,
            completed: false,
        }
    }

    pub fn set_complete_cb(&mut self, cb: CompleteCallback) {
        self.complete_cb = Some(cb);
    }

    pub fn state(&self) -> VoiceState {
        if self.completed {
            VoiceState::Reaped
        } else if self.sample < 0 {
            VoiceState::Queued
        } else if self.released > 0 {
            VoiceState::Releasing
        } else {
            VoiceState::Playing
        }
    }

    pub fn set_duration(&mut self, seconds: f32) {
        self.duration = (seconds.max(0.0) * self.sample_rate as f32) as u64;
    }

    pub fn set_delay(&mut self, seconds: f32) {
        self.sample = -((seconds.max(0.0) * self.sample_rate as f32) as i64);
    }

    pub fn set_position(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    /// Begin the release tail (§4.8 playing -> releasing). A no-op once already released.
    pub fn release(&mut self) {
        if self.released == 0 {
            self.released = 1;
        }
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

    /// Advance the voice by up to `want` samples, mixing its output (L, R) into `out`.
    /// Returns the number of samples actually produced (silent prefix while still queued, plus
    /// whatever the tape rendered).
    pub fn render(&mut self, global_sample: u64, want: usize, out: &mut [f32]) -> usize {
        debug_assert_eq!(out.len(), want * 2);

        let mut produced = 0usize;
        let mut first_active = 0usize;
        if self.sample < 0 {
            let silent = (-self.sample) as usize;
            first_active = silent.min(want);
            self.sample += first_active as i64;
            produced += first_active;
            if self.sample < 0 {
                return produced; // still queued past the end of this call
            }
        }

        let to_render = want - first_active;
        let age_base = self.sample as u64;
        let mut rendered = 0usize;
        while rendered < to_render {
            let slice = (to_render - rendered).min(crate::constants::CHUNK);
            let released = if self.released > 0 {
                Some(self.released + rendered as u64)
            } else {
                None
            };
            let samples = self.vm.compute(
                &mut self.scheduler,
                global_sample + first_active as u64 + rendered as u64,
                age_base + rendered as u64,
                released,
                slice,
            );
            for (i, &s) in samples.iter().enumerate() {
                let frame = first_active + rendered + i;
                spatialize(s, self.pan, &mut out[frame * 2], &mut out[frame * 2 + 1]);
                self.update_silence_envelope(s);
            }
            rendered += slice;
        }
        self.sample += to_render as i64;
        produced += to_render;

        if self.duration > 0 && self.sample as u64 >= self.duration && self.released == 0 {
            self.released = 1;
        }
        if self.released > 0 {
            self.released += to_render as u64;
        }

        produced
    }

    fn update_silence_envelope(&mut self, sample: f32) {
        self.silence_max = (self.silence_max * (1.0 - SILENCE_DECAY)).max(sample);
        self.silence_min = (self.silence_min * (1.0 - SILENCE_DECAY)).min(sample);
    }

    /// Whether the voice's tail has decayed enough, and been released long enough, to reap
    /// (§4.4 step 10, §4.8 releasing -> reaped).
    pub fn is_reapable(&self) -> bool {
        if self.released == 0 {
            return false;
        }
        let release_min_samples = (RELEASE_MIN_SECONDS * self.sample_rate as f32) as u64;
        let release_timeout_samples = (RELEASE_TIMEOUT_SECONDS * self.sample_rate as f32) as u64;
        if self.released <= release_min_samples {
            return false;
        }
        let silent = (self.silence_max - self.silence_min) < SILENCE_THRESHOLD;
        silent || self.released > release_timeout_samples
    }

    /// Eviction score used when the active-voice cap is exceeded (§4.4 step 11): higher is
    /// "weaker" and evicted first.
    pub fn eviction_score(&self) -> f32 {
        if self.released > 0 {
            self.released as f32 * 10.0 + self.sample.max(0) as f32 * 0.01
        } else {
            self.sample.max(0) as f32 * 0.1
        }
    }

    /// Fire the completion callback exactly once and mark the voice terminal (`kill()`/reap).
    pub fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            if let Some(cb) = &mut self.complete_cb {
                cb(self.id, self.tag);
            }
        }
    }
}

#[inline]
fn spatialize(sample: f32, pan: f32, left: &mut f32, right: &mut f32) {
    if pan == 0.0 {
        *left += sample;
        *right += sample;
    } else if pan > 0.0 {
        *left += sample * (1.0 - pan);
        *right += sample;
    } else {
        *left += sample;
        *right += sample * (1.0 + pan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_alloc::ChunkAllocator;
    use crate::compiler::compile;
    use crate::wave::WaveTable;

    fn voice_for(source: &str, sample_rate: u32, delay_s: f32) -> Voice {
        let program = Arc::new(compile(source, sample_rate).unwrap());
        let allocator = Arc::new(ChunkAllocator::new());
        let waves = Arc::new(WaveTable::new(sample_rate));
        let vm = Vm::new(program.clone(), allocator, waves).with_sample_rate(sample_rate);
        Voice::new(1, program, vm, delay_s, 0, sample_rate)
    }

    #[test]
    fn delayed_voice_is_silent_until_delay_elapses() {
        let mut v = voice_for("0.75", 1000, 0.5);
        let mut out = vec![0.0; 1000 * 2];
        v.render(0, 1000, &mut out);
        for frame in 0..450 {
            assert_eq!(out[frame * 2], 0.0);
        }
        let tail_nonzero = out[900 * 2];
        assert!((tail_nonzero - 0.75).abs() < 1e-3);
    }

    #[test]
    fn pan_center_sends_equal_to_both_channels() {
        let mut v = voice_for("0.5", 1000, 0.0);
        v.set_position(0.0);
        let mut out = vec![0.0; 8];
        v.render(0, 4, &mut out);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn release_starts_releasing_state() {
        let mut v = voice_for("sin(440)", 1000, 0.0);
        assert_eq!(v.state(), VoiceState::Playing);
        v.release();
        assert_eq!(v.state(), VoiceState::Releasing);
    }
}
