//! Voice pool, render pipeline, and public API (§4.4 "synthesize", §5 "Concurrency", §6 "Public
//! API").
//!
//! `Engine` owns every voice plus the chunk allocator, wave table, and extension registry they
//! all share. A `synthesize()` call walks a fixed pipeline: zero the accumulators, run
//! pre-callbacks, shard the live voice list across a small scoped-thread pool and render each
//! voice's contribution, collapse the shards back together, run the mix through the optional
//! per-channel global filter, soft-clip and scale, reap anything that finished or lost the
//! active-voice lottery, advance the sample clock, then run post-callbacks.

use crate::chunk_alloc::ChunkAllocator;
use crate::compiler::compile_with_extensions;
use crate::constants::{CHUNK, DEFAULT_MAX_ACTIVE, DEFAULT_MAX_VOICES, DEFAULT_SAMPLE_RATE, MAX_WORKER_THREADS};
use crate::error::{EngineError, EngineResult};
use crate::filter::Filter;
use crate::opcode::Arity;
use crate::registry::{ExtensionRegistry, NativeInit, NativeProcess};
use crate::scheduler::Interpolation;
use crate::tape::Program;
use crate::vm::Vm;
use crate::voice::{CompleteCallback, Voice, VoiceId, VoiceState};
use crate::wave::{Wave, WaveTable};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Mono downmix of the stereo mix, one `f32` per sample.
    F32Mono,
    /// Two discrete `f32` planes, one per channel.
    F32Stereo,
    /// Interleaved 16-bit PCM, two channels per frame.
    S16Stereo,
}

pub type FilterId = u64;
type Callback = Box<dyn FnMut() + Send>;

pub struct Engine {
    voices: Vec<Voice>,
    next_voice_id: VoiceId,
    sample_rate: u32,
    allocator: Arc<ChunkAllocator>,
    waves: Arc<WaveTable>,
    extensions: Arc<ExtensionRegistry>,
    max_voices: usize,
    max_active: usize,
    format: OutputFormat,
    /// One filter per output channel, so left and right accumulate independent filter state
    /// (§4.4 step 9 "optional global filter").
    global_filters: [Option<Filter>; 2],
    worker_count: usize,
    level_scale: f32,
    sample_counter: u64,
    pre_cbs: Vec<(u64, Callback)>,
    post_cbs: Vec<(u64, Callback)>,
    next_cb_id: u64,
    standalone_filters: Vec<(FilterId, Filter)>,
    next_filter_id: FilterId,
}

impl Engine {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_capacity(sample_rate, DEFAULT_MAX_VOICES, DEFAULT_MAX_ACTIVE)
    }

    pub fn with_capacity(sample_rate: u32, max_voices: usize, max_active: usize) -> Self {
        let sample_rate = if sample_rate == 0 { DEFAULT_SAMPLE_RATE } else { sample_rate };
        Self {
            voices: Vec::with_capacity(max_voices),
            next_voice_id: 1,
            sample_rate,
            allocator: Arc::new(ChunkAllocator::new()),
            waves: Arc::new(WaveTable::new(sample_rate)),
            extensions: Arc::new(ExtensionRegistry::new()),
            max_voices,
            max_active,
            format: OutputFormat::F32Stereo,
            global_filters: [None, None],
            worker_count: 1,
            level_scale: 1.0,
            sample_counter: 0,
            pre_cbs: Vec::new(),
            post_cbs: Vec::new(),
            next_cb_id: 1,
            standalone_filters: Vec::new(),
            next_filter_id: 1,
        }
    }

    /// Tear down the engine. Voices and filters are freed by `Drop`; this exists only so the
    /// host has an explicit call site matching the rest of the §6 API.
    pub fn free(self) {}

    pub fn set_sample_rate(&mut self, sample_rate: u32) -> EngineResult<()> {
        if sample_rate == 0 {
            return Err(EngineError::InvalidSampleRate(sample_rate));
        }
        self.sample_rate = sample_rate;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_format(&mut self, format: OutputFormat) {
        self.format = format;
    }

    pub fn set_voice_count(&mut self, n: usize) {
        self.max_voices = n;
    }

    pub fn set_max_active(&mut self, n: usize) {
        self.max_active = n;
    }

    /// Number of scoped worker threads `synthesize()` shards voices across, clamped to
    /// [`MAX_WORKER_THREADS`]; one shard always renders on the calling thread (§5).
    pub fn set_worker_count(&mut self, n: usize) {
        self.worker_count = n.clamp(1, MAX_WORKER_THREADS);
    }

    pub fn set_level_scale(&mut self, scale: f32) {
        self.level_scale = scale.max(0.0);
    }

    fn compile(&self, source: &str) -> EngineResult<Program> {
        compile_with_extensions(source, self.sample_rate, &self.extensions.signatures())
            .map_err(EngineError::Compile)
    }

    pub fn set_global_filter(&mut self, source: Option<&str>) -> EngineResult<()> {
        let Some(source) = source else {
            self.global_filters = [None, None];
            return Ok(());
        };
        let program = Arc::new(self.compile(source)?);
        let make = || {
            Filter::with_extensions(
                program.clone(),
                self.allocator.clone(),
                self.waves.clone(),
                self.extensions.clone(),
                self.sample_rate,
            )
        };
        self.global_filters = [Some(make()), Some(make())];
        Ok(())
    }

    /// Register a native extension opcode (§6 `add_op`, §4.7). Voices already running keep
    /// using the registry snapshot they were created with; only voices created afterward see it.
    pub fn add_op(
        &mut self,
        name: impl Into<String>,
        arity: Arity,
        init: NativeInit,
        process: NativeProcess,
    ) -> u16 {
        let mut reg = (*self.extensions).clone();
        let id = reg.add_native(name, arity, init, process);
        self.extensions = Arc::new(reg);
        id
    }

    /// Register a macro extension opcode backed by a precompiled tape (§6 `add_op_program`).
    pub fn add_op_program(&mut self, name: impl Into<String>, source: &str) -> EngineResult<u16> {
        let program = Arc::new(self.compile(source)?);
        let mut reg = (*self.extensions).clone();
        let id = reg.add_macro(name, program);
        self.extensions = Arc::new(reg);
        Ok(id)
    }

    pub fn add_pre_cb(&mut self, cb: Callback) -> u64 {
        let id = self.next_cb_id;
        self.next_cb_id += 1;
        self.pre_cbs.push((id, cb));
        id
    }

    pub fn add_post_cb(&mut self, cb: Callback) -> u64 {
        let id = self.next_cb_id;
        self.next_cb_id += 1;
        self.post_cbs.push((id, cb));
        id
    }

    pub fn remove_cb(&mut self, id: u64) {
        self.pre_cbs.retain(|(cid, _)| *cid != id);
        self.post_cbs.retain(|(cid, _)| *cid != id);
    }

    pub fn new_voice(&mut self, source: &str, delay_seconds: f32, tag: i64) -> EngineResult<VoiceId> {
        let program = Arc::new(self.compile(source)?);
        if self.voices.len() >= self.max_voices {
            self.evict_weakest_overall(1);
        }
        let vm = Vm::with_extensions(
            program.clone(),
            self.allocator.clone(),
            self.waves.clone(),
            Some(self.extensions.clone()),
        )
        .with_sample_rate(self.sample_rate);
        let id = self.next_voice_id;
        self.next_voice_id += 1;
        self.voices.push(Voice::new(id, program, vm, delay_seconds, tag, self.sample_rate));
        Ok(id)
    }

    fn voice_mut(&mut self, id: VoiceId) -> Option<&mut Voice> {
        self.voices.iter_mut().find(|v| v.id == id)
    }

    pub fn voice_release(&mut self, id: VoiceId) {
        if let Some(voice) = self.voice_mut(id) {
            voice.release();
        }
    }

    pub fn voice_kill(&mut self, id: VoiceId) {
        if let Some(pos) = self.voices.iter().position(|v| v.id == id) {
            let mut voice = self.voices.remove(pos);
            voice.complete();
        }
    }

    /// Kill every voice carrying `tag` (§6 `kill`).
    pub fn kill(&mut self, tag: i64) {
        let ids: Vec<VoiceId> = self.voices.iter().filter(|v| v.tag == tag).map(|v| v.id).collect();
        for id in ids {
            self.voice_kill(id);
        }
    }

    pub fn voice_set_duration(&mut self, id: VoiceId, seconds: f32) {
        if let Some(voice) = self.voice_mut(id) {
            voice.set_duration(seconds);
        }
    }

    pub fn voice_set_delay(&mut self, id: VoiceId, seconds: f32) {
        if let Some(voice) = self.voice_mut(id) {
            voice.set_delay(seconds);
        }
    }

    pub fn voice_set_position(&mut self, id: VoiceId, pan: f32) {
        if let Some(voice) = self.voice_mut(id) {
            voice.set_position(pan);
        }
    }

    pub fn voice_set_param(&mut self, id: VoiceId, name: &str, value: f32) {
        if let Some(voice) = self.voice_mut(id) {
            if let Some(slot) = voice.variable_slot(name) {
                voice.set_param_now(slot, value);
            }
        }
    }

    /// Schedule a parameter change `when_seconds` from now (§6 `set_param_delayed`). A negative
    /// `when_seconds` is treated as immediate and clamped to 0, matching `set_param`'s own
    /// "apply right away" behavior rather than erroring on an already-past timestamp.
    pub fn voice_set_param_delayed(
        &mut self,
        id: VoiceId,
        name: &str,
        value: f32,
        when_seconds: f32,
        interpolation: Interpolation,
    ) {
        let sample_rate = self.sample_rate as f32;
        let sample_counter = self.sample_counter;
        if let Some(voice) = self.voice_mut(id) {
            if let Some(slot) = voice.variable_slot(name) {
                let when = when_seconds.max(0.0);
                let at_sample = sample_counter as i64 + (when * sample_rate) as i64;
                voice.schedule_param(slot, at_sample, interpolation, value);
            }
        }
    }

    pub fn voice_set_complete_cb(&mut self, id: VoiceId, cb: CompleteCallback) {
        if let Some(voice) = self.voice_mut(id) {
            voice.set_complete_cb(cb);
        }
    }

    pub fn load_wave(&self, name: &str, path: &Path) -> EngineResult<()> {
        if self.waves.load_file(path, name) {
            Ok(())
        } else {
            Err(EngineError::WaveLoad {
                name: name.to_string(),
                reason: "failed to open or decode file".to_string(),
            })
        }
    }

    pub fn insert_wave(&self, name: impl Into<String>, wave: Wave) {
        self.waves.insert(name, wave);
    }

    pub fn set_wave_handler(&self, handler: crate::wave::WaveHandler) {
        self.waves.set_handler(handler);
    }

    pub fn filter_new(&mut self, source: &str) -> EngineResult<FilterId> {
        let program = Arc::new(self.compile(source)?);
        let filter = Filter::with_extensions(
            program,
            self.allocator.clone(),
            self.waves.clone(),
            self.extensions.clone(),
            self.sample_rate,
        );
        let id = self.next_filter_id;
        self.next_filter_id += 1;
        self.standalone_filters.push((id, filter));
        Ok(id)
    }

    pub fn filter_process(&mut self, id: FilterId, inputs: &[&[f32]], output: &mut [f32]) -> bool {
        match self.standalone_filters.iter_mut().find(|(fid, _)| *fid == id) {
            Some((_, filter)) => {
                filter.process(inputs, output);
                true
            }
            None => false,
        }
    }

    pub fn filter_free(&mut self, id: FilterId) {
        self.standalone_filters.retain(|(fid, _)| *fid != id);
    }

    /// Render `n` samples into `out1`/`out2` per the current [`OutputFormat`] (§6 `synthesize`).
    /// `out2` is unused (and may be empty) for [`OutputFormat::F32Mono`]; `S16Stereo` hosts
    /// should use [`Self::synthesize_i16`] instead, since 16-bit samples don't fit an `f32` slot.
    pub fn synthesize(&mut self, n: usize, out1: &mut [f32], out2: &mut [f32]) -> usize {
        let (left, right) = self.render_pipeline(n);
        match self.format {
            OutputFormat::F32Mono => {
                for i in 0..n {
                    out1[i] = (left[i] + right[i]) * 0.5;
                }
            }
            OutputFormat::F32Stereo => {
                out1[..n].copy_from_slice(&left[..n]);
                out2[..n].copy_from_slice(&right[..n]);
            }
            OutputFormat::S16Stereo => {
                // No-op here by design; see `synthesize_i16`.
            }
        }
        n
    }

    /// Render `n` frames as interleaved 16-bit PCM (§6 `synthesize`, `s16S` format).
    pub fn synthesize_i16(&mut self, n: usize, out: &mut [i16]) -> usize {
        let (left, right) = self.render_pipeline(n);
        for i in 0..n {
            out[i * 2] = (left[i].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out[i * 2 + 1] = (right[i].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        }
        n
    }

    fn render_pipeline(&mut self, n: usize) -> (Vec<f32>, Vec<f32>) {
        for (_, cb) in self.pre_cbs.iter_mut() {
            cb();
        }

        let (left, right) = self.render_voices(n);
        let (mut left, mut right) = self.apply_global_filter(left, right);

        for v in left.iter_mut().chain(right.iter_mut()) {
            *v = soft_clip(*v * self.level_scale);
        }

        self.reap_finished_voices();
        self.evict_excess_active();

        self.sample_counter += n as u64;

        for (_, cb) in self.post_cbs.iter_mut() {
            cb();
        }

        (left, right)
    }

    /// Shard the live voice list across `worker_count` scoped threads and render each voice's
    /// contribution into per-shard interleaved scratch, then collapse the shards (§4.4 steps
    /// 4-8, §5). One shard always runs on the calling thread.
    fn render_voices(&mut self, n: usize) -> (Vec<f32>, Vec<f32>) {
        let sample_counter = self.sample_counter;
        let worker_count = self.worker_count.max(1).min(self.voices.len().max(1));

        let interleaved = if worker_count <= 1 {
            let mut buf = vec![0.0f32; n * 2];
            for voice in self.voices.iter_mut() {
                voice.render(sample_counter, n, &mut buf);
            }
            buf
        } else {
            let chunk_size = self.voices.len().div_ceil(worker_count).max(1);
            let shards: Vec<&mut [Voice]> = self.voices.chunks_mut(chunk_size).collect();
            let shard_buffers: Vec<Vec<f32>> = std::thread::scope(|scope| {
                let handles: Vec<_> = shards
                    .into_iter()
                    .map(|shard| {
                        scope.spawn(move || {
                            let mut buf = vec![0.0f32; n * 2];
                            for voice in shard.iter_mut() {
                                voice.render(sample_counter, n, &mut buf);
                            }
                            buf
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("voice render thread panicked")).collect()
            });
            let mut combined = vec![0.0f32; n * 2];
            for shard in shard_buffers {
                for (acc, v) in combined.iter_mut().zip(shard.iter()) {
                    *acc += v;
                }
            }
            combined
        };

        let mut left = vec![0.0f32; n];
        let mut right = vec![0.0f32; n];
        for i in 0..n {
            left[i] = interleaved[i * 2];
            right[i] = interleaved[i * 2 + 1];
        }
        (left, right)
    }

    fn apply_global_filter(&mut self, left: Vec<f32>, right: Vec<f32>) -> (Vec<f32>, Vec<f32>) {
        let n = left.len();
        match &mut self.global_filters {
            [Some(lf), Some(rf)] => {
                let mut out_left = vec![0.0f32; n];
                let mut out_right = vec![0.0f32; n];
                lf.process(&[&left], &mut out_left);
                rf.process(&[&right], &mut out_right);
                (out_left, out_right)
            }
            _ => (left, right),
        }
    }

    /// Fire completion callbacks for voices whose release tail has fully decayed or timed out,
    /// then drop them (§4.4 step 10, §4.8 releasing -> reaped).
    fn reap_finished_voices(&mut self) {
        for voice in self.voices.iter_mut() {
            if voice.is_reapable() {
                voice.complete();
            }
        }
        self.voices.retain(|v| v.state() != VoiceState::Reaped);
    }

    /// When more voices are concurrently active (queued excluded) than `max_active` allows, kill
    /// the weakest ones by eviction score until the cap holds again (§4.4 step 11).
    fn evict_excess_active(&mut self) {
        let active: Vec<usize> = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state() != VoiceState::Queued)
            .map(|(i, _)| i)
            .collect();
        self.evict_weakest_among(&active, self.max_active, 0);
    }

    /// Make room for `extra_incoming` new voices against the total pool cap (`max_voices`),
    /// evicting across every voice regardless of lifecycle state.
    fn evict_weakest_overall(&mut self, extra_incoming: usize) {
        let all: Vec<usize> = (0..self.voices.len()).collect();
        self.evict_weakest_among(&all, self.max_voices, extra_incoming);
    }

    fn evict_weakest_among(&mut self, candidates: &[usize], cap: usize, extra_incoming: usize) {
        let cap = cap.saturating_sub(extra_incoming);
        if candidates.len() <= cap {
            return;
        }
        let mut scored: Vec<(usize, f32)> =
            candidates.iter().map(|&i| (i, self.voices[i].eviction_score())).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let excess = scored.len() - cap;
        for &(idx, _) in &scored[..excess] {
            self.voices[idx].complete();
        }
        self.voices.retain(|v| v.state() != VoiceState::Reaped);
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }
}

/// Classic cubic soft clip: identity inside `[-1, 1]`, flattening smoothly to `±2/3` beyond it,
/// used instead of a hard clamp to avoid audible aliasing on transient overshoot (§4.4 step 9).
fn soft_clip(x: f32) -> f32 {
    if x <= -1.0 {
        -2.0 / 3.0
    } else if x >= 1.0 {
        2.0 / 3.0
    } else {
        x - (x * x * x) / 3.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_voice_renders_audible_output() {
        let mut engine = Engine::new(1000);
        engine.new_voice("sin(440)", 0.0, 0).unwrap();
        let mut left = vec![0.0; CHUNK];
        let mut right = vec![0.0; CHUNK];
        engine.set_format(OutputFormat::F32Stereo);
        engine.synthesize(CHUNK, &mut left, &mut right);
        assert!(left.iter().any(|&v| v.abs() > 0.01));
        assert_eq!(left, right);
    }

    #[test]
    fn f32_mono_downmixes_pan() {
        let mut engine = Engine::new(1000);
        let id = engine.new_voice("0.5", 0.0, 0).unwrap();
        engine.voice_set_position(id, -1.0); // hard left
        engine.set_format(OutputFormat::F32Mono);
        let mut mono = vec![0.0; 4];
        engine.synthesize(4, &mut mono, &mut []);
        assert!(mono.iter().all(|&v| (v - 0.25).abs() < 1e-3));
    }

    #[test]
    fn killed_voice_fires_complete_callback() {
        let mut engine = Engine::new(1000);
        let id = engine.new_voice("sin(440)", 0.0, 7).unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        engine.voice_set_complete_cb(
            id,
            Box::new(move |_id, tag| {
                assert_eq!(tag, 7);
                fired2.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        engine.voice_kill(id);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(engine.voice_count(), 0);
    }

    #[test]
    fn kill_by_tag_removes_matching_voices_only() {
        let mut engine = Engine::new(1000);
        engine.new_voice("sin(440)", 0.0, 1).unwrap();
        engine.new_voice("sin(220)", 0.0, 2).unwrap();
        engine.kill(1);
        assert_eq!(engine.voice_count(), 1);
    }

    #[test]
    fn rendering_shards_across_workers_matches_single_threaded() {
        let mut single = Engine::new(1000);
        single.new_voice("sin(440)", 0.0, 0).unwrap();
        single.new_voice("sin(220)", 0.0, 0).unwrap();
        let mut sharded = Engine::new(1000);
        sharded.set_worker_count(2);
        sharded.new_voice("sin(440)", 0.0, 0).unwrap();
        sharded.new_voice("sin(220)", 0.0, 0).unwrap();

        let mut l1 = vec![0.0; CHUNK];
        let mut r1 = vec![0.0; CHUNK];
        single.synthesize(CHUNK, &mut l1, &mut r1);
        let mut l2 = vec![0.0; CHUNK];
        let mut r2 = vec![0.0; CHUNK];
        sharded.synthesize(CHUNK, &mut l2, &mut r2);

        for i in 0..CHUNK {
            assert!((l1[i] - l2[i]).abs() < 1e-5);
        }
    }
}
