//! PCM sample playback data, loaded from disk on first reference by a compiled `wave()` call.
//!
//! A missing wave is not a hard error: `WaveTable::get` returns `None` and the `wave`/`wave_loop`
//! opcodes treat that as silence, matching the rest of the engine's "silent no-op over panic"
//! posture for anything that is merely missing content rather than a malformed program.

use crate::constants::DEFAULT_SAMPLE_DIR;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Host-supplied fallback invoked when a name isn't found on disk or in the cache (§6
/// `set_wave_handler`), e.g. to stream samples in from a database or network source.
pub type WaveHandler = Box<dyn Fn(&str) -> Option<Wave> + Send + Sync>;

pub struct Wave {
    pub name: String,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl Wave {
    pub fn frames(&self) -> usize {
        self.samples.len()
    }

    /// Sample at `phase`, a fraction of the wave's own duration (matches the VM's
    /// `phase * wave.sample_rate` index mapping). `None` once the index runs past the end.
    #[inline]
    pub fn sample_at(&self, phase: f32) -> Option<f32> {
        let index = (phase * self.sample_rate as f32) as usize;
        self.samples.get(index).copied()
    }
}

/// Lazily loads and caches wave data referenced by name from compiled tapes.
pub struct WaveTable {
    root: PathBuf,
    target_sample_rate: u32,
    cache: DashMap<String, Arc<Wave>>,
    handler: Mutex<Option<WaveHandler>>,
}

impl WaveTable {
    pub fn new(target_sample_rate: u32) -> Self {
        Self {
            root: PathBuf::from(DEFAULT_SAMPLE_DIR),
            target_sample_rate,
            cache: DashMap::new(),
            handler: Mutex::new(None),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>, target_sample_rate: u32) -> Self {
        Self {
            root: root.into(),
            target_sample_rate,
            cache: DashMap::new(),
            handler: Mutex::new(None),
        }
    }

    /// Resolve a wave by name, loading and caching it from `<root>/<name>.wav` on first use,
    /// falling back to the host handler (`set_wave_handler`) if the file isn't found. Returns
    /// `None` if nothing resolves it — the caller's opcode treats that as silence, never a
    /// compile or runtime error.
    pub fn get(&self, name: &str) -> Option<Arc<Wave>> {
        if let Some(wave) = self.cache.get(name) {
            return Some(wave.clone());
        }

        let path = self.root.join(format!("{name}.wav"));
        let wave = match load_wav(&path, name, self.target_sample_rate) {
            Some(wave) => wave,
            None => {
                let handler = self.handler.lock().unwrap();
                handler.as_ref()?(name)?
            }
        };
        let wave = Arc::new(wave);
        self.cache.insert(name.to_string(), wave.clone());
        Some(wave)
    }

    /// Explicitly register wave data (e.g. supplied by a host embedding this engine rather than
    /// loaded from disk), bypassing the lazy file lookup entirely.
    pub fn insert(&self, name: impl Into<String>, wave: Wave) {
        self.cache.insert(name.into(), Arc::new(wave));
    }

    /// Install the fallback invoked when a wave isn't found on disk or in the cache (§6
    /// `set_wave_handler`).
    pub fn set_handler(&self, handler: WaveHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Eagerly decode and cache a wave from an arbitrary path, independent of this table's root
    /// directory (§6 `load_wave`). Returns `false` if the file can't be opened or decoded.
    pub fn load_file(&self, path: &Path, name: &str) -> bool {
        match load_wav(path, name, self.target_sample_rate) {
            Some(wave) => {
                self.insert(name.to_string(), wave);
                true
            }
            None => false,
        }
    }
}

fn load_wav(path: &Path, name: &str, target_sample_rate: u32) -> Option<Wave> {
    let mut reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return None;
    }

    let mut interleaved = Vec::new();
    match spec.sample_format {
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                interleaved.push(sample.ok()?);
            }
        }
        hound::SampleFormat::Int => match spec.bits_per_sample {
            8 => {
                for sample in reader.samples::<i8>() {
                    interleaved.push(sample.ok()? as f32 / 128.0);
                }
            }
            16 => {
                for sample in reader.samples::<i16>() {
                    interleaved.push(sample.ok()? as f32 / 32768.0);
                }
            }
            24 | 32 => {
                let divisor = if spec.bits_per_sample == 24 { 8_388_608.0 } else { 2_147_483_648.0 };
                for sample in reader.samples::<i32>() {
                    interleaved.push(sample.ok()? as f32 / divisor);
                }
            }
            _ => return None,
        },
    }

    let mono = downmix_to_mono(&interleaved, spec.channels);
    let mono = if spec.sample_rate == target_sample_rate {
        mono
    } else {
        resample_linear(&mono, spec.sample_rate, target_sample_rate)
    };

    Some(Wave {
        name: name.to_string(),
        sample_rate: target_sample_rate,
        samples: mono,
    })
}

fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    let channels = channels as usize;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = to_rate as f32 / from_rate as f32;
    let frames_out = (samples.len() as f32 * ratio) as usize;
    let mut output = Vec::with_capacity(frames_out);
    for i in 0..frames_out {
        let src = i as f32 / ratio;
        let idx = src.floor() as usize;
        let frac = src - idx as f32;
        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        output.push(a + (b - a) * frac);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_wave_is_none_not_error() {
        let table = WaveTable::with_root("/nonexistent/path/for/tests", 44100);
        assert!(table.get("does_not_exist").is_none());
    }

    #[test]
    fn inserted_wave_is_retrievable() {
        let table = WaveTable::with_root("/nonexistent", 44100);
        table.insert("tone", Wave { name: "tone".into(), sample_rate: 44100, samples: vec![0.0, 1.0, 0.0, -1.0] });
        let wave = table.get("tone").unwrap();
        assert_eq!(wave.frames(), 4);
    }

    #[test]
    fn handler_is_consulted_after_disk_and_cache_miss() {
        let table = WaveTable::with_root("/nonexistent/path/for/tests", 44100);
        table.set_handler(Box::new(|name| {
            Some(Wave { name: name.to_string(), sample_rate: 44100, samples: vec![0.25] })
        }));
        let wave = table.get("synthetic").unwrap();
        assert_eq!(wave.samples, vec![0.25]);
    }

    #[test]
    fn sample_at_end_of_wave_is_none() {
        let wave = Wave { name: "x".into(), sample_rate: 4, samples: vec![0.0, 1.0, 0.0, -1.0] };
        assert!(wave.sample_at(1.0).is_none());
        assert!(wave.sample_at(0.0).is_some());
    }
}
