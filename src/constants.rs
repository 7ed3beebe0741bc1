//! Centralized constants for the tape-synthesis audio engine.
//! Contains only the constants that are actually used throughout the codebase.

// Audio processing constants
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
/// Per-call VM execution granularity (spec: CHUNK, typically 128).
pub const CHUNK: usize = 128;
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

// Tape / program limits
pub const MAX_COMMANDS: usize = 128;
pub const MAX_ARGS: usize = 8;

// Chunk allocator - fixed-size aligned sample buffers grouped into bitmap pages
pub const PAGE_SIZE: usize = 28;
pub const CHUNK_ALIGN: usize = 16;

// Voice and engine limits
pub const DEFAULT_MAX_VOICES: usize = 128;
pub const DEFAULT_MAX_ACTIVE: usize = 64;
/// Worker threads clamped to this count; one doubles as the host thread for shard 0.
pub const MAX_WORKER_THREADS: usize = 4;

// Voice lifetime
/// Minimum time a voice must have been released before it is eligible for silent-tail reaping.
pub const RELEASE_MIN_SECONDS: f32 = 2.0;
pub const RELEASE_TIMEOUT_SECONDS: f32 = 30.0;
/// `(silence_max - silence_min)` below this, after `RELEASE_MIN_SECONDS`, marks a voice silent.
pub const SILENCE_THRESHOLD: f32 = 0.001;
pub const SILENCE_DECAY: f32 = 0.001;

// Oscillators / sample playback
pub const MIDDLE_C_HZ: f32 = 261.625565;

// Deterministic noise LCG (matches the reference source exactly for reproducibility)
pub const NOISE_LCG_MULTIPLIER: i64 = 853;
pub const NOISE_LCG_MODULUS: i64 = 981287;
pub const DEFAULT_NOISE_SEED: i64 = 1996;

// Parameter-name hash
pub const HASH_MAX_CHARS: usize = 10;

// Network and OSC constants are not used: OSC is an out-of-scope front end.

// Thread priority constants - used in main.rs
pub const DEFAULT_AUDIO_PRIORITY: u8 = 80;

// Sample library constants - used in main.rs and wave.rs
pub const DEFAULT_SAMPLE_DIR: &str = "./samples";

// Pratt parser binding powers (compiler/parser.rs)
pub const BP_ADDITIVE: i32 = 50;
pub const BP_PREFIX: i32 = 70;
pub const BP_MULTIPLICATIVE: i32 = 60;
pub const BP_POWER: i32 = 70;
pub const BP_CALL: i32 = 80;
