//! Tape-synthesis audio engine CLI.
//!
//! Opens an audio output device, starts one voice playing a source expression given on the
//! command line (or a short demo tone if none is given), and streams `Engine::synthesize` output
//! to it until interrupted.

use clap::Parser;
use tapesynth_engine::constants::{
    DEFAULT_AUDIO_PRIORITY, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_ACTIVE, DEFAULT_MAX_VOICES,
    DEFAULT_SAMPLE_RATE,
};
use tapesynth_engine::device_selector::{DeviceSelector, SelectionResult};
use tapesynth_engine::{Engine, OutputFormat};
use thread_priority::{ThreadPriority, ThreadPriorityValue, set_current_thread_priority};

/// High-performance realtime audio engine for live coding and performance.
#[derive(Parser)]
#[command(name = "tapesynth")]
#[command(about = "Realtime polyphonic tape-synthesis audio engine")]
struct Args {
    /// Audio sample rate in Hz
    #[arg(short, long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,

    /// Audio buffer size per channel
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Maximum number of simultaneous voices
    #[arg(short, long, default_value_t = DEFAULT_MAX_VOICES)]
    max_voices: usize,

    /// Maximum number of concurrently active voices
    #[arg(long, default_value_t = DEFAULT_MAX_ACTIVE)]
    max_active: usize,

    /// Specific audio output device name
    #[arg(long)]
    output_device: Option<String>,

    /// Audio thread priority (0-99, higher = more priority, 0 = disable)
    #[arg(long, default_value_t = DEFAULT_AUDIO_PRIORITY)]
    audio_priority: u8,

    /// Expression source to play on startup
    #[arg(long, default_value = "sin(440) * 0.2")]
    source: String,

    /// List available audio output devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn print_banner(sample_rate: u32, buffer_size: usize, max_voices: usize, max_active: usize) {
    println!("\n");
    println!(" ▗▄▄▖▄▄▄  ▗▖▗▞▀▜▌    Sample rate: {}", sample_rate);
    println!("▐▌  █   █ ▐▌▝▚▄▟▌    Buffer size: {}", buffer_size);
    println!("▐▌  ▀▄▄▄▀ ▐▛▀▚▖      Voices: {} (active {})", max_voices, max_active);
    println!("▝▚▄▄▖     ▐▙▄▞▘");
    println!("\n");
}

/// Maps the user-facing 0-99 priority knob to each platform's native thread-priority range.
fn map_to_platform_priority(user_priority: u8) -> u8 {
    let user_priority = user_priority.min(99);

    #[cfg(target_os = "macos")]
    {
        let min_priority = 15u8;
        let max_priority = 47u8;
        let range = max_priority - min_priority;
        min_priority + ((user_priority as u16 * range as u16) / 99) as u8
    }

    #[cfg(target_os = "linux")]
    {
        user_priority.max(1)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        user_priority
    }
}

fn apply_audio_priority(audio_priority: u8) {
    if audio_priority == 0 {
        log::info!("audio thread real-time priority disabled (priority = 0)");
        return;
    }
    let platform_priority = map_to_platform_priority(audio_priority);
    match ThreadPriorityValue::try_from(platform_priority) {
        Ok(priority_value) => {
            let priority = ThreadPriority::Crossplatform(priority_value);
            match set_current_thread_priority(priority) {
                Ok(()) => log::info!(
                    "audio thread priority set to {audio_priority} (platform: {platform_priority})"
                ),
                Err(e) => log::warn!("failed to set audio thread priority: {e}"),
            }
        }
        Err(e) => log::warn!("invalid priority value {platform_priority}: {e}"),
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        tapesynth_engine::list_audio_devices();
        return;
    }

    print_banner(args.sample_rate, args.buffer_size, args.max_voices, args.max_active);

    let mut engine = Engine::with_capacity(args.sample_rate, args.max_voices, args.max_active);
    engine.set_format(OutputFormat::F32Stereo);

    match engine.new_voice(&args.source, 0.0, 0) {
        Ok(id) => log::info!("voice {id} started: {}", args.source),
        Err(e) => {
            eprintln!("failed to compile source '{}': {e}", args.source);
            std::process::exit(1);
        }
    }

    apply_audio_priority(args.audio_priority);

    use cpal::StreamConfig;
    use cpal::traits::{DeviceTrait, StreamTrait};

    let selector = DeviceSelector::new(args.sample_rate);
    let device_info = match selector.select_output_device(args.output_device) {
        SelectionResult::Success(info) => {
            log::info!("selected audio device: {}{}", info.name, if info.is_default { " (default)" } else { "" });
            info
        }
        SelectionResult::Fallback(info, reason) => {
            log::warn!("audio device fallback: {reason}");
            info
        }
        SelectionResult::Error(err) => {
            eprintln!("failed to select audio device: {err}");
            std::process::exit(1);
        }
    };

    let device = device_info.device;
    let config = StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(args.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(args.buffer_size as u32),
    };

    let mut left = vec![0.0f32; args.buffer_size];
    let mut right = vec![0.0f32; args.buffer_size];

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / 2).min(left.len());
                engine.synthesize(frames, &mut left[..frames], &mut right[..frames]);
                data.fill(0.0);
                for i in 0..frames {
                    data[i * 2] = left[i];
                    data[i * 2 + 1] = right[i];
                }
            },
            move |err| log::error!("audio stream error: {err}"),
            None,
        )
        .expect("failed to build audio stream");

    stream.play().expect("failed to start audio stream");
    println!("Ready \u{2713}  (ctrl-c to stop)");

    loop {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
}
