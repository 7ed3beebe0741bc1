//! A real-time polyphonic synthesis engine: an expression compiler (§4.1-§4.3), a per-voice
//! tape-driven VM (§4.2), and a mixer that schedules, renders, and mixes many voices at once
//! (§4.4-§4.7).
//!
//! ```text
//! compiler::compile(expr, sample_rate) -> tape::Program
//! mixer::Engine::new_voice(program, delay, tag) -> voice::VoiceId
//! mixer::Engine::synthesize(n, ...) -> audio samples
//! ```

pub mod chunk_alloc;
pub mod compiler;
pub mod constants;
pub mod device_selector;
pub mod dsp;
pub mod error;
pub mod filter;
pub mod hash;
pub mod mixer;
pub mod opcode;
pub mod registry;
pub mod scheduler;
pub mod tape;
pub mod vm;
pub mod voice;
pub mod wave;

pub use compiler::{compile, compile_with_extensions};
pub use error::{CompileDiagnostic, EngineError, EngineResult};
pub use mixer::{Engine, FilterId, OutputFormat};
pub use opcode::{Arity, ExtensionSignature, Opcode};
pub use tape::Program;
pub use voice::{VoiceId, VoiceState};
pub use wave::{Wave, WaveTable};

/// Lists available audio output devices, marking which support 44.1kHz stereo output.
pub fn list_audio_devices() {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();

    println!("Available audio output devices:");
    println!("(Devices marked with \u{2713} support 44.1kHz stereo output)\n");

    let default_device = host.default_output_device();
    let default_name = default_device.as_ref().and_then(|d| d.name().ok()).unwrap_or_default();

    match host.output_devices() {
        Ok(devices) => {
            let mut found_devices = false;

            for device in devices {
                if let Ok(name) = device.name() {
                    found_devices = true;

                    let validation = if let Ok(mut configs) = device.supported_output_configs() {
                        configs.any(|cfg| {
                            cfg.channels() == 2
                                && cfg.min_sample_rate().0 <= 44100
                                && cfg.max_sample_rate().0 >= 44100
                        })
                    } else {
                        false
                    };

                    let validation_mark = if validation { "\u{2713}" } else { "\u{2717}" };
                    let default_mark = if name == default_name { " [DEFAULT]" } else { "" };
                    println!("  {} {}{}", validation_mark, name, default_mark);

                    if !validation {
                        if let Ok(configs) = device.supported_output_configs() {
                            let rates: Vec<_> = configs
                                .filter(|cfg| cfg.channels() == 2)
                                .map(|cfg| format!("{}-{}Hz", cfg.min_sample_rate().0, cfg.max_sample_rate().0))
                                .collect();
                            if !rates.is_empty() {
                                println!("      Supported rates: {}", rates.join(", "));
                            }
                        }
                    }
                }
            }

            if !found_devices {
                println!("  No audio output devices found");
            }
        }
        Err(e) => {
            eprintln!("Error listing audio devices: {}", e);
            std::process::exit(1);
        }
    }

    println!("\nDevice selection will automatically try multiple strategies:");
    println!("  1. Specified device (--output-device)");
    println!("  2. System default device");
    println!("  3. First available device");
    println!("  4. Platform-specific fallbacks");

    if cfg!(target_os = "linux") {
        println!("\nLinux-specific devices that will be tried:");
        println!("  - pulse (PulseAudio)");
        println!("  - default (ALSA default)");
        println!("  - pipewire (PipeWire)");
        println!("  - hw:0,0 (Hardware device)");
    }

    println!();
}
