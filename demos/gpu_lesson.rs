// demos/gpu_lesson.rs
//
// Time the LUT + sharpen pipeline on the host, then (if an accelerator is
// found) on the device, and check that both schedules agree.
//
// Usage:
//   cargo run --example gpu_lesson --release -- [input.png] [output.png]
//
// Without an input path a synthetic 256x256 RGB image is used.
// TILEPIPE_ITERATIONS / TILEPIPE_REPETITIONS override the timing loop
// (default 100 x 3). RUST_LOG=debug shows plan and dispatch logs.
//
// Exit status is -1 (255 on most shells) if the device output differs
// from the host output.

use tilepipe::buffer::Buffer;
use tilepipe::harness::{DiffMode, TimingConfig};
use tilepipe::io::{load_image, save_image};
use tilepipe::probe::WgpuProbe;
use tilepipe::sharpen::{run_lesson, LessonConfig};
use tilepipe::target::DeviceConfig;

use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn synthetic_rgb(w: usize, h: usize) -> Buffer<u8> {
    let mut rng: u32 = 0x5eed;
    Buffer::from_fn(w, h, 3, |_, _, _| {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        (rng >> 24) as u8
    })
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();
    let input = match args.get(1) {
        Some(path) => match load_image(path) {
            Ok(img) => img,
            Err(e) => {
                eprintln!("Error: cannot load {path}: {e}");
                std::process::exit(1);
            }
        },
        None => synthetic_rgb(256, 256),
    };
    println!(
        "Input: {}x{}x{}",
        input.width(),
        input.height(),
        input.channels()
    );

    let config = LessonConfig {
        timing: TimingConfig::from_env(),
        device: DeviceConfig::default(),
        diff_mode: DiffMode::FailFast,
    };
    let outcome = match run_lesson(&input, &WgpuProbe::default(), &config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("Testing performance on CPU:");
    println!("{}", outcome.host);
    match &outcome.device {
        Some(timing) => {
            println!("Testing performance on GPU:");
            println!("{timing}");
        }
        None => println!("Not testing performance on GPU, because I can't find the opencl library"),
    }

    if let Some(m) = outcome.report.as_ref().and_then(|r| r.first()) {
        println!("{m}");
    }

    if let Some(path) = args.get(2) {
        if let Err(e) = save_image(&outcome.output, path) {
            eprintln!("Error: cannot save {path}: {e}");
            std::process::exit(1);
        }
        println!("Wrote {path}");
    }

    std::process::exit(outcome.exit_code());
}
