// benches/benchmarks.rs -- Host benchmarks for the LUT + sharpen pipeline.
//
// Synthetic input (always runs):
//   cargo bench
//
// With a real RGB PNG:
//   TILEPIPE_IMAGE=/path/to/rgb.png cargo bench
//
// The same pipeline is realized under the default (everything inlined)
// schedule and the tuned host schedule, so the numbers show what the
// schedule alone buys.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use tilepipe::buffer::Buffer;
use tilepipe::io::load_image;
use tilepipe::sharpen::SharpenCurve;

use std::env;

// ============================================================
// Helpers
// ============================================================

/// Textured RGB scene: LCG noise over a diagonal ramp.
fn make_scene(w: usize, h: usize) -> Buffer<u8> {
    let mut rng: u32 = 12345;
    Buffer::from_fn(w, h, 3, |x, y, c| {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        let base = (x * 200 / w + y * 55 / h + c * 20) as u32;
        (base + (rng >> 28)) as u8
    })
}

fn bench_input() -> (String, Buffer<u8>) {
    if let Ok(path) = env::var("TILEPIPE_IMAGE") {
        match load_image(&path) {
            Ok(img) => {
                let label = format!("{}x{}", img.width(), img.height());
                return (label, img);
            }
            Err(e) => eprintln!("TILEPIPE_IMAGE unreadable ({e}), using a synthetic scene"),
        }
    }
    ("640x480".to_string(), make_scene(640, 480))
}

// ============================================================
// Realize: inline vs tuned host schedule
// ============================================================

fn bench_realize(c: &mut Criterion) {
    let (label, img) = bench_input();

    let mut inline = SharpenCurve::new(img.clone()).unwrap();
    let mut tuned = SharpenCurve::new(img).unwrap();
    tuned.schedule_for_host().unwrap();
    let mut out = tuned.output_buffer();

    let mut group = c.benchmark_group("sharpen_curve");
    group.sample_size(10);
    group.bench_function(BenchmarkId::new("inline", &label), |b| {
        b.iter(|| inline.realize(&mut out).unwrap())
    });
    group.bench_function(BenchmarkId::new("host", &label), |b| {
        b.iter(|| tuned.realize(&mut out).unwrap())
    });
    group.finish();
}

// ============================================================
// Compile: graph + schedule -> plan
// ============================================================

fn bench_compile(c: &mut Criterion) {
    let img = make_scene(64, 64);

    let mut group = c.benchmark_group("compile");
    group.bench_function("host_schedule", |b| {
        b.iter(|| {
            let mut s = SharpenCurve::new(img.clone()).unwrap();
            s.schedule_for_host().unwrap();
            s.pipeline_mut().compile().unwrap()
        })
    });
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_realize, bench_compile);
criterion_main!(benches);
