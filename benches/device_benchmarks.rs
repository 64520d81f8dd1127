// benches/device_benchmarks.rs -- Host vs device schedule, side by side.
//
//   cargo bench --bench device_benchmarks
//
// The device schedule runs on the emulated accelerator, so these numbers
// measure the dispatch path (work-group decomposition, residency
// transfers, copy-back) rather than real GPU throughput. Each iteration
// ends with the output on the host, as the lesson harness times it.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use tilepipe::buffer::Buffer;
use tilepipe::device::DeviceProfile;
use tilepipe::sharpen::SharpenCurve;
use tilepipe::target::DeviceConfig;

// ============================================================
// Shared helpers
// ============================================================

fn make_scene(w: usize, h: usize) -> Buffer<u8> {
    let mut rng: u32 = 777;
    Buffer::from_fn(w, h, 3, |_, _, _| {
        rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
        (rng >> 24) as u8
    })
}

// ============================================================
// Sharpen + curve: host vs device
// ============================================================

fn bench_sharpen_curve(c: &mut Criterion) {
    let img = make_scene(640, 480);

    let mut host = SharpenCurve::new(img.clone()).unwrap();
    host.schedule_for_host().unwrap();
    let mut host_out = host.output_buffer();

    let mut group = c.benchmark_group("sharpen_curve_device");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(10);

    group.bench_function("host_640x480", |b| {
        b.iter(|| host.realize(&mut host_out).unwrap())
    });

    for profile in [DeviceProfile::Native, DeviceProfile::Embedded] {
        let config = DeviceConfig {
            profile,
            ..DeviceConfig::default()
        };
        let mut device = SharpenCurve::new(img.clone()).unwrap();
        device.schedule_for_device(&config).unwrap();
        let mut out = device.output_buffer();
        group.bench_function(BenchmarkId::new("device_640x480", format!("{profile:?}")), |b| {
            b.iter(|| {
                device.realize(&mut out).unwrap();
                out.ensure_host().unwrap();
            })
        });
    }
    group.finish();
}

// ============================================================
// Register
// ============================================================

criterion_group!(benches, bench_sharpen_curve);
criterion_main!(benches);
