// tests/test_harness.rs -- Timing and diff on real pipelines.
//
// These run with `cargo test --test test_harness`.
// Small images and a single iteration keep them quick; only counts and
// residency are checked, never wall-clock numbers.

use tilepipe::buffer::{Buffer, Residency};
use tilepipe::error::{DomainError, Error};
use tilepipe::harness::{diff, time_realize, DiffMode, TimingConfig};
use tilepipe::sharpen::SharpenCurve;
use tilepipe::target::DeviceConfig;

fn ramp(w: usize, h: usize) -> Buffer<u8> {
    Buffer::from_fn(w, h, 3, |x, y, c| (x * 11 + y * 5 + c * 60) as u8)
}

const QUICK: TimingConfig = TimingConfig {
    iterations: 2,
    repetitions: 3,
};

// ===== time_realize =====

#[test]
fn host_timing_moves_nothing() {
    let mut s = SharpenCurve::new(ramp(16, 12)).unwrap();
    s.schedule_for_host().unwrap();
    let mut out = s.output_buffer();
    let timing = time_realize(s.pipeline_mut(), &mut out, &QUICK).unwrap();
    assert_eq!(timing.iterations, 2);
    assert_eq!(timing.repetitions, 3);
    assert_eq!(timing.transfers.copies(), 0);
    assert!(timing.per_realize <= timing.best_total);
    assert_eq!(out.residency(), Residency::Host);
}

#[test]
fn device_timing_copies_back_once_per_run() {
    let mut s = SharpenCurve::new(ramp(16, 12)).unwrap();
    s.schedule_for_device(&DeviceConfig::default()).unwrap();
    let mut out = s.output_buffer();
    let timing = time_realize(s.pipeline_mut(), &mut out, &QUICK).unwrap();
    assert_eq!(timing.transfers.to_host, 3);
    assert_eq!(timing.transfers.to_device, 0);
    // Timing always ends with the output readable on the host.
    assert!(out.as_slice().is_ok());
}

#[test]
fn zero_counts_are_treated_as_one() {
    let mut s = SharpenCurve::new(ramp(4, 4)).unwrap();
    let mut out = s.output_buffer();
    let cfg = TimingConfig {
        iterations: 0,
        repetitions: 0,
    };
    let timing = time_realize(s.pipeline_mut(), &mut out, &cfg).unwrap();
    assert_eq!((timing.iterations, timing.repetitions), (1, 1));
    assert!(timing.to_string().ends_with(" milliseconds"));
}

#[test]
fn default_config_is_best_of_three_hundreds() {
    let cfg = TimingConfig::default();
    assert_eq!(cfg.iterations, 100);
    assert_eq!(cfg.repetitions, 3);
}

// ===== diff =====

#[test]
fn timed_outputs_diff_clean() {
    let input = ramp(23, 17);
    let mut host = SharpenCurve::new(input.clone()).unwrap();
    host.schedule_for_host().unwrap();
    let mut device = SharpenCurve::new(input).unwrap();
    device.schedule_for_device(&DeviceConfig::default()).unwrap();

    let mut a = host.output_buffer();
    let mut b = device.output_buffer();
    time_realize(host.pipeline_mut(), &mut a, &QUICK).unwrap();
    time_realize(device.pipeline_mut(), &mut b, &QUICK).unwrap();
    let report = diff(&b, &a, DiffMode::CollectAll).unwrap();
    assert!(report.passed());
    assert_eq!(report.compared, 23 * 17 * 3);
}

#[test]
fn first_mismatch_is_reported_in_scan_order() {
    let reference = ramp(5, 5);
    let mut output = reference.clone();
    output.set(4, 1, 0, 0).unwrap();
    output.set(2, 3, 0, 0).unwrap();
    output.set(0, 0, 2, 1).unwrap();

    let fast = diff(&output, &reference, DiffMode::FailFast).unwrap();
    let m = fast.first().unwrap();
    assert_eq!((m.x, m.y, m.c), (4, 1, 0));
    assert_eq!(fast.mismatches.len(), 1);

    let all = diff(&output, &reference, DiffMode::CollectAll).unwrap();
    assert_eq!(all.mismatches.len(), 3);
    assert_eq!(all.mismatches[2].c, 2);
}

#[test]
fn diff_needs_matching_shapes() {
    let a = ramp(4, 4);
    let b = ramp(4, 5);
    assert!(matches!(
        diff(&a, &b, DiffMode::FailFast),
        Err(Error::Domain(DomainError::ShapeMismatch {
            expected: [4, 5, 3],
            found: [4, 4, 3],
        }))
    ));
}
