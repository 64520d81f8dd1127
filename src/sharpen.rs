// sharpen.rs -- Reference pipeline: five-tap sharpen followed by a gamma LUT.
//
// STAGES:
//   lut(i)           = u8(clamp(pow(i / 255, 1.2) * 255, 0, 255))
//   padded(x, y, c)  = input(clamp(x, 0, w-1), clamp(y, 0, h-1), c)
//   padded16         = u16(padded)
//   sharpen(x, y, c) = 2 * padded16(x, y, c)
//                      - (padded16(x-1, y) + padded16(x, y-1)
//                         + padded16(x+1, y) + padded16(x, y+1)) / 4
//   curved(x, y, c)  = lut(sharpen(x, y, c))
//
// Sharpen is computed in u16 and wraps when the neighbours outweigh the
// centre, so the LUT covers the whole u16 range. Entries past 255 saturate
// to 255.
//
// HOST SCHEDULE:
//   - lut at root, computed once per realize
//   - curved loops (outermost first): yo (parallel, strips of 16 rows),
//     yi, x, c (unrolled)
//   - sharpen once per row, vectorized by 8
//   - padded stored per strip and computed per row, so each row only
//     computes the one new padded row it needs
//
// DEVICE SCHEDULE:
//   - lut at root, one work-group per 16 entries
//   - curved in 8x8 tiles: tiles are work-groups, pixels are threads
//   - padded computed per work-group (with its one-pixel apron) by the
//     work-group's threads

use std::sync::Arc;

use tracing::info;

use crate::buffer::Buffer;
use crate::device::EmulatedAccelerator;
use crate::error::Result;
use crate::expr::{cast, clamp, pow, ScalarType, Var};
use crate::graph::{Func, GraphBuilder, InputHandle};
use crate::harness::{diff, time_realize, DiffMode, DiffReport, Timing, TimingConfig, EXIT_MISMATCH};
use crate::pipeline::Pipeline;
use crate::probe::AcceleratorProbe;
use crate::target::{DeviceConfig, Target};

/// The LUT + sharpen pipeline over one RGB (or any channel count) input.
pub struct SharpenCurve {
    pipeline: Pipeline,
    pub input: InputHandle,
    pub lut: Func,
    pub padded: Func,
    pub padded16: Func,
    pub sharpen: Func,
    pub curved: Func,
}

impl SharpenCurve {
    /// Build the stage graph over `input`. Every producer starts inlined.
    pub fn new(input: Buffer<u8>) -> Result<Self> {
        let (w, h) = (input.width() as i32, input.height() as i32);
        let mut g = GraphBuilder::new();
        let input = g.input("input", input)?;

        let (x, y, c, i) = (Var::new("x"), Var::new("y"), Var::new("c"), Var::new("i"));

        let gamma = pow(cast(ScalarType::F32, &i) / 255.0f32, 1.2f32) * 255.0f32;
        let lut = g.stage("lut", &["i"], cast(ScalarType::U8, clamp(gamma, 0.0f32, 255.0f32)))?;

        let padded = g.stage(
            "padded",
            &["x", "y", "c"],
            input.at([clamp(&x, 0, w - 1), clamp(&y, 0, h - 1), c.expr()]),
        )?;

        let padded16 = g.stage(
            "padded16",
            &["x", "y", "c"],
            cast(ScalarType::U16, padded.at([x.expr(), y.expr(), c.expr()])),
        )?;

        let p = |dx: i32, dy: i32| padded16.at([&x + dx, &y + dy, c.expr()]);
        let sharpen = g.stage(
            "sharpen",
            &["x", "y", "c"],
            p(0, 0) * 2 - (p(-1, 0) + p(0, -1) + p(1, 0) + p(0, 1)) / 4,
        )?;

        let curved = g.stage(
            "curved",
            &["x", "y", "c"],
            lut.at([sharpen.at([x.expr(), y.expr(), c.expr()])]),
        )?;

        Ok(SharpenCurve {
            pipeline: Pipeline::new(g.build(), curved),
            input,
            lut,
            padded,
            padded16,
            sharpen,
            curved,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// A host buffer shaped like the input, to realize into.
    pub fn output_buffer(&self) -> Buffer<u8> {
        Buffer::new(
            self.input.width(),
            self.input.height(),
            self.input.channels(),
        )
    }

    pub fn schedule_for_host(&mut self) -> Result<()> {
        self.all_or_nothing(Self::annotate_host)?;
        self.pipeline.set_target(Target::host());
        Ok(())
    }

    /// Device schedule: the LUT as a 1D grid of 16-wide blocks, the output
    /// in 8x8 tiles with the padded input staged per block.
    pub fn schedule_for_device(&mut self, config: &DeviceConfig) -> Result<()> {
        self.all_or_nothing(Self::annotate_device)?;
        self.pipeline
            .set_accelerator(Arc::new(EmulatedAccelerator::new(config.profile)));
        self.pipeline.set_target(Target::for_device(config));
        Ok(())
    }

    /// Run `annotate`; if it fails, put the schedule back as it was.
    fn all_or_nothing(&mut self, annotate: fn(&mut Self) -> Result<()>) -> Result<()> {
        let saved = self.pipeline.schedule_table().clone();
        annotate(self).inspect_err(|_| {
            self.pipeline.replace_schedule(saved);
        })
    }

    fn annotate_host(&mut self) -> Result<()> {
        let channels = self.input.channels() as i64;
        let (curved, p) = (self.curved, &mut self.pipeline);

        p.schedule(self.lut).compute_root();
        p.schedule(curved)
            .reorder(&["c", "x", "y"])?
            .bound("c", 0, channels)?
            .unroll("c")?
            .split("y", "yo", "yi", 16)?
            .parallel("yo")?;
        p.schedule(self.sharpen)
            .compute_at(curved, "yi")
            .vectorize("x", 8)?;
        p.schedule(self.padded)
            .store_at(curved, "yo")
            .compute_at(curved, "yi")
            .vectorize("x", 16)?;
        Ok(())
    }

    fn annotate_device(&mut self) -> Result<()> {
        let channels = self.input.channels() as i64;
        let (curved, p) = (self.curved, &mut self.pipeline);

        p.schedule(self.lut)
            .compute_root()
            .split("i", "block", "thread", 16)?
            .device_blocks(&["block"])?
            .device_threads(&["thread"])?;
        p.schedule(curved)
            .reorder(&["c", "x", "y"])?
            .bound("c", 0, channels)?
            .unroll("c")?
            .device_tile("x", "y", 8, 8)?;
        p.schedule(self.padded)
            .compute_at_device_blocks(curved)
            .device_threads(&["x", "y"])?;
        Ok(())
    }

    /// Realize `curved` into `out`.
    pub fn realize(&mut self, out: &mut Buffer<u8>) -> Result<()> {
        self.pipeline.realize(out)
    }
}

// ---------------------------------------------------------------------------
// The lesson: time host, then device, and compare
// ---------------------------------------------------------------------------

/// Settings for `run_lesson`.
#[derive(Debug, Clone, Copy)]
pub struct LessonConfig {
    pub timing: TimingConfig,
    pub device: DeviceConfig,
    pub diff_mode: DiffMode,
}

impl Default for LessonConfig {
    fn default() -> Self {
        LessonConfig {
            timing: TimingConfig::default(),
            device: DeviceConfig::default(),
            diff_mode: DiffMode::FailFast,
        }
    }
}

/// What `run_lesson` measured.
#[derive(Debug, Clone)]
pub struct LessonOutcome {
    pub host: Timing,
    /// `None` when no accelerator was found.
    pub device: Option<Timing>,
    /// Device output compared against the host output.
    pub report: Option<DiffReport<u8>>,
    /// The host schedule's output.
    pub output: Buffer<u8>,
}

impl LessonOutcome {
    /// 0, or `EXIT_MISMATCH` if the device output differed.
    pub fn exit_code(&self) -> i32 {
        match &self.report {
            Some(r) if !r.passed() => EXIT_MISMATCH,
            _ => 0,
        }
    }
}

/// Time the host schedule. If `probe` finds an accelerator, also time the
/// device schedule and diff its output against the host output.
pub fn run_lesson(
    input: &Buffer<u8>,
    probe: &dyn AcceleratorProbe,
    config: &LessonConfig,
) -> Result<LessonOutcome> {
    let mut host = SharpenCurve::new(input.clone())?;
    host.schedule_for_host()?;
    let mut output = host.output_buffer();
    let host_timing = time_realize(host.pipeline_mut(), &mut output, &config.timing)?;
    info!(timing = %host_timing, "host schedule");

    if !probe.available() {
        info!(probe = probe.name(), "no accelerator, skipping device schedule");
        return Ok(LessonOutcome {
            host: host_timing,
            device: None,
            report: None,
            output,
        });
    }

    let mut device = SharpenCurve::new(input.clone())?;
    device.schedule_for_device(&config.device)?;
    let mut device_out = device.output_buffer();
    let device_timing = time_realize(device.pipeline_mut(), &mut device_out, &config.timing)?;
    info!(timing = %device_timing, probe = probe.name(), "device schedule");

    let report = diff(&device_out, &output, config.diff_mode)?;
    Ok(LessonOutcome {
        host: host_timing,
        device: Some(device_timing),
        report: Some(report),
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gamma(v: u16) -> u8 {
        ((v as f32 / 255.0).powf(1.2) * 255.0).clamp(0.0, 255.0).round() as u8
    }

    #[test]
    fn uniform_input_passes_through_the_curve() {
        let input = Buffer::from_vec(4, 4, 3, vec![128u8; 48]);
        let mut s = SharpenCurve::new(input).unwrap();
        s.schedule_for_host().unwrap();
        let mut out = s.output_buffer();
        s.realize(&mut out).unwrap();
        // 2*128 - 4*128/4 = 128 everywhere.
        assert!(out.as_slice().unwrap().iter().all(|&v| v == gamma(128)));
    }

    #[test]
    fn lut_saturates_above_255() {
        assert_eq!(gamma(255), 255);
        assert_eq!(gamma(0), 0);
        let input = Buffer::from_vec(3, 1, 1, vec![0u8, 255, 0]);
        let mut s = SharpenCurve::new(input).unwrap();
        let mut out = s.output_buffer();
        s.realize(&mut out).unwrap();
        // Middle: 510 - (0 + 255 + 0 + 255) / 4 = 510 - 127 = 383 -> 255.
        assert_eq!(out.at(1, 0, 0).unwrap(), 255);
    }
}
