// harness.rs -- Timing and output comparison.
//
// Timing follows the usual best-of-N protocol:
//   1. one warm-up realize (compiles the plan, warms caches and the pool)
//   2. `repetitions` runs of `iterations` back-to-back realizes
//   3. report the fastest run divided by `iterations`
// The output is brought back to the host before each clock stop, so device
// timings include the copy-back, as a caller would see it.
//
// `diff` compares two buffers in channel, row, column order.

use std::env;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::{Buffer, Element, TransferStats};
use crate::error::{DomainError, Result};
use crate::pipeline::Pipeline;

/// Exit code for a host/device mismatch.
pub const EXIT_MISMATCH: i32 = -1;

/// How many realizes to time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Back-to-back realizes per timed run.
    pub iterations: u32,
    /// Timed runs; the fastest one is reported.
    pub repetitions: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            iterations: 100,
            repetitions: 3,
        }
    }
}

impl TimingConfig {
    /// Defaults, overridden by `TILEPIPE_ITERATIONS` and
    /// `TILEPIPE_REPETITIONS` when they parse as positive integers.
    pub fn from_env() -> Self {
        let read = |key: &str, fallback: u32| {
            env::var(key)
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|&n| n > 0)
                .unwrap_or(fallback)
        };
        let d = TimingConfig::default();
        TimingConfig {
            iterations: read("TILEPIPE_ITERATIONS", d.iterations),
            repetitions: read("TILEPIPE_REPETITIONS", d.repetitions),
        }
    }
}

/// Result of `time_realize`.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Best run divided by the iteration count.
    pub per_realize: Duration,
    /// The best run in full.
    pub best_total: Duration,
    pub iterations: u32,
    pub repetitions: u32,
    /// Transfers of the output buffer during the timed runs.
    pub transfers: TransferStats,
}

impl Timing {
    pub fn millis(&self) -> f64 {
        self.per_realize.as_secs_f64() * 1e3
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} milliseconds", self.millis())
    }
}

/// Time `pipeline` realizing into `output`.
pub fn time_realize<T: Element>(
    pipeline: &mut Pipeline,
    output: &mut Buffer<T>,
    cfg: &TimingConfig,
) -> Result<Timing> {
    let iterations = cfg.iterations.max(1);
    let repetitions = cfg.repetitions.max(1);

    pipeline.realize(output)?;
    output.ensure_host()?;

    let before = output.transfer_stats();
    let mut best = Duration::MAX;
    for _ in 0..repetitions {
        let start = Instant::now();
        for _ in 0..iterations {
            pipeline.realize(output)?;
        }
        output.ensure_host()?;
        best = best.min(start.elapsed());
    }

    let timing = Timing {
        per_realize: best / iterations,
        best_total: best,
        iterations,
        repetitions,
        transfers: output.transfer_stats().since(&before),
    };
    debug!(%timing, iterations, repetitions, transfers = %timing.transfers, "timed realize");
    Ok(timing)
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Stop at the first mismatch.
    FailFast,
    /// Record every mismatch.
    CollectAll,
}

/// One differing element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch<T> {
    pub x: usize,
    pub y: usize,
    pub c: usize,
    pub actual: T,
    pub expected: T,
}

impl<T: fmt::Display> fmt::Display for Mismatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mismatch between output ({}) and reference output ({}) at {}, {}, {}",
            self.actual, self.expected, self.x, self.y, self.c
        )
    }
}

#[derive(Debug, Clone)]
pub struct DiffReport<T> {
    pub mismatches: Vec<Mismatch<T>>,
    /// Elements compared before stopping.
    pub compared: usize,
    pub mode: DiffMode,
}

impl<T> DiffReport<T> {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn first(&self) -> Option<&Mismatch<T>> {
        self.mismatches.first()
    }
}

/// Compare `output` against `reference`. Both must be host-resident and
/// have the same extents.
pub fn diff<T: Element>(
    output: &Buffer<T>,
    reference: &Buffer<T>,
    mode: DiffMode,
) -> Result<DiffReport<T>> {
    if output.extents() != reference.extents() {
        return Err(DomainError::ShapeMismatch {
            expected: reference.extents(),
            found: output.extents(),
        }
        .into());
    }
    let (actual, expected) = (output.as_slice()?, reference.as_slice()?);
    let [w, h, channels] = output.extents();

    let mut report = DiffReport {
        mismatches: Vec::new(),
        compared: 0,
        mode,
    };
    for c in 0..channels {
        for y in 0..h {
            for x in 0..w {
                let i = x + w * (y + h * c);
                report.compared += 1;
                if actual[i] != expected[i] {
                    report.mismatches.push(Mismatch {
                        x,
                        y,
                        c,
                        actual: actual[i],
                        expected: expected[i],
                    });
                    if mode == DiffMode::FailFast {
                        return Ok(report);
                    }
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_prints_four_decimals() {
        let t = Timing {
            per_realize: Duration::from_micros(1500),
            best_total: Duration::from_micros(1500),
            iterations: 1,
            repetitions: 1,
            transfers: TransferStats::default(),
        };
        assert_eq!(t.to_string(), "1.5000 milliseconds");
    }

    #[test]
    fn mismatch_message() {
        let m = Mismatch {
            x: 3,
            y: 4,
            c: 1,
            actual: 10u8,
            expected: 12u8,
        };
        assert_eq!(
            m.to_string(),
            "Mismatch between output (10) and reference output (12) at 3, 4, 1"
        );
    }

    #[test]
    fn diff_modes() {
        let a = Buffer::<u8>::from_vec(2, 1, 2, vec![1, 2, 3, 4]);
        let b = Buffer::<u8>::from_vec(2, 1, 2, vec![1, 0, 3, 0]);

        let fast = diff(&a, &b, DiffMode::FailFast).unwrap();
        assert_eq!(fast.mismatches.len(), 1);
        assert_eq!(fast.compared, 2);

        let all = diff(&a, &b, DiffMode::CollectAll).unwrap();
        assert_eq!(all.mismatches.len(), 2);
        assert_eq!(all.compared, 4);
        let last = all.mismatches[1];
        assert_eq!((last.x, last.y, last.c), (1, 0, 1));
    }

    #[test]
    fn diff_rejects_shape_mismatch() {
        let a = Buffer::<u8>::new(2, 2, 1);
        let b = Buffer::<u8>::new(2, 1, 1);
        assert!(diff(&a, &b, DiffMode::FailFast).is_err());
    }
}
