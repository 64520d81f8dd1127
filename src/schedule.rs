// schedule.rs -- Per-stage scheduling annotations.
//
// A schedule never changes what a stage computes, only when and how. It is
// kept in a side table indexed by stage, separate from the (immutable)
// graph, so rescheduling is cheap and cannot corrupt a definition.
//
// Each stage's entry records:
//   - compute level: inline, root, or once per iteration of a consumer loop
//   - store level:   where storage lives, if further out than compute
//   - splits:        var -> (outer, inner) by a factor, replayed in order
//   - loops:         current loop vars, innermost first, with a ForType
//   - bounds:        static (min, extent) declarations on stage dims
//
// ANNOTATION FAMILIES:
//   Host:   Parallel, Vectorized, Unrolled
//   Device: DeviceBlock, DeviceThread
// Re-annotating a var replaces its previous annotation within a family.
// Asking for a var to be both (e.g. parallel and a device block) is a
// ScheduleError::ConflictingAnnotation.
//
// Checks that need the whole graph (compute levels naming real consumer
// loops, device band shape, shared accumulators) happen in lower.rs.

use std::fmt;

use crate::error::ScheduleError;
use crate::graph::{Func, StageGraph};

// ---------------------------------------------------------------------------
// Annotation types
// ---------------------------------------------------------------------------

/// How a loop executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForType {
    Serial,
    Parallel,
    Vectorized(u32),
    Unrolled(u32),
    DeviceBlock,
    DeviceThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Neutral,
    Host,
    Device,
}

impl ForType {
    fn family(self) -> Family {
        match self {
            ForType::Serial => Family::Neutral,
            ForType::Parallel | ForType::Vectorized(_) | ForType::Unrolled(_) => Family::Host,
            ForType::DeviceBlock | ForType::DeviceThread => Family::Device,
        }
    }

    pub fn is_device(self) -> bool {
        self.family() == Family::Device
    }
}

impl fmt::Display for ForType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForType::Serial => write!(f, "serial"),
            ForType::Parallel => write!(f, "parallel"),
            ForType::Vectorized(w) => write!(f, "vectorized({w})"),
            ForType::Unrolled(n) => write!(f, "unrolled({n})"),
            ForType::DeviceBlock => write!(f, "a device block"),
            ForType::DeviceThread => write!(f, "a device thread"),
        }
    }
}

/// Where a stage is computed or stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopLevel {
    /// Substituted into every use site.
    Inline,
    /// Realized in full before the output's loop nest starts.
    Root,
    /// Once per iteration of `var` in `func`'s loop nest.
    At { func: usize, var: String },
    /// Once per device work-group of `func` (its innermost block loop).
    DeviceBlocks { func: usize },
}

impl LoopLevel {
    pub fn at(consumer: Func, var: &str) -> Self {
        LoopLevel::At {
            func: consumer.index(),
            var: var.to_string(),
        }
    }

    pub fn device_blocks(consumer: Func) -> Self {
        LoopLevel::DeviceBlocks {
            func: consumer.index(),
        }
    }
}

/// One split: `old` becomes `outer * factor + inner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub old: String,
    pub outer: String,
    pub inner: String,
    pub factor: i64,
}

/// A current loop variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopVar {
    pub name: String,
    pub for_type: ForType,
}

/// A static `[min, min + extent)` declaration on a stage dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub min: i64,
    pub extent: i64,
}

/// All annotations for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSchedule {
    pub dims: Vec<String>,
    /// `None` means the default: root for the output, inline otherwise.
    pub compute: Option<LoopLevel>,
    pub store: Option<LoopLevel>,
    pub splits: Vec<Split>,
    /// Innermost first.
    pub loops: Vec<LoopVar>,
    /// One slot per dimension.
    pub bounds: Vec<Option<Bound>>,
}

impl StageSchedule {
    pub fn new(dims: &[String]) -> Self {
        StageSchedule {
            dims: dims.to_vec(),
            compute: None,
            store: None,
            splits: Vec::new(),
            loops: dims
                .iter()
                .map(|d| LoopVar {
                    name: d.clone(),
                    for_type: ForType::Serial,
                })
                .collect(),
            bounds: vec![None; dims.len()],
        }
    }

    fn position(&self, var: &str) -> Option<usize> {
        self.loops.iter().position(|l| l.name == var)
    }

    /// Static extent of a loop var: a split's inner factor, or the bound of
    /// a dimension that was never split.
    pub fn static_extent(&self, var: &str) -> Option<i64> {
        for s in self.splits.iter().rev() {
            if s.inner == var {
                return Some(s.factor);
            }
            if s.outer == var || s.old == var {
                return None;
            }
        }
        let d = self.dims.iter().position(|d| d == var)?;
        self.bounds[d].map(|b| b.extent)
    }
}

/// The side table: one `StageSchedule` per stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    entries: Vec<StageSchedule>,
}

impl Schedule {
    /// Default schedule: everything inline, the output at root.
    pub fn for_graph(graph: &StageGraph) -> Self {
        Schedule {
            entries: graph
                .stages()
                .iter()
                .map(|s| StageSchedule::new(&s.dims))
                .collect(),
        }
    }

    pub fn entry(&self, stage: usize) -> &StageSchedule {
        &self.entries[stage]
    }

    pub fn entry_mut(&mut self, stage: usize) -> &mut StageSchedule {
        &mut self.entries[stage]
    }
}

// ---------------------------------------------------------------------------
// StageScheduler: the chaining API
// ---------------------------------------------------------------------------

/// Annotates one stage. Obtained from `Pipeline::schedule`.
///
/// Every method returns `&mut Self` so calls chain with `?`:
///
/// ```ignore
/// p.schedule(curved)
///     .reorder(&["c", "x", "y"])?
///     .bound("c", 0, 3)?
///     .unroll("c")?;
/// ```
pub struct StageScheduler<'a> {
    stage: String,
    entry: &'a mut StageSchedule,
}

impl<'a> StageScheduler<'a> {
    pub(crate) fn new(stage: String, entry: &'a mut StageSchedule) -> Self {
        StageScheduler { stage, entry }
    }

    fn unknown(&self, var: &str) -> ScheduleError {
        ScheduleError::UnknownVar {
            stage: self.stage.clone(),
            var: var.to_string(),
        }
    }

    fn find(&self, var: &str) -> Result<usize, ScheduleError> {
        self.entry.position(var).ok_or_else(|| self.unknown(var))
    }

    fn annotate(&mut self, var: &str, ft: ForType) -> Result<&mut Self, ScheduleError> {
        let i = self.find(var)?;
        let existing = self.entry.loops[i].for_type;
        let (a, b) = (existing.family(), ft.family());
        if a != Family::Neutral && b != Family::Neutral && a != b {
            return Err(ScheduleError::ConflictingAnnotation {
                stage: self.stage.clone(),
                var: var.to_string(),
                existing: existing.to_string(),
                requested: ft.to_string(),
            });
        }
        self.entry.loops[i].for_type = ft;
        Ok(self)
    }

    // --- Granularity ---

    pub fn compute_root(&mut self) -> &mut Self {
        self.entry.compute = Some(LoopLevel::Root);
        self
    }

    pub fn compute_inline(&mut self) -> &mut Self {
        self.entry.compute = Some(LoopLevel::Inline);
        self
    }

    /// Recompute once per iteration of `var` in `consumer`'s loop nest.
    pub fn compute_at(&mut self, consumer: Func, var: &str) -> &mut Self {
        self.entry.compute = Some(LoopLevel::at(consumer, var));
        self
    }

    /// Recompute once per device work-group of `consumer`.
    pub fn compute_at_device_blocks(&mut self, consumer: Func) -> &mut Self {
        self.entry.compute = Some(LoopLevel::device_blocks(consumer));
        self
    }

    pub fn store_root(&mut self) -> &mut Self {
        self.entry.store = Some(LoopLevel::Root);
        self
    }

    /// Keep storage across iterations nested inside `var` of `consumer`,
    /// so values computed by one iteration are reused by its siblings.
    pub fn store_at(&mut self, consumer: Func, var: &str) -> &mut Self {
        self.entry.store = Some(LoopLevel::at(consumer, var));
        self
    }

    // --- Loop structure ---

    /// Split `old` into `outer * factor + inner`. `outer` may reuse the
    /// name `old`. A trailing partial tile is guarded, never read past.
    pub fn split(
        &mut self,
        old: &str,
        outer: &str,
        inner: &str,
        factor: i64,
    ) -> Result<&mut Self, ScheduleError> {
        if factor <= 0 {
            return Err(ScheduleError::InvalidFactor {
                stage: self.stage.clone(),
                var: old.to_string(),
                factor,
            });
        }
        let i = self.find(old)?;
        for name in [outer, inner] {
            let clash = (name != old && self.entry.position(name).is_some()) || outer == inner;
            if clash {
                return Err(ScheduleError::DuplicateVar {
                    stage: self.stage.clone(),
                    var: name.to_string(),
                });
            }
        }
        let moved = self.entry.loops[i].for_type;
        self.entry.loops[i] = LoopVar {
            name: inner.to_string(),
            for_type: ForType::Serial,
        };
        self.entry.loops.insert(
            i + 1,
            LoopVar {
                name: outer.to_string(),
                for_type: moved,
            },
        );
        self.entry.splits.push(Split {
            old: old.to_string(),
            outer: outer.to_string(),
            inner: inner.to_string(),
            factor,
        });
        Ok(self)
    }

    /// Reorder loops. `vars` is innermost first; the listed vars trade
    /// places among the positions they currently occupy.
    pub fn reorder(&mut self, vars: &[&str]) -> Result<&mut Self, ScheduleError> {
        let mut positions = Vec::with_capacity(vars.len());
        for (k, v) in vars.iter().enumerate() {
            if vars[..k].contains(v) {
                return Err(ScheduleError::DuplicateVar {
                    stage: self.stage.clone(),
                    var: v.to_string(),
                });
            }
            positions.push(self.find(v)?);
        }
        let picked: Vec<LoopVar> = positions.iter().map(|&p| self.entry.loops[p].clone()).collect();
        positions.sort_unstable();
        for (slot, lv) in positions.into_iter().zip(picked) {
            self.entry.loops[slot] = lv;
        }
        Ok(self)
    }

    /// Split both `x` and `y`, then order `xi, yi, xo, yo` (innermost first).
    #[allow(clippy::too_many_arguments)]
    pub fn tile(
        &mut self,
        x: &str,
        y: &str,
        xo: &str,
        yo: &str,
        xi: &str,
        yi: &str,
        fx: i64,
        fy: i64,
    ) -> Result<&mut Self, ScheduleError> {
        self.split(x, xo, xi, fx)?
            .split(y, yo, yi, fy)?
            .reorder(&[xi, yi, xo, yo])
    }

    /// Declare that dimension `dim` only ever spans `[min, min + extent)`.
    pub fn bound(&mut self, dim: &str, min: i64, extent: i64) -> Result<&mut Self, ScheduleError> {
        let d = self
            .entry
            .dims
            .iter()
            .position(|n| n == dim)
            .ok_or_else(|| self.unknown(dim))?;
        if extent <= 0 {
            return Err(ScheduleError::InvalidBound {
                stage: self.stage.clone(),
                var: dim.to_string(),
                extent,
            });
        }
        self.entry.bounds[d] = Some(Bound { min, extent });
        Ok(self)
    }

    // --- Loop annotations ---

    pub fn parallel(&mut self, var: &str) -> Result<&mut Self, ScheduleError> {
        self.annotate(var, ForType::Parallel)
    }

    /// Split `var` by `width` (the inner loop is named `{var}.v`) and mark
    /// the inner loop vectorized.
    pub fn vectorize(&mut self, var: &str, width: u32) -> Result<&mut Self, ScheduleError> {
        let i = self.find(var)?;
        if self.entry.loops[i].for_type.is_device() {
            return Err(ScheduleError::ConflictingAnnotation {
                stage: self.stage.clone(),
                var: var.to_string(),
                existing: self.entry.loops[i].for_type.to_string(),
                requested: ForType::Vectorized(width).to_string(),
            });
        }
        let inner = format!("{var}.v");
        self.split(var, var, &inner, width as i64)?
            .annotate(&inner, ForType::Vectorized(width))
    }

    /// Fully unroll `var`. Its extent must be known statically, either from
    /// a `bound` or because it is the inner var of a split.
    pub fn unroll(&mut self, var: &str) -> Result<&mut Self, ScheduleError> {
        self.find(var)?;
        let n = self
            .entry
            .static_extent(var)
            .ok_or_else(|| ScheduleError::UnboundedUnroll {
                stage: self.stage.clone(),
                var: var.to_string(),
            })?;
        self.annotate(var, ForType::Unrolled(n as u32))
    }

    /// Map `vars` onto device work-group indices.
    pub fn device_blocks(&mut self, vars: &[&str]) -> Result<&mut Self, ScheduleError> {
        for v in vars {
            self.annotate(v, ForType::DeviceBlock)?;
        }
        Ok(self)
    }

    /// Map `vars` onto thread indices within a work-group.
    pub fn device_threads(&mut self, vars: &[&str]) -> Result<&mut Self, ScheduleError> {
        for v in vars {
            self.annotate(v, ForType::DeviceThread)?;
        }
        Ok(self)
    }

    /// Tile `x`, `y` by `fx` x `fy`: tiles become work-groups, points in a
    /// tile become threads. New vars are `{x}_block`, `{x}_thread`, etc.
    pub fn device_tile(&mut self, x: &str, y: &str, fx: i64, fy: i64) -> Result<&mut Self, ScheduleError> {
        let (xb, yb) = (format!("{x}_block"), format!("{y}_block"));
        let (xt, yt) = (format!("{x}_thread"), format!("{y}_thread"));
        self.tile(x, y, &xb, &yb, &xt, &yt, fx, fy)?
            .device_threads(&[xt.as_str(), yt.as_str()])?
            .device_blocks(&[xb.as_str(), yb.as_str()])
    }
}
