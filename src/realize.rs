// realize.rs -- Execute a compiled plan into an output buffer.
//
// The executor walks each realized stage's loop nest. At every loop level
// it first produces the stages scheduled there (allocating caches for
// stages stored there), then descends. At the innermost level it evaluates
// the stage body at one point and hands the value to a `Sink`.
//
// Concurrency:
//   - Parallel host loops run their iterations on rayon. Each iteration
//     gets a clone of the environment (cheap: tiles are behind Arc) and a
//     private output tile, which is blitted into the real sink afterwards.
//   - The first device block loop of a stage becomes one accelerator
//     dispatch. Each work-group does the same thing as a parallel
//     iteration, reading inputs from their device copies.
//
// Bounds: before producing a stage, the executor infers the box each
// producer must cover by evaluating the consumer's call arguments over
// interval boxes (see interval.rs). Partial split tiles are guarded: an
// iteration whose point falls outside the region does nothing.
//
// NEW RUST CONCEPTS:
// - `Arc::make_mut` -- copy-on-write access to a shared tile. A cache tile
//   is uniquely owned while it is being filled, so no copy happens.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::buffer::{Element, Side};
use crate::device::{blocks_for, Accelerator, DispatchGrid};
use crate::error::{DeviceError, DomainError, Error, GraphError, Result};
use crate::expr::Expr;
use crate::graph::{InputDef, MAX_RANK};
use crate::interval::{Footprints, Interval};
use crate::lower::{LoweredStage, Plan, VarKind};
use crate::region::{Region, Sink, Tile};
use crate::schedule::ForType;

/// Realized values of every stage in scope, indexed by stage.
type Env = Vec<Option<Arc<Tile>>>;

// ---------------------------------------------------------------------------
// Output sinks
// ---------------------------------------------------------------------------

/// Where the output stage's values go.
pub(crate) enum OutputStore<'b, T: Element> {
    Host(&'b mut [T]),
    Device(&'b mut [u8]),
}

/// Writes output values into a buffer's host or device storage.
pub(crate) struct BufferSink<'b, T: Element> {
    store: OutputStore<'b, T>,
    extents: [usize; 3],
}

impl<'b, T: Element> BufferSink<'b, T> {
    pub(crate) fn new(store: OutputStore<'b, T>, extents: [usize; 3]) -> Self {
        BufferSink { store, extents }
    }

    fn index(&self, coords: &[i64]) -> Option<usize> {
        let mut at = [0i64; 3];
        at[..coords.len()].copy_from_slice(coords);
        let [w, h, c] = self.extents;
        let inside = |v: i64, e: usize| v >= 0 && (v as usize) < e;
        if inside(at[0], w) && inside(at[1], h) && inside(at[2], c) {
            Some(at[0] as usize + w * (at[1] as usize + h * at[2] as usize))
        } else {
            None
        }
    }
}

impl<T: Element> Sink for BufferSink<'_, T> {
    fn put(&mut self, coords: &[i64], value: f64) -> Result<()> {
        let i = self.index(coords).ok_or_else(|| DomainError::OutOfBounds {
            buffer: "output".to_string(),
            coords: coords.to_vec(),
            extents: self.extents.iter().map(|&e| e as i64).collect(),
        })?;
        let v = T::from_scalar(value);
        match &mut self.store {
            OutputStore::Host(host) => host[i] = v,
            OutputStore::Device(bytes) => {
                let size = std::mem::size_of::<T>();
                bytes[i * size..(i + 1) * size].copy_from_slice(bytemuck::bytes_of(&v));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frame: loop counters of one stage
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Frame<'p> {
    stage: usize,
    def: &'p LoweredStage,
    region: Region,
    /// Extent of every nest var.
    extents: Vec<i64>,
    /// Current iteration of every loop level, outermost first.
    counters: Vec<i64>,
    /// Scratch: (lo, hi) offset range of every nest var.
    ranges: Vec<(i64, i64)>,
    /// Scratch: coordinates of the current point.
    coords: Vec<i64>,
}

impl<'p> Frame<'p> {
    fn new(stage: usize, def: &'p LoweredStage, region: Region) -> Self {
        let vars = &def.nest.vars;
        let mut extents = vec![0; vars.len()];
        extents[..def.rank].copy_from_slice(&region.extents[..def.rank]);
        // Children always follow their parent.
        for id in 0..vars.len() {
            if let VarKind::Split { outer, inner, factor } = vars[id].kind {
                extents[outer] = blocks_for(extents[id], factor);
                extents[inner] = factor;
            }
        }
        Frame {
            stage,
            def,
            region,
            extents,
            counters: vec![0; def.nest.loops.len()],
            ranges: vec![(0, 0); vars.len()],
            coords: vec![0; def.rank],
        }
    }

    /// Offset ranges of every var with the outermost `fixed` loops pinned
    /// to their counters. `false` if some var falls outside its extent,
    /// i.e. the iteration is in the guarded tail of a split.
    fn pin(&mut self, fixed: usize) -> bool {
        let def = self.def;
        let vars = &def.nest.vars;
        for id in (0..vars.len()).rev() {
            let (lo, hi) = match vars[id].kind {
                VarKind::Leaf { position } if position < fixed => {
                    let c = self.counters[position];
                    (c, c)
                }
                VarKind::Leaf { .. } => (0, self.extents[id] - 1),
                VarKind::Split { outer, inner, factor } => {
                    let (o, i) = (self.ranges[outer], self.ranges[inner]);
                    (o.0 * factor + i.0, o.1 * factor + i.1)
                }
            };
            let hi = hi.min(self.extents[id] - 1);
            if lo > hi {
                return false;
            }
            self.ranges[id] = (lo, hi);
        }
        true
    }

    /// Box of stage coordinates covered once the outermost `fixed` loops
    /// are pinned, as inclusive ranges.
    fn box_with(&mut self, fixed: usize) -> Option<Vec<(i64, i64)>> {
        if !self.pin(fixed) {
            return None;
        }
        Some(
            (0..self.def.rank)
                .map(|d| {
                    let (lo, hi) = self.ranges[d];
                    (self.region.mins[d] + lo, self.region.mins[d] + hi)
                })
                .collect(),
        )
    }

    /// Fill `coords` with the current point. `false` if it is guarded out.
    fn point(&mut self) -> bool {
        if !self.pin(self.counters.len()) {
            return false;
        }
        for d in 0..self.def.rank {
            self.coords[d] = self.region.mins[d] + self.ranges[d].0;
        }
        true
    }
}

fn to_intervals(bx: &[(i64, i64)]) -> Vec<Interval> {
    bx.iter()
        .map(|&(lo, hi)| Interval::new(lo as f64, hi as f64))
        .collect()
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub(crate) struct Executor<'a> {
    plan: &'a Plan,
    inputs: &'a [InputDef],
    accelerator: Option<&'a dyn Accelerator>,
}

impl<'a> Executor<'a> {
    pub(crate) fn new(
        plan: &'a Plan,
        inputs: &'a [InputDef],
        accelerator: Option<&'a dyn Accelerator>,
    ) -> Self {
        Executor {
            plan,
            inputs,
            accelerator,
        }
    }

    /// Realize the output stage over `[0, extents)` into `sink`.
    pub(crate) fn run_output(&self, sink: &mut dyn Sink, extents: [usize; 3]) -> Result<()> {
        let plan = self.plan;
        let out = plan.output;
        let def = plan.output_stage();
        let rank = def.rank;
        let region = Region::new(
            vec![0; rank],
            extents[..rank.min(3)].iter().map(|&e| e as i64).collect(),
        );
        let out_box = region.to_intervals();
        self.check_bounds(def, &out_box)?;

        // Footprints of everything computed at root, consumers first.
        let mut fp = Footprints::new(plan.slots());
        fp.include(out, &out_box);
        fp.merge(&self.requirements(out, &out_box, 0));
        for &s in plan.root.compute.iter().rev() {
            if let Some(bx) = fp.get(s) {
                let bx = plan.stage(s).apply_bounds(bx);
                let sub = self.requirements(s, &bx, 0);
                fp.merge(&sub);
            }
        }

        let mut env: Env = vec![None; plan.slots()];
        for &s in &plan.root.store {
            if let Some(region) = self.region_for(s, &fp)? {
                env[s] = Some(Arc::new(Tile::new(region)));
            }
        }
        for &s in &plan.root.compute {
            self.compute_stage(s, &fp, &mut env, false)?;
        }

        debug!(stage = %def.name, ?extents, "realizing output");
        self.realize_stage(out, region, &mut env, sink, false)
    }

    /// Footprints of every producer that stage `stage`, evaluated over
    /// `bx`, needs. Stages nested in `stage` at loop level `from` or deeper
    /// contribute their own needs.
    fn requirements(&self, stage: usize, bx: &[Interval], from: usize) -> Footprints {
        let def = self.plan.stage(stage);
        let mut fp = Footprints::new(self.plan.slots());
        fp.collect_calls(&def.body, bx);
        for &(s, level) in &def.nested {
            if level < from {
                continue;
            }
            if let Some(sb) = fp.get(s) {
                let sb = self.plan.stage(s).apply_bounds(sb);
                let sub = self.requirements(s, &sb, 0);
                fp.merge(&sub);
            }
        }
        fp
    }

    fn check_bounds(&self, def: &LoweredStage, required: &[Interval]) -> Result<(), DomainError> {
        for (d, (iv, bound)) in required.iter().zip(&def.bounds).enumerate() {
            let Some(b) = bound else { continue };
            let allowed = Interval::new(b.min as f64, (b.min + b.extent - 1) as f64);
            if iv.is_bounded() && !allowed.contains(iv) {
                return Err(DomainError::BoundViolation {
                    stage: def.name.clone(),
                    var: self.dim_name(def, d),
                    min: b.min,
                    max: b.min + b.extent - 1,
                    required_min: iv.lo as i64,
                    required_max: iv.hi as i64,
                });
            }
        }
        Ok(())
    }

    fn dim_name(&self, def: &LoweredStage, d: usize) -> String {
        def.nest.vars[d].name.clone()
    }

    /// The region stage `s` must cover, or `None` if nothing needs it.
    fn region_for(&self, s: usize, fp: &Footprints) -> Result<Option<Region>> {
        let def = self.plan.stage(s);
        let Some(bx) = fp.get(s) else {
            return Ok(None);
        };
        self.check_bounds(def, bx)?;
        let bx = def.apply_bounds(bx);
        if !bx.iter().all(Interval::is_bounded) {
            return Err(DomainError::UnboundedRegion {
                stage: def.name.clone(),
            }
            .into());
        }
        let ranges: Vec<(i64, i64)> = bx.iter().map(|iv| (iv.lo as i64, iv.hi as i64)).collect();
        Ok(Some(Region::from_ranges(&ranges)))
    }

    /// Compute stage `s` over its footprint and publish it in `env`.
    fn compute_stage(&self, s: usize, fp: &Footprints, env: &mut Env, on_device: bool) -> Result<()> {
        let Some(region) = self.region_for(s, fp)? else {
            return Ok(());
        };
        if self.plan.stage(s).is_cached() {
            let mut cache = env[s]
                .take()
                .unwrap_or_else(|| Arc::new(Tile::new(region.clone())));
            let tile: &mut Tile = Arc::make_mut(&mut cache);
            self.realize_stage(s, region, env, tile, on_device)?;
            env[s] = Some(cache);
        } else {
            let mut tile = Tile::new(region.clone());
            self.realize_stage(s, region, env, &mut tile, on_device)?;
            env[s] = Some(Arc::new(tile));
        }
        Ok(())
    }

    fn realize_stage(
        &self,
        s: usize,
        region: Region,
        env: &mut Env,
        sink: &mut dyn Sink,
        on_device: bool,
    ) -> Result<()> {
        if region.is_empty() {
            return Ok(());
        }
        let mut frame = Frame::new(s, self.plan.stage(s), region);
        self.run(&mut frame, 0, env, sink, on_device)
    }

    /// Produce everything scheduled at `level` of the frame's stage for
    /// the current iteration.
    fn produce_at(&self, frame: &mut Frame<'_>, level: usize, env: &mut Env, on_device: bool) -> Result<()> {
        let def = frame.def;
        let scope = &def.scopes[level];
        if scope.is_empty() {
            return Ok(());
        }
        let Some(bx) = frame.box_with(level + 1) else {
            return Ok(());
        };
        let fp = self.requirements(frame.stage, &to_intervals(&bx), level);
        for &s in &scope.store {
            if let Some(region) = self.region_for(s, &fp)? {
                env[s] = Some(Arc::new(Tile::new(region)));
            }
        }
        for &s in &scope.compute {
            self.compute_stage(s, &fp, env, on_device)?;
        }
        Ok(())
    }

    fn run(
        &self,
        frame: &mut Frame<'_>,
        level: usize,
        env: &mut Env,
        sink: &mut dyn Sink,
        on_device: bool,
    ) -> Result<()> {
        let def = frame.def;
        let loops = &def.nest.loops;
        if level == loops.len() {
            if !frame.point() || sink.holds(&frame.coords) {
                return Ok(());
            }
            let v = self.eval(&def.body, &frame.coords, env, on_device)?;
            return sink.put(&frame.coords, v);
        }

        let lp = loops[level];
        let extent = frame.extents[lp.var];
        match lp.for_type {
            ForType::Parallel if !on_device => self.run_parallel(frame, level, extent, env, sink),
            ForType::DeviceBlock if !on_device => self.dispatch(frame, level, env, sink),
            _ => {
                for i in 0..extent {
                    frame.counters[level] = i;
                    self.enter(frame, level, env, sink, on_device)?;
                }
                Ok(())
            }
        }
    }

    /// One iteration of `level`: produce its scope, then descend.
    fn enter(
        &self,
        frame: &mut Frame<'_>,
        level: usize,
        env: &mut Env,
        sink: &mut dyn Sink,
        on_device: bool,
    ) -> Result<()> {
        if !frame.def.scopes[level].is_empty() {
            self.produce_at(frame, level, env, on_device)?;
        }
        self.run(frame, level + 1, env, sink, on_device)
    }

    fn run_parallel(
        &self,
        frame: &Frame<'_>,
        level: usize,
        extent: i64,
        env: &Env,
        sink: &mut dyn Sink,
    ) -> Result<()> {
        let tiles = (0..extent)
            .into_par_iter()
            .map(|i| -> Result<Option<Tile>> {
                let mut f = frame.clone();
                f.counters[level] = i;
                let Some(bx) = f.box_with(level + 1) else {
                    return Ok(None);
                };
                let mut env = env.clone();
                let mut tile = Tile::new(Region::from_ranges(&bx));
                self.enter(&mut f, level, &mut env, &mut tile, false)?;
                Ok(Some(tile))
            })
            .collect::<Result<Vec<_>>>()?;
        for tile in tiles.iter().flatten() {
            tile.blit(sink)?;
        }
        Ok(())
    }

    /// Turn the block band starting at `level` into one accelerator
    /// dispatch.
    fn dispatch(&self, frame: &Frame<'_>, level: usize, env: &Env, sink: &mut dyn Sink) -> Result<()> {
        let accelerator = self.accelerator.ok_or(DeviceError::NotAttached)?;
        let def = frame.def;
        let loops = &def.nest.loops;
        let band: Vec<usize> = (level..loops.len())
            .take_while(|&l| loops[l].for_type == ForType::DeviceBlock)
            .collect();
        let last = band.last().copied().unwrap_or(level);
        let counts: Vec<i64> = band.iter().map(|&l| frame.extents[loops[l].var]).collect();
        let threads: Vec<u64> = (last + 1..loops.len())
            .take_while(|&l| loops[l].for_type == ForType::DeviceThread)
            .map(|l| frame.extents[loops[l].var] as u64)
            .collect();
        let grid = DispatchGrid {
            blocks: counts.iter().map(|&c| c as u64).collect(),
            threads,
        };

        let kernel = |block: usize| -> Result<Option<Tile>> {
            let mut f = frame.clone();
            // Innermost block loop varies fastest.
            let mut rem = block as i64;
            for (k, &l) in band.iter().enumerate().rev() {
                f.counters[l] = rem % counts[k];
                rem /= counts[k];
            }
            let Some(bx) = f.box_with(last + 1) else {
                return Ok(None);
            };
            let mut env = env.clone();
            let mut tile = Tile::new(Region::from_ranges(&bx));
            for &l in &band {
                self.produce_at(&mut f, l, &mut env, true)?;
            }
            self.run(&mut f, last + 1, &mut env, &mut tile, true)?;
            Ok(Some(tile))
        };

        if self.plan.target.debug {
            info!(stage = %def.name, device = accelerator.name(), %grid, "device dispatch");
        } else {
            debug!(stage = %def.name, device = accelerator.name(), %grid, "device dispatch");
        }
        let tiles = accelerator.dispatch(&grid, &kernel)?;
        for tile in tiles.iter().flatten() {
            tile.blit(sink)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scalar evaluation
    // -----------------------------------------------------------------------

    fn eval(&self, e: &Expr, coords: &[i64], env: &Env, on_device: bool) -> Result<f64> {
        match e {
            Expr::Const { value, .. } => Ok(*value),
            Expr::Dim(i) => Ok(coords[*i] as f64),
            Expr::Var(v) => Err(GraphError::UnboundVar {
                stage: "<plan>".to_string(),
                var: v.clone(),
            }
            .into()),
            Expr::Call { func, args, .. } => {
                let mut at = [0i64; MAX_RANK];
                for (k, a) in args.iter().enumerate() {
                    at[k] = self.eval(a, coords, env, on_device)? as i64;
                }
                let at = &at[..args.len()];
                let name = self
                    .plan
                    .get(*func)
                    .map_or("<unknown>", |s| s.name.as_str());
                match &env[*func] {
                    Some(tile) => tile.get(name, at),
                    None => Err(DomainError::OutOfBounds {
                        buffer: name.to_string(),
                        coords: at.to_vec(),
                        extents: Vec::new(),
                    }
                    .into()),
                }
            }
            Expr::Input { input, args, .. } => {
                let mut at = [0i64; 3];
                for (k, a) in args.iter().enumerate().take(3) {
                    at[k] = self.eval(a, coords, env, on_device)? as i64;
                }
                let side = if on_device { Side::Device } else { Side::Host };
                let def = &self.inputs[*input];
                def.source.load(at[0], at[1], at[2], side).map_err(|err| match err {
                    Error::Domain(DomainError::OutOfBounds { coords, extents, .. }) => {
                        DomainError::OutOfBounds {
                            buffer: def.name.clone(),
                            coords,
                            extents,
                        }
                        .into()
                    }
                    other => other,
                })
            }
            Expr::Cast { ty, value } => {
                let v = self.eval(value, coords, env, on_device)?;
                Ok(ty.cast_from(value.ty(), v))
            }
            Expr::Binary { op, ty, lhs, rhs } => {
                let a = self.eval(lhs, coords, env, on_device)?;
                let b = self.eval(rhs, coords, env, on_device)?;
                Ok(op.apply(*ty, a, b))
            }
            Expr::Clamp { value, lo, hi, .. } => {
                let v = self.eval(value, coords, env, on_device)?;
                let l = self.eval(lo, coords, env, on_device)?;
                let h = self.eval(hi, coords, env, on_device)?;
                Ok(v.max(l).min(h))
            }
        }
    }
}
