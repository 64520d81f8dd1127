// lower.rs -- Compile (graph, schedule, target) into a realization plan.
//
// Steps:
//   1. Collect the stages reachable from the output. Every one of them must
//      have a body.
//   2. Order them topologically (Kahn's algorithm; ties go to the stage
//      declared first).
//   3. Substitute inline stages into their callers. After this, every call
//      left in a body targets a stage that is realized into storage.
//   4. Replay each realized stage's splits into a concrete loop nest.
//   5. Resolve compute and store levels to (consumer, loop index) sites and
//      validate them:
//        - the consumer loop exists and is not inlined
//        - every user of the stage runs inside its compute loop
//        - storage is at or outside the compute loop, in the same consumer
//        - no loop between storage and compute runs its iterations
//          concurrently (that would share a mutable cache between them)
//   6. Validate device loops: blocks then threads, each band contiguous,
//      threads only inside a work-group, and an accelerator on the target.
//   7. Check input reads whose coordinates are statically bounded (e.g. by
//      a clamp) against the input extents.
//
// The result is immutable and shared (Arc) between realizations.

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::{DomainError, GraphError, Result, ScheduleError};
use crate::expr::{Expr, ScalarType};
use crate::graph::{Func, StageDef, StageGraph};
use crate::interval::{bounds_of, Interval};
use crate::schedule::{Bound, ForType, LoopLevel, Schedule, StageSchedule};
use crate::target::Target;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Where a stage is computed or stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Root,
    Inline,
    /// Inside iteration of loop `level` (outermost = 0) of `consumer`.
    At { consumer: usize, level: usize },
}

/// How a realized stage's loop nest executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Serial loops on the calling thread (also used for inlined stages).
    InlineHost,
    /// At least one loop runs its iterations on the rayon pool.
    ParallelHost,
    TiledDeviceDispatch {
        block_vars: Vec<String>,
        thread_vars: Vec<String>,
    },
}

impl Placement {
    pub fn is_device(&self) -> bool {
        matches!(self, Placement::TiledDeviceDispatch { .. })
    }
}

/// How a loop variable's value is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// A loop of its own, at `position` (outermost = 0).
    Leaf { position: usize },
    /// `outer * factor + inner`.
    Split { outer: usize, inner: usize, factor: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestVar {
    pub name: String,
    pub kind: VarKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loop {
    pub var: usize,
    pub for_type: ForType,
}

/// A stage's concrete loop nest.
///
/// Var ids `0..rank` are the stage's dimensions; split children always get
/// larger ids than their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    pub vars: Vec<NestVar>,
    /// Outermost first.
    pub loops: Vec<Loop>,
}

impl LoopNest {
    pub fn loop_name(&self, level: usize) -> &str {
        &self.vars[self.loops[level].var].name
    }

    fn device_levels(&self, ft: ForType) -> Vec<usize> {
        (0..self.loops.len())
            .filter(|&l| self.loops[l].for_type == ft)
            .collect()
    }
}

/// Stages computed or stored at one loop level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// Computed once per iteration, in topological order.
    pub compute: Vec<usize>,
    /// Cache storage allocated once per iteration.
    pub store: Vec<usize>,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.compute.is_empty() && self.store.is_empty()
    }
}

/// One realized stage.
#[derive(Debug, Clone)]
pub struct LoweredStage {
    pub name: String,
    pub rank: usize,
    pub ty: ScalarType,
    /// Body with inline stages substituted.
    pub body: Expr,
    pub compute: Site,
    pub store: Site,
    pub nest: LoopNest,
    pub bounds: Vec<Option<Bound>>,
    pub placement: Placement,
    /// One scope per loop level of this stage.
    pub scopes: Vec<Scope>,
    /// Stages computed inside this stage's loops, as (stage, level), in
    /// reverse topological order.
    pub nested: Vec<(usize, usize)>,
}

impl LoweredStage {
    /// Replace bounded dimensions of `bx` with their declared bound.
    pub fn apply_bounds(&self, bx: &[Interval]) -> Vec<Interval> {
        bx.iter()
            .zip(&self.bounds)
            .map(|(iv, b)| match b {
                Some(b) => Interval::new(b.min as f64, (b.min + b.extent - 1) as f64),
                None => *iv,
            })
            .collect()
    }

    /// True if the store level differs from the compute level, i.e. values
    /// persist across sibling iterations.
    pub fn is_cached(&self) -> bool {
        self.store != self.compute
    }
}

/// A compiled realization plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub output: usize,
    /// Realized stages in topological order (output last).
    pub order: Vec<usize>,
    stages: Vec<Option<LoweredStage>>,
    /// Root-level work, excluding the output itself.
    pub root: Scope,
    pub target: Target,
    pub input_names: Vec<String>,
}

impl Plan {
    /// Number of stage slots (the graph's stage count).
    pub fn slots(&self) -> usize {
        self.stages.len()
    }

    pub fn get(&self, stage: usize) -> Option<&LoweredStage> {
        self.stages.get(stage).and_then(|s| s.as_ref())
    }

    /// # Panics
    /// Panics if `stage` is not realized by this plan.
    pub fn stage(&self, stage: usize) -> &LoweredStage {
        match self.get(stage) {
            Some(s) => s,
            None => panic!("stage #{stage} is not realized by this plan"),
        }
    }

    pub fn output_stage(&self) -> &LoweredStage {
        self.stage(self.output)
    }

    /// True if any stage dispatches to the accelerator.
    pub fn uses_device(&self) -> bool {
        self.order.iter().any(|&s| self.stage(s).placement.is_device())
    }

    /// Placement of a stage by name; `None` if it was inlined away.
    pub fn placement_of(&self, name: &str) -> Option<Placement> {
        self.stages
            .iter()
            .flatten()
            .find(|s| s.name == name)
            .map(|s| s.placement.clone())
    }
}

// ---------------------------------------------------------------------------
// compile
// ---------------------------------------------------------------------------

/// Lower `graph` + `schedule` for `output` on `target`.
pub fn compile(graph: &StageGraph, output: Func, schedule: &Schedule, target: &Target) -> Result<Plan> {
    let defs = graph.stages();
    let n = defs.len();
    let out = output.index();

    let reachable = reach_raw(defs, out)?;
    let order = topo_order(defs, &reachable);

    // Compute levels with defaults applied.
    let levels: Vec<LoopLevel> = (0..n)
        .map(|s| {
            schedule.entry(s).compute.clone().unwrap_or(if s == out {
                LoopLevel::Root
            } else {
                LoopLevel::Inline
            })
        })
        .collect();
    if levels[out] != LoopLevel::Root {
        return Err(ScheduleError::OutputNotRoot(defs[out].name.clone()).into());
    }
    let inline = |s: usize| levels[s] == LoopLevel::Inline;

    // Inline substitution, producers first.
    let mut bodies: Vec<Option<Expr>> = vec![None; n];
    for &s in &order {
        let Some(body) = defs[s].body.as_ref() else {
            return Err(GraphError::Undefined(defs[s].name.clone()).into());
        };
        let resolved = body.rewrite(&mut |e| match e {
            Expr::Call { func, args, .. } if inline(*func) => bodies[*func]
                .as_ref()
                .map(|callee| substitute(callee, args)),
            _ => None,
        });
        bodies[s] = Some(resolved);
    }

    // Stages that still need storage.
    let realized = reach_resolved(&bodies, out);
    let order: Vec<usize> = order.into_iter().filter(|s| realized.contains(s)).collect();

    let mut nests: Vec<Option<LoopNest>> = vec![None; n];
    for &s in &order {
        nests[s] = Some(build_nest(&defs[s].name, schedule.entry(s))?);
    }

    let mut compute = vec![Site::Inline; n];
    let mut store = vec![Site::Inline; n];
    for &s in &order {
        compute[s] = resolve_level(defs, &nests, &realized, &inline, s, &levels[s], "compute")?;
        store[s] = match &schedule.entry(s).store {
            None => compute[s],
            Some(level) => resolve_store(defs, &nests, &realized, &inline, s, level, compute[s])?,
        };
    }

    let users = users_of(&bodies, &order);
    for &s in &order {
        check_users(defs, &nests, &compute, &users, s, n)?;
        check_shared_cache(defs, &nests, compute[s], store[s], s)?;
    }

    let mut placements = vec![Placement::InlineHost; n];
    for &s in &order {
        placements[s] = check_device(defs, &nests, &compute, s, target)?;
    }

    for &s in &order {
        if let Some(body) = &bodies[s] {
            check_input_reads(graph, &defs[s].name, body)?;
        }
    }

    // Scopes.
    let mut scopes: Vec<Vec<Scope>> = nests
        .iter()
        .map(|nest| vec![Scope::default(); nest.as_ref().map_or(0, |n| n.loops.len())])
        .collect();
    let mut nested: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n];
    let mut root = Scope::default();
    for &s in &order {
        match compute[s] {
            Site::At { consumer, level } => scopes[consumer][level].compute.push(s),
            Site::Root if s != out => root.compute.push(s),
            _ => {}
        }
        if store[s] != compute[s] {
            match store[s] {
                Site::At { consumer, level } => scopes[consumer][level].store.push(s),
                Site::Root => root.store.push(s),
                Site::Inline => {}
            }
        }
    }
    for &s in order.iter().rev() {
        if let Site::At { consumer, level } = compute[s] {
            nested[consumer].push((s, level));
        }
    }

    let mut stages: Vec<Option<LoweredStage>> = vec![None; n];
    for &s in &order {
        let (Some(body), Some(nest)) = (bodies[s].take(), nests[s].take()) else {
            continue;
        };
        stages[s] = Some(LoweredStage {
            name: defs[s].name.clone(),
            rank: defs[s].rank(),
            ty: defs[s].ty,
            body,
            compute: compute[s],
            store: store[s],
            nest,
            bounds: schedule.entry(s).bounds.clone(),
            placement: placements[s].clone(),
            scopes: std::mem::take(&mut scopes[s]),
            nested: std::mem::take(&mut nested[s]),
        });
    }

    debug!(
        output = %defs[out].name,
        stages = order.len(),
        inlined = reachable.len() - order.len(),
        target = %target,
        "compiled plan"
    );

    Ok(Plan {
        output: out,
        order,
        stages,
        root,
        target: target.clone(),
        input_names: graph.inputs().iter().map(|i| i.name.clone()).collect(),
    })
}

/// Replace `Dim(i)` in `body` with `args[i]`.
fn substitute(body: &Expr, args: &[Expr]) -> Expr {
    body.rewrite(&mut |e| match e {
        Expr::Dim(i) => args.get(*i).cloned(),
        _ => None,
    })
}

/// Stages reachable from `out` through the as-written bodies.
fn reach_raw(defs: &[StageDef], out: usize) -> Result<BTreeSet<usize>> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![out];
    while let Some(s) = stack.pop() {
        if !seen.insert(s) {
            continue;
        }
        let body = defs[s]
            .body
            .as_ref()
            .ok_or_else(|| GraphError::Undefined(defs[s].name.clone()))?;
        stack.extend(body.callees());
    }
    Ok(seen)
}

fn reach_resolved(bodies: &[Option<Expr>], out: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![out];
    while let Some(s) = stack.pop() {
        if seen.insert(s) {
            if let Some(b) = &bodies[s] {
                stack.extend(b.callees());
            }
        }
    }
    seen
}

/// Kahn's algorithm over `set`; among ready stages the lowest index wins.
fn topo_order(defs: &[StageDef], set: &BTreeSet<usize>) -> Vec<usize> {
    let n = defs.len();
    let mut producers: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &s in set {
        if let Some(b) = &defs[s].body {
            for p in b.callees() {
                producers[s].push(p);
                consumers[p].push(s);
            }
        }
    }
    let mut pending: Vec<usize> = (0..n).map(|s| producers[s].len()).collect();
    let mut ready: BTreeSet<usize> = set.iter().copied().filter(|&s| pending[s] == 0).collect();
    let mut order = Vec::with_capacity(set.len());
    while let Some(s) = ready.pop_first() {
        order.push(s);
        for &c in &consumers[s] {
            pending[c] -= 1;
            if pending[c] == 0 {
                ready.insert(c);
            }
        }
    }
    order
}

fn build_nest(stage: &str, sched: &StageSchedule) -> Result<LoopNest, ScheduleError> {
    let unknown = |var: &str| ScheduleError::UnknownVar {
        stage: stage.to_string(),
        var: var.to_string(),
    };
    let mut names: Vec<String> = sched.dims.clone();
    let mut kinds: Vec<Option<VarKind>> = vec![None; names.len()];
    // Live var name -> id.
    let mut live: Vec<(String, usize)> = names.iter().cloned().zip(0..).collect();

    for split in &sched.splits {
        let at = live
            .iter()
            .position(|(n, _)| *n == split.old)
            .ok_or_else(|| unknown(&split.old))?;
        let (_, id) = live.remove(at);
        let outer = names.len();
        let inner = outer + 1;
        names.push(split.outer.clone());
        names.push(split.inner.clone());
        kinds.push(None);
        kinds.push(None);
        kinds[id] = Some(VarKind::Split {
            outer,
            inner,
            factor: split.factor,
        });
        live.push((split.outer.clone(), outer));
        live.push((split.inner.clone(), inner));
    }

    let mut loops = Vec::with_capacity(sched.loops.len());
    for (position, lv) in sched.loops.iter().rev().enumerate() {
        let id = live
            .iter()
            .find(|(n, _)| *n == lv.name)
            .map(|(_, id)| *id)
            .ok_or_else(|| unknown(&lv.name))?;
        kinds[id] = Some(VarKind::Leaf { position });
        loops.push(Loop {
            var: id,
            for_type: lv.for_type,
        });
    }

    let vars = names
        .into_iter()
        .zip(kinds)
        .map(|(name, kind)| match kind {
            Some(kind) => Ok(NestVar { name, kind }),
            None => Err(unknown(&name)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LoopNest { vars, loops })
}

fn resolve_level(
    defs: &[StageDef],
    nests: &[Option<LoopNest>],
    realized: &BTreeSet<usize>,
    inline: &impl Fn(usize) -> bool,
    stage: usize,
    level: &LoopLevel,
    what: &str,
) -> Result<Site, ScheduleError> {
    let invalid = |reason: String| {
        if what == "store" {
            ScheduleError::InvalidStoreLevel {
                stage: defs[stage].name.clone(),
                reason,
            }
        } else {
            ScheduleError::InvalidComputeLevel {
                stage: defs[stage].name.clone(),
                reason,
            }
        }
    };
    let consumer = match level {
        LoopLevel::Root => return Ok(Site::Root),
        LoopLevel::Inline => return Ok(Site::Inline),
        LoopLevel::At { func, .. } | LoopLevel::DeviceBlocks { func } => *func,
    };
    if consumer == stage {
        return Err(invalid("a stage cannot be nested in its own loops".into()));
    }
    let cname = defs.get(consumer).map_or("<unknown>", |d| d.name.as_str());
    if !realized.contains(&consumer) || inline(consumer) {
        return Err(invalid(format!("`{cname}` is not realized in this pipeline")));
    }
    let Some(nest) = nests[consumer].as_ref() else {
        return Err(invalid(format!("`{cname}` has no loop nest")));
    };
    let level = match level {
        LoopLevel::At { var, .. } => (0..nest.loops.len())
            .find(|&l| nest.loop_name(l) == var)
            .ok_or_else(|| invalid(format!("`{cname}` has no loop `{var}`")))?,
        _ => nest
            .device_levels(ForType::DeviceBlock)
            .last()
            .copied()
            .ok_or_else(|| invalid(format!("`{cname}` has no device block loops")))?,
    };
    Ok(Site::At { consumer, level })
}

fn resolve_store(
    defs: &[StageDef],
    nests: &[Option<LoopNest>],
    realized: &BTreeSet<usize>,
    inline: &impl Fn(usize) -> bool,
    stage: usize,
    level: &LoopLevel,
    compute: Site,
) -> Result<Site, ScheduleError> {
    let invalid = |reason: &str| ScheduleError::InvalidStoreLevel {
        stage: defs[stage].name.clone(),
        reason: reason.to_string(),
    };
    let site = resolve_level(defs, nests, realized, inline, stage, level, "store")?;
    match (site, compute) {
        (Site::Inline, _) => Err(invalid("storage cannot be inlined")),
        (Site::Root, _) => Ok(Site::Root),
        (Site::At { .. }, Site::Root) => Err(invalid("a root stage must be stored at root")),
        (Site::At { consumer: sc, level: sl }, Site::At { consumer: cc, level: cl }) => {
            if sc != cc {
                Err(invalid("store and compute must be in the same consumer"))
            } else if sl > cl {
                Err(invalid("store level is inside the compute level"))
            } else {
                Ok(site)
            }
        }
        (Site::At { .. }, Site::Inline) => Err(invalid("an inlined stage has no storage")),
    }
}

/// `users[p]` = realized stages whose resolved body calls `p`.
fn users_of(bodies: &[Option<Expr>], order: &[usize]) -> Vec<Vec<usize>> {
    let mut users = vec![Vec::new(); bodies.len()];
    for &s in order {
        if let Some(b) = &bodies[s] {
            for p in b.callees() {
                users[p].push(s);
            }
        }
    }
    users
}

/// Every user of a stage computed at (consumer, level) must execute inside
/// that loop.
fn check_users(
    defs: &[StageDef],
    nests: &[Option<LoopNest>],
    compute: &[Site],
    users: &[Vec<usize>],
    stage: usize,
    n: usize,
) -> Result<(), ScheduleError> {
    let Site::At { consumer, level } = compute[stage] else {
        return Ok(());
    };
    let loop_name = nests[consumer]
        .as_ref()
        .map_or("?", |nest| nest.loop_name(level));
    for &user in &users[stage] {
        // Walk up the user's chain of compute sites.
        let mut q = user;
        let mut inside = false;
        for _ in 0..=n {
            if q == consumer {
                inside = true;
                break;
            }
            match compute[q] {
                Site::At { consumer: c, level: l } if c == consumer => {
                    inside = l >= level;
                    break;
                }
                Site::At { consumer: c, .. } => q = c,
                _ => break,
            }
        }
        if !inside {
            return Err(ScheduleError::InvalidComputeLevel {
                stage: defs[stage].name.clone(),
                reason: format!(
                    "`{}` uses it outside the loop over `{}` of `{}`",
                    defs[user].name, loop_name, defs[consumer].name
                ),
            });
        }
    }
    Ok(())
}

/// A cache that outlives a concurrently-executed loop would be written by
/// several iterations at once.
fn check_shared_cache(
    defs: &[StageDef],
    nests: &[Option<LoopNest>],
    compute: Site,
    store: Site,
    stage: usize,
) -> Result<(), ScheduleError> {
    if compute == store {
        return Ok(());
    }
    let Site::At { consumer, level } = compute else {
        return Ok(());
    };
    let first = match store {
        Site::At { level: s, .. } => s + 1,
        _ => 0,
    };
    let Some(nest) = nests[consumer].as_ref() else {
        return Ok(());
    };
    for l in first..=level {
        let ft = nest.loops[l].for_type;
        if ft == ForType::Parallel || ft.is_device() {
            return Err(ScheduleError::SharedAccumulator {
                stage: defs[stage].name.clone(),
                consumer: defs[consumer].name.clone(),
                var: nest.loop_name(l).to_string(),
            });
        }
    }
    Ok(())
}

/// True if `stage` executes inside some consumer's device work-group.
fn in_device_context(nests: &[Option<LoopNest>], compute: &[Site], stage: usize) -> bool {
    let mut s = stage;
    for _ in 0..compute.len() {
        let Site::At { consumer, level } = compute[s] else {
            return false;
        };
        if let Some(nest) = &nests[consumer] {
            if nest.loops[..=level]
                .iter()
                .any(|l| l.for_type == ForType::DeviceBlock)
            {
                return true;
            }
        }
        s = consumer;
    }
    false
}

fn check_device(
    defs: &[StageDef],
    nests: &[Option<LoopNest>],
    compute: &[Site],
    stage: usize,
    target: &Target,
) -> Result<Placement, ScheduleError> {
    let Some(nest) = nests[stage].as_ref() else {
        return Ok(Placement::InlineHost);
    };
    let band = |reason: &str| ScheduleError::DeviceBand {
        stage: defs[stage].name.clone(),
        reason: reason.to_string(),
    };
    let blocks = nest.device_levels(ForType::DeviceBlock);
    let threads = nest.device_levels(ForType::DeviceThread);
    let in_context = in_device_context(nests, compute, stage);

    if blocks.is_empty() && threads.is_empty() {
        let parallel = nest.loops.iter().any(|l| l.for_type == ForType::Parallel);
        return Ok(if parallel {
            Placement::ParallelHost
        } else {
            Placement::InlineHost
        });
    }
    let contiguous = |v: &[usize]| v.windows(2).all(|w| w[1] == w[0] + 1);
    if !contiguous(&blocks) || !contiguous(&threads) {
        return Err(band("device loops must be adjacent"));
    }
    if let (Some(&b), Some(&t)) = (blocks.last(), threads.first()) {
        if b > t {
            return Err(band("block loops must enclose thread loops"));
        }
    }
    if blocks.len() > 3 || threads.len() > 3 {
        return Err(band("at most three block and three thread dimensions"));
    }
    if !blocks.is_empty() && in_context {
        return Err(band("cannot dispatch from inside a work-group"));
    }
    if blocks.is_empty() && !in_context {
        return Err(band("thread loops need an enclosing block loop"));
    }
    let first_device = blocks.first().or(threads.first()).copied().unwrap_or(0);
    if nest.loops[first_device..]
        .iter()
        .any(|l| l.for_type == ForType::Parallel)
    {
        return Err(band("parallel loop inside a device loop"));
    }
    if !target.has_accelerator() {
        return Err(ScheduleError::NoAccelerator {
            stage: defs[stage].name.clone(),
            target: target.to_string(),
        });
    }
    let names = |levels: &[usize]| -> Vec<String> {
        levels.iter().map(|&l| nest.loop_name(l).to_string()).collect()
    };
    Ok(Placement::TiledDeviceDispatch {
        block_vars: names(&blocks),
        thread_vars: names(&threads),
    })
}

/// Reject input reads whose coordinate range is known and falls outside
/// the input. Unbounded reads are checked when they happen.
fn check_input_reads(graph: &StageGraph, stage: &str, body: &Expr) -> Result<(), DomainError> {
    let unbounded = vec![Interval::EVERYTHING; crate::graph::MAX_RANK];
    let mut err = None;
    body.walk(&mut |e| {
        let Expr::Input { input, args, .. } = e else {
            return;
        };
        if err.is_some() {
            return;
        }
        let Some(def) = graph.inputs().get(*input) else {
            return;
        };
        let extents = def.source.extents();
        for (dim, arg) in args.iter().enumerate() {
            let iv = bounds_of(arg, &unbounded);
            let extent = extents.get(dim).copied().unwrap_or(1) as i64;
            if iv.is_bounded() && (iv.lo < 0.0 || iv.hi >= extent as f64) {
                err = Some(DomainError::StaticOutOfBounds {
                    stage: stage.to_string(),
                    input: def.name.clone(),
                    dim,
                    min: iv.lo as i64,
                    max: iv.hi as i64,
                    extent,
                });
                return;
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Var;
    use crate::schedule::StageScheduler;

    fn two_stage() -> (StageGraph, Func, Func) {
        let mut g = crate::graph::GraphBuilder::new();
        let x = Var::new("x");
        let f = g.stage("f", &["x"], &x * 2).unwrap();
        let h = g
            .stage("h", &["x"], f.at([&x - 1]) + f.at([&x + 1]))
            .unwrap();
        (g.build(), f, h)
    }

    #[test]
    fn default_schedule_inlines_producers() {
        let (graph, _, h) = two_stage();
        let sched = Schedule::for_graph(&graph);
        let plan = compile(&graph, h, &sched, &Target::host()).unwrap();
        assert_eq!(plan.order, vec![h.index()]);
        assert!(plan.output_stage().body.callees().is_empty());
    }

    #[test]
    fn root_producer_comes_first() {
        let (graph, f, h) = two_stage();
        let mut sched = Schedule::for_graph(&graph);
        StageScheduler::new("f".into(), sched.entry_mut(f.index())).compute_root();
        let plan = compile(&graph, h, &sched, &Target::host()).unwrap();
        assert_eq!(plan.order, vec![f.index(), h.index()]);
        assert_eq!(plan.root.compute, vec![f.index()]);
        assert_eq!(plan.stage(f.index()).placement, Placement::InlineHost);
    }

    #[test]
    fn parallel_loop_makes_a_parallel_placement() {
        let (graph, f, h) = two_stage();
        let mut sched = Schedule::for_graph(&graph);
        StageScheduler::new("f".into(), sched.entry_mut(f.index()))
            .compute_root()
            .parallel("x")
            .unwrap();
        let plan = compile(&graph, h, &sched, &Target::host()).unwrap();
        assert_eq!(plan.stage(f.index()).placement, Placement::ParallelHost);
        assert_eq!(plan.stage(h.index()).placement, Placement::InlineHost);
    }

    #[test]
    fn compute_at_unknown_loop_fails() {
        let (graph, f, h) = two_stage();
        let mut sched = Schedule::for_graph(&graph);
        StageScheduler::new("f".into(), sched.entry_mut(f.index())).compute_at(h, "q");
        let err = compile(&graph, h, &sched, &Target::host()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Schedule(ScheduleError::InvalidComputeLevel { .. })
        ));
    }

    #[test]
    fn inlined_output_is_rejected() {
        let (graph, _, h) = two_stage();
        let mut sched = Schedule::for_graph(&graph);
        StageScheduler::new("h".into(), sched.entry_mut(h.index())).compute_inline();
        let err = compile(&graph, h, &sched, &Target::host()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Schedule(ScheduleError::OutputNotRoot(_))
        ));
    }

    #[test]
    fn split_nest_records_children() {
        let mut e = StageSchedule::new(&["x".to_string()]);
        StageScheduler::new("f".into(), &mut e)
            .split("x", "xo", "xi", 4)
            .unwrap();
        let nest = build_nest("f", &e).unwrap();
        assert_eq!(
            nest.vars[0].kind,
            VarKind::Split {
                outer: 1,
                inner: 2,
                factor: 4
            }
        );
        assert_eq!(nest.loop_name(0), "xo");
        assert_eq!(nest.loop_name(1), "xi");
    }
}
