// pipeline.rs -- A stage graph plus its schedule, target and compiled plan.
//
// Lifecycle:
//   new(graph, output)        default schedule, host target
//   schedule(func)...         annotate; drops any compiled plan
//   set_target / set_accelerator
//   realize(&mut out)         compiles lazily, then runs the plan
//
// The plan is kept behind an Arc and reused by every realize until the
// schedule or target changes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer::{Buffer, Element};
use crate::device::{Accelerator, EmulatedAccelerator};
use crate::error::{DeviceError, DomainError, Result};
use crate::graph::{Func, InputHandle, StageGraph};
use crate::lower::{compile, Plan};
use crate::realize::{BufferSink, Executor, OutputStore};
use crate::schedule::{Schedule, StageScheduler};
use crate::target::Target;

pub struct Pipeline {
    graph: StageGraph,
    output: Func,
    schedule: Schedule,
    target: Target,
    accelerator: Option<Arc<dyn Accelerator>>,
    plan: Option<Arc<Plan>>,
}

impl Pipeline {
    /// A pipeline realizing `output`, with the default schedule (every
    /// producer inlined) on the host target.
    pub fn new(graph: StageGraph, output: Func) -> Self {
        let schedule = Schedule::for_graph(&graph);
        Pipeline {
            graph,
            output,
            schedule,
            target: Target::host(),
            accelerator: None,
            plan: None,
        }
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn output(&self) -> Func {
        self.output
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn schedule_table(&self) -> &Schedule {
        &self.schedule
    }

    /// Swap in a whole schedule table, returning the previous one.
    pub fn replace_schedule(&mut self, schedule: Schedule) -> Schedule {
        self.plan = None;
        std::mem::replace(&mut self.schedule, schedule)
    }

    /// The compiled plan, if `compile` or `realize` ran since the last
    /// schedule change.
    pub fn plan(&self) -> Option<&Arc<Plan>> {
        self.plan.as_ref()
    }

    /// Change the target. A target with an accelerator feature gets an
    /// `EmulatedAccelerator` unless one was attached already.
    pub fn set_target(&mut self, target: Target) {
        if target.has_accelerator() && self.accelerator.is_none() {
            self.accelerator = Some(Arc::new(EmulatedAccelerator::default()));
        }
        self.target = target;
        self.plan = None;
    }

    pub fn set_accelerator(&mut self, accelerator: Arc<dyn Accelerator>) {
        self.accelerator = Some(accelerator);
    }

    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accelerator.as_ref()
    }

    /// Start annotating `func`.
    ///
    /// # Panics
    /// Panics if `func` does not belong to this pipeline's graph.
    pub fn schedule(&mut self, func: Func) -> StageScheduler<'_> {
        self.plan = None;
        let name = self.graph.stage(func).name.clone();
        StageScheduler::new(name, self.schedule.entry_mut(func.index()))
    }

    /// Compile (or return the cached) plan.
    pub fn compile(&mut self) -> Result<Arc<Plan>> {
        if let Some(plan) = &self.plan {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(compile(&self.graph, self.output, &self.schedule, &self.target)?);
        self.plan = Some(Arc::clone(&plan));
        Ok(plan)
    }

    /// Realize the output stage into `out`, which supplies the region
    /// `[0, width) x [0, height) x [0, channels)`.
    ///
    /// A host-placed output leaves `out` host-resident. A device-placed
    /// output leaves it device-resident; call `ensure_host` to read it.
    pub fn realize<T: Element>(&mut self, out: &mut Buffer<T>) -> Result<()> {
        let plan = self.compile()?;
        let def = plan.output_stage();
        if def.ty != T::TYPE {
            return Err(DomainError::ElementType {
                stage: def.name.clone(),
                expected: def.ty,
                found: T::TYPE,
            }
            .into());
        }
        let extents = out.extents();
        if def.rank > 3 || extents[def.rank..].iter().any(|&e| e != 1) {
            let found = 3 - extents.iter().rev().take_while(|&&e| e == 1).count();
            return Err(DomainError::RankMismatch {
                stage: def.name.clone(),
                expected: def.rank,
                found,
            }
            .into());
        }

        let verbose = plan.target.debug;
        for input in self.graph.inputs_mut() {
            input.source.ensure_host()?;
            if plan.uses_device() {
                let before = input.source.transfer_stats();
                input.source.ensure_device()?;
                let moved = input.source.transfer_stats().since(&before);
                if moved.copies() > 0 {
                    if verbose {
                        info!(input = %input.name, %moved, "copied input to device");
                    } else {
                        debug!(input = %input.name, %moved, "copied input to device");
                    }
                }
            }
        }
        if plan.uses_device() && self.accelerator.is_none() {
            return Err(DeviceError::NotAttached.into());
        }

        let exec = Executor::new(&plan, self.graph.inputs(), self.accelerator.as_deref());
        if def.placement.is_device() {
            out.prepare_device_write();
            let bytes = out.device_bytes_mut()?;
            let mut sink = BufferSink::<T>::new(OutputStore::Device(bytes), extents);
            exec.run_output(&mut sink, extents)?;
        } else {
            let mut sink = BufferSink::new(OutputStore::Host(out.host_mut()), extents);
            exec.run_output(&mut sink, extents)?;
        }
        Ok(())
    }

    /// Allocate a host buffer of the given extents and realize into it.
    pub fn realize_new<T: Element>(
        &mut self,
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<Buffer<T>> {
        let mut out = Buffer::new(width, height, channels);
        self.realize(&mut out)?;
        out.ensure_host()?;
        Ok(out)
    }

    pub fn input<T: Element>(&self, handle: InputHandle) -> Option<&Buffer<T>> {
        self.graph.input(handle)
    }

    /// Replace or edit an input between realizations.
    pub fn input_mut<T: Element>(&mut self, handle: InputHandle) -> Option<&mut Buffer<T>> {
        self.graph.input_mut(handle)
    }
}
