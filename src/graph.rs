// graph.rs -- The stage graph: an arena of named, pure stages.
//
// Stages live in a Vec and refer to each other by index (`Func`), never by
// pointer, so the producer/consumer DAG has no cyclic ownership. A name
// table (IndexMap, so iteration follows declaration order) maps the
// builder's string names to handles.
//
// Registration is where structural errors surface:
//   - duplicate names and dimensions
//   - variables that are not dimensions of the stage being defined
//   - calls with the wrong arity or with float coordinates
//   - cycles: `define` walks from every producer the new body references
//     through the already-defined stages, and refuses if it can reach the
//     stage being defined
//
// Input buffers are moved into the graph and type-erased behind `Source`,
// so one graph can mix u8 and f32 inputs.

use std::any::Any;

use indexmap::IndexMap;
use tracing::debug;

use crate::buffer::{Buffer, Element, Residency, Side, TransferStats};
use crate::error::{GraphError, Result};
use crate::expr::{Expr, ScalarType};

/// Maximum number of dimensions a stage can have.
pub const MAX_RANK: usize = 4;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to a stage in a `StageGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Func {
    index: usize,
    ty: ScalarType,
    rank: usize,
}

impl Func {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ty(&self) -> ScalarType {
        self.ty
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// A call to this stage at the given coordinates.
    pub fn at(&self, args: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Call {
            func: self.index,
            ty: self.ty,
            args: args.into_iter().collect(),
        }
    }
}

/// Handle to an input buffer in a `StageGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputHandle {
    index: usize,
    ty: ScalarType,
    extents: [usize; 3],
}

impl InputHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ty(&self) -> ScalarType {
        self.ty
    }

    pub fn width(&self) -> usize {
        self.extents[0]
    }

    pub fn height(&self) -> usize {
        self.extents[1]
    }

    pub fn channels(&self) -> usize {
        self.extents[2]
    }

    /// A read of this buffer at (x, y, c). Coordinates outside the buffer
    /// fail the realization, so reads near an edge should be clamped.
    pub fn at(&self, args: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Input {
            input: self.index,
            ty: self.ty,
            args: args.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handle {
    Func(Func),
    Input(InputHandle),
}

// ---------------------------------------------------------------------------
// Type-erased input sources
// ---------------------------------------------------------------------------

/// A buffer the pipeline reads from, with its element type erased.
pub trait Source: Send + Sync {
    fn scalar_type(&self) -> ScalarType;
    fn extents(&self) -> [usize; 3];
    fn load(&self, x: i64, y: i64, c: i64, side: Side) -> Result<f64>;
    fn ensure_host(&mut self) -> Result<()>;
    fn ensure_device(&mut self) -> Result<()>;
    fn residency(&self) -> Residency;
    fn transfer_stats(&self) -> TransferStats;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Element> Source for Buffer<T> {
    fn scalar_type(&self) -> ScalarType {
        T::TYPE
    }

    fn extents(&self) -> [usize; 3] {
        Buffer::extents(self)
    }

    #[inline]
    fn load(&self, x: i64, y: i64, c: i64, side: Side) -> Result<f64> {
        Buffer::load(self, x, y, c, side)
    }

    fn ensure_host(&mut self) -> Result<()> {
        Buffer::ensure_host(self)
    }

    fn ensure_device(&mut self) -> Result<()> {
        Buffer::ensure_device(self)
    }

    fn residency(&self) -> Residency {
        Buffer::residency(self)
    }

    fn transfer_stats(&self) -> TransferStats {
        Buffer::transfer_stats(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A named input slot.
pub struct InputDef {
    pub name: String,
    pub source: Box<dyn Source>,
}

/// A named stage: its dimensions, declared type and (once defined) body.
///
/// Bodies are stored with `Var` nodes already resolved to positional `Dim`
/// nodes.
#[derive(Debug, Clone)]
pub struct StageDef {
    pub name: String,
    pub dims: Vec<String>,
    pub ty: ScalarType,
    pub body: Option<Expr>,
}

impl StageDef {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incrementally registers inputs and stages.
#[derive(Default)]
pub struct GraphBuilder {
    stages: Vec<StageDef>,
    inputs: Vec<InputDef>,
    names: IndexMap<String, Handle>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim_name(&self, name: &str) -> Result<(), GraphError> {
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Register an input buffer. The graph takes ownership of it.
    pub fn input<T: Element>(
        &mut self,
        name: &str,
        buffer: Buffer<T>,
    ) -> Result<InputHandle, GraphError> {
        self.claim_name(name)?;
        let handle = InputHandle {
            index: self.inputs.len(),
            ty: T::TYPE,
            extents: buffer.extents(),
        };
        self.inputs.push(InputDef {
            name: name.to_string(),
            source: Box::new(buffer),
        });
        self.names.insert(name.to_string(), Handle::Input(handle));
        Ok(handle)
    }

    /// Forward-declare a stage over `dims` producing values of type `ty`.
    pub fn declare(&mut self, name: &str, dims: &[&str], ty: ScalarType) -> Result<Func, GraphError> {
        self.claim_name(name)?;
        if dims.len() > MAX_RANK {
            return Err(GraphError::RankTooLarge {
                stage: name.to_string(),
                rank: dims.len(),
                max: MAX_RANK,
            });
        }
        for (i, d) in dims.iter().enumerate() {
            if dims[..i].contains(d) {
                return Err(GraphError::DuplicateDim {
                    stage: name.to_string(),
                    dim: d.to_string(),
                });
            }
        }
        let func = Func {
            index: self.stages.len(),
            ty,
            rank: dims.len(),
        };
        self.stages.push(StageDef {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            ty,
            body: None,
        });
        self.names.insert(name.to_string(), Handle::Func(func));
        Ok(func)
    }

    /// Attach the body of a declared stage.
    pub fn define(&mut self, func: Func, body: Expr) -> Result<(), GraphError> {
        let stage = self
            .stages
            .get(func.index)
            .ok_or_else(|| GraphError::UnknownHandle {
                stage: "<unknown>".to_string(),
                kind: "stage",
                index: func.index,
            })?;
        let name = stage.name.clone();
        if stage.body.is_some() {
            return Err(GraphError::AlreadyDefined(name));
        }

        let body = self.resolve(&name, &stage.dims, body)?;
        let body = match body {
            Expr::Const {
                value,
                ty,
                literal: true,
            } if ty != stage.ty => Expr::constant(stage.ty.cast_from(ty, value), stage.ty),
            other => other,
        };
        if body.ty() != stage.ty {
            return Err(GraphError::TypeMismatch {
                stage: name,
                declared: stage.ty,
                found: body.ty(),
            });
        }

        self.check_acyclic(func.index, &body)?;
        debug!(stage = %name, "stage defined");
        self.stages[func.index].body = Some(body);
        Ok(())
    }

    /// Declare and define in one step.
    pub fn stage(&mut self, name: &str, dims: &[&str], body: Expr) -> Result<Func, GraphError> {
        let ty = body.ty();
        let func = self.declare(name, dims, ty)?;
        self.define(func, body)?;
        Ok(func)
    }

    /// Look up a stage by name.
    pub fn lookup(&self, name: &str) -> Option<Func> {
        match self.names.get(name) {
            Some(Handle::Func(f)) => Some(*f),
            _ => None,
        }
    }

    /// Look up an input by name.
    pub fn lookup_input(&self, name: &str) -> Option<InputHandle> {
        match self.names.get(name) {
            Some(Handle::Input(h)) => Some(*h),
            _ => None,
        }
    }

    /// Freeze the graph.
    pub fn build(self) -> StageGraph {
        StageGraph {
            stages: self.stages,
            inputs: self.inputs,
        }
    }

    /// Resolve variables to dimension indices and validate calls.
    fn resolve(&self, stage: &str, dims: &[String], body: Expr) -> Result<Expr, GraphError> {
        let mut err = None;
        body.walk(&mut |e| {
            if err.is_some() {
                return;
            }
            err = match e {
                Expr::Var(v) if !dims.contains(v) => Some(GraphError::UnboundVar {
                    stage: stage.to_string(),
                    var: v.clone(),
                }),
                Expr::Call { func, args, .. } => self.check_call(stage, *func, args).err(),
                Expr::Input { input, args, .. } => self.check_input(stage, *input, args).err(),
                _ => None,
            };
        });
        if let Some(e) = err {
            return Err(e);
        }
        Ok(body.rewrite(&mut |e| match e {
            Expr::Var(v) => dims.iter().position(|d| d == v).map(Expr::Dim),
            _ => None,
        }))
    }

    fn check_call(&self, stage: &str, func: usize, args: &[Expr]) -> Result<(), GraphError> {
        let callee = self.stages.get(func).ok_or_else(|| GraphError::UnknownHandle {
            stage: stage.to_string(),
            kind: "stage",
            index: func,
        })?;
        check_coordinates(&callee.name, callee.rank(), args)
    }

    fn check_input(&self, stage: &str, input: usize, args: &[Expr]) -> Result<(), GraphError> {
        let def = self.inputs.get(input).ok_or_else(|| GraphError::UnknownHandle {
            stage: stage.to_string(),
            kind: "input",
            index: input,
        })?;
        check_coordinates(&def.name, 3, args)
    }

    /// Fail if any producer referenced by `body` can already reach `func`.
    fn check_acyclic(&self, func: usize, body: &Expr) -> Result<(), GraphError> {
        for producer in body.callees() {
            let mut stack = vec![producer];
            let mut seen = vec![false; self.stages.len()];
            while let Some(s) = stack.pop() {
                if s == func {
                    return Err(GraphError::Cycle {
                        stage: self.stages[func].name.clone(),
                        through: self.stages[producer].name.clone(),
                    });
                }
                if std::mem::replace(&mut seen[s], true) {
                    continue;
                }
                if let Some(b) = &self.stages[s].body {
                    stack.extend(b.callees());
                }
            }
        }
        Ok(())
    }
}

fn check_coordinates(target: &str, rank: usize, args: &[Expr]) -> Result<(), GraphError> {
    if args.len() != rank {
        return Err(GraphError::Arity {
            target: target.to_string(),
            expected: rank,
            found: args.len(),
        });
    }
    if let Some(a) = args.iter().find(|a| a.ty().is_float()) {
        return Err(GraphError::NonIntegerCoordinate {
            target: target.to_string(),
            ty: a.ty(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Frozen graph
// ---------------------------------------------------------------------------

/// An immutable set of stages plus the inputs they read.
///
/// The only mutable part is the inputs' residency, which realization
/// manages.
pub struct StageGraph {
    stages: Vec<StageDef>,
    inputs: Vec<InputDef>,
}

impl StageGraph {
    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    pub fn stage(&self, func: Func) -> &StageDef {
        &self.stages[func.index]
    }

    pub fn inputs(&self) -> &[InputDef] {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut [InputDef] {
        &mut self.inputs
    }

    pub fn lookup(&self, name: &str) -> Option<Func> {
        self.stages.iter().position(|s| s.name == name).map(|i| Func {
            index: i,
            ty: self.stages[i].ty,
            rank: self.stages[i].rank(),
        })
    }

    /// Typed access to an input buffer.
    pub fn input<T: Element>(&self, handle: InputHandle) -> Option<&Buffer<T>> {
        self.inputs
            .get(handle.index)
            .and_then(|i| i.source.as_any().downcast_ref())
    }

    /// Mutable typed access, e.g. to feed a new frame through the same
    /// pipeline.
    pub fn input_mut<T: Element>(&mut self, handle: InputHandle) -> Option<&mut Buffer<T>> {
        self.inputs
            .get_mut(handle.index)
            .and_then(|i| i.source.as_any_mut().downcast_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::expr::Var;

    #[test]
    fn vars_resolve_to_dims() {
        let mut g = GraphBuilder::new();
        let (x, y) = (Var::new("x"), Var::new("y"));
        let f = g.stage("f", &["x", "y"], &x + y.expr()).unwrap();
        let graph = g.build();
        let body = graph.stage(f).body.clone().unwrap();
        let mut dims = Vec::new();
        body.walk(&mut |e| {
            if let Expr::Dim(i) = e {
                dims.push(*i);
            }
        });
        assert_eq!(dims, vec![0, 1]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut g = GraphBuilder::new();
        let f = g.declare("f", &["x"], ScalarType::I32).unwrap();
        let err = g.define(f, f.at([Var::new("x").expr()])).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn lookup_distinguishes_stages_and_inputs() {
        let mut g = GraphBuilder::new();
        let input = g.input("in", Buffer::<u8>::new(2, 2, 1)).unwrap();
        let f = g.stage("f", &["x"], Expr::from(1)).unwrap();
        assert_eq!(g.lookup("f"), Some(f));
        assert_eq!(g.lookup("in"), None);
        assert_eq!(g.lookup_input("in"), Some(input));
        assert_eq!(input.width(), 2);
    }
}
