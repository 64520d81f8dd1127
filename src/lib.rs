// tilepipe: image pipelines with separate algorithm and schedule
//
// Stages are pure functions over integer coordinates. Where and how they
// are computed (inlined, at root, per tile of a consumer, in parallel, on
// an accelerator) is a separate annotation that never changes the result.
//
// Reference: Ragan-Kelley et al. -- "Halide: A Language and Compiler for
// Optimizing Parallelism, Locality, and Recomputation in Image Processing
// Pipelines" (PLDI 2013)

pub mod error;
pub mod expr;
pub mod interval;
pub mod region;
pub mod buffer;
pub mod graph;
pub mod schedule;
pub mod target;
pub mod device;
pub mod lower;
mod realize;
pub mod pipeline;
pub mod harness;
pub mod probe;
pub mod io;
pub mod sharpen;

pub use buffer::{Buffer, Element, Residency, TransferStats};
pub use error::{Error, Result};
pub use expr::{cast, clamp, max, min, pow, Expr, ScalarType, Var};
pub use graph::{Func, GraphBuilder, InputHandle, StageGraph};
pub use pipeline::Pipeline;
pub use target::{AcceleratorApi, DeviceConfig, Target};
