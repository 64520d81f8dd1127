// error.rs -- Error taxonomy for graph building, scheduling and realization.
//
// Structural problems (GraphError, ScheduleError) surface at registration or
// compile time, before anything executes. DomainError covers coordinates
// that fall outside a buffer or a declared bound; those are caught
// statically when the coordinate transform is a known clamp, otherwise the
// realize call fails. ResidencyError and DeviceError cover the host/device
// boundary.
//
// Pixel mismatches between backends are NOT errors. The harness reports
// them as values (see harness::DiffReport).

use thiserror::Error;

use crate::expr::ScalarType;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Umbrella error returned by pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Residency(#[from] ResidencyError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("image i/o failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Errors raised while registering stages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("name `{0}` is already registered")]
    DuplicateName(String),

    #[error("stage `{0}` is already defined")]
    AlreadyDefined(String),

    #[error("stage `{stage}` lists dimension `{dim}` twice")]
    DuplicateDim { stage: String, dim: String },

    #[error("stage `{stage}` has rank {rank}; at most {max} dimensions are supported")]
    RankTooLarge { stage: String, rank: usize, max: usize },

    #[error("stage `{stage}` uses variable `{var}` which is not one of its dimensions")]
    UnboundVar { stage: String, var: String },

    #[error("stage `{stage}` references unknown {kind} #{index}")]
    UnknownHandle {
        stage: String,
        kind: &'static str,
        index: usize,
    },

    #[error("defining `{stage}` would close a cycle through `{through}`")]
    Cycle { stage: String, through: String },

    #[error("stage `{0}` is declared but never defined")]
    Undefined(String),

    #[error("`{target}` takes {expected} coordinates, got {found}")]
    Arity {
        target: String,
        expected: usize,
        found: usize,
    },

    #[error("stage `{stage}` is declared {declared} but its definition is {found}")]
    TypeMismatch {
        stage: String,
        declared: ScalarType,
        found: ScalarType,
    },

    #[error("coordinate passed to `{target}` has non-integer type {ty}")]
    NonIntegerCoordinate { target: String, ty: ScalarType },
}

/// Errors raised by invalid schedules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("stage `{stage}` has no loop variable `{var}`")]
    UnknownVar { stage: String, var: String },

    #[error("stage `{stage}` already has a loop variable named `{var}`")]
    DuplicateVar { stage: String, var: String },

    #[error("stage `{stage}`: factor for `{var}` must be positive, got {factor}")]
    InvalidFactor {
        stage: String,
        var: String,
        factor: i64,
    },

    #[error("stage `{stage}`: bound on `{var}` needs a positive extent, got {extent}")]
    InvalidBound {
        stage: String,
        var: String,
        extent: i64,
    },

    #[error("stage `{stage}`: cannot unroll `{var}` without a static extent (add a bound or split it first)")]
    UnboundedUnroll { stage: String, var: String },

    #[error("stage `{stage}`: `{var}` is already {existing}; it cannot also be {requested}")]
    ConflictingAnnotation {
        stage: String,
        var: String,
        existing: String,
        requested: String,
    },

    #[error("stage `{stage}`: invalid compute level ({reason})")]
    InvalidComputeLevel { stage: String, reason: String },

    #[error("stage `{stage}`: invalid store level ({reason})")]
    InvalidStoreLevel { stage: String, reason: String },

    #[error("stage `{stage}` caches values across `{var}` of `{consumer}`, whose iterations run concurrently")]
    SharedAccumulator {
        stage: String,
        consumer: String,
        var: String,
    },

    #[error("stage `{stage}`: device loops are malformed ({reason})")]
    DeviceBand { stage: String, reason: String },

    #[error("stage `{stage}` is bound to device loops but target `{target}` has no accelerator feature")]
    NoAccelerator { stage: String, target: String },

    #[error("output stage `{0}` must be computed at root")]
    OutputNotRoot(String),
}

/// Coordinates outside a buffer or a declared bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("access to `{buffer}` at {coords:?} is outside extents {extents:?}")]
    OutOfBounds {
        buffer: String,
        coords: Vec<i64>,
        extents: Vec<i64>,
    },

    #[error("stage `{stage}` reads input `{input}` dimension {dim} over [{min}, {max}], outside [0, {extent})")]
    StaticOutOfBounds {
        stage: String,
        input: String,
        dim: usize,
        min: i64,
        max: i64,
        extent: i64,
    },

    #[error("stage `{stage}` is required over an unbounded region; add a clamp or a bound")]
    UnboundedRegion { stage: String },

    #[error("stage `{stage}`: `{var}` is bounded to [{min}, {max}] but [{required_min}, {required_max}] is required")]
    BoundViolation {
        stage: String,
        var: String,
        min: i64,
        max: i64,
        required_min: i64,
        required_max: i64,
    },

    #[error("stage `{stage}` has rank {expected}, output buffer has rank {found}")]
    RankMismatch {
        stage: String,
        expected: usize,
        found: usize,
    },

    #[error("stage `{stage}` produces {expected}, output buffer holds {found}")]
    ElementType {
        stage: String,
        expected: ScalarType,
        found: ScalarType,
    },

    #[error("buffer extents {found:?} do not match {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("cannot encode a buffer with {0} channels")]
    ChannelCount(usize),
}

/// Host/device residency violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResidencyError {
    #[error("host copy is stale; call ensure_host() first")]
    HostStale,

    #[error("device copy is missing or stale; call ensure_device() first")]
    DeviceStale,
}

/// Errors from the accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("plan needs an accelerator but none is attached")]
    NotAttached,

    #[error("work-group of {total} threads exceeds the profile limit of {max}")]
    WorkgroupTooLarge { total: u64, max: u64 },
}
