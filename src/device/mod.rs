// device/mod.rs -- Accelerator abstraction for device-bound loops.
//
// Responsibilities:
//   - `Accelerator`: the seam the executor dispatches work-groups through.
//     One kernel invocation per block index; threads of a block run inside
//     that invocation. Blocks are independent, so an accelerator may run
//     them in any order and on any number of workers.
//   - `DispatchGrid`: block counts and threads-per-block of one dispatch,
//     validated against a `DeviceProfile`.
//   - `DeviceProfile`: hardware limits to enforce. `Embedded` caps
//     work-groups at 256 threads, so schedules that would fail on a small
//     GPU fail on the development machine too.
//
// NEW RUST CONCEPTS:
// - `dyn Fn(usize) -> R + Sync` -- a borrowed closure that may be called
//   from several threads at once.

mod emulated;

pub use emulated::EmulatedAccelerator;

use std::fmt;

use crate::error::{DeviceError, Result};
use crate::region::Tile;

/// Hardware profile controlling work-group limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Desktop-class limits.
    Native,
    /// Small embedded GPU limits.
    Embedded,
}

impl DeviceProfile {
    /// Maximum threads in one work-group.
    pub fn max_threads_per_block(self) -> u64 {
        match self {
            DeviceProfile::Native => 1024,
            DeviceProfile::Embedded => 256,
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Embedded => write!(f, "Embedded (256 threads per block)"),
        }
    }
}

/// Shape of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchGrid {
    /// Block counts, outermost first.
    pub blocks: Vec<u64>,
    /// Thread extents within a block, outermost first.
    pub threads: Vec<u64>,
}

impl DispatchGrid {
    pub fn total_blocks(&self) -> u64 {
        self.blocks.iter().product()
    }

    pub fn threads_per_block(&self) -> u64 {
        self.threads.iter().product()
    }

    /// Check the grid against `profile`'s limits.
    pub fn validate(&self, profile: DeviceProfile) -> Result<(), DeviceError> {
        let total = self.threads_per_block();
        let max = profile.max_threads_per_block();
        if total > max {
            return Err(DeviceError::WorkgroupTooLarge { total, max });
        }
        Ok(())
    }
}

impl fmt::Display for DispatchGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} blocks x {:?} threads ({} work-groups)",
            self.blocks,
            self.threads,
            self.total_blocks()
        )
    }
}

/// Number of blocks needed to cover `extent` with blocks of `factor`.
pub fn blocks_for(extent: i64, factor: i64) -> i64 {
    (extent + factor - 1) / factor
}

/// Kernel body for one work-group. Returns the tile of values the block
/// wrote, or `None` if the block fell entirely outside the region.
pub type Kernel<'a> = dyn Fn(usize) -> Result<Option<Tile>> + Sync + 'a;

/// Something that can run work-groups.
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    fn profile(&self) -> DeviceProfile;

    /// Run `kernel` once per block of `grid` and collect the results in
    /// block order.
    fn dispatch(&self, grid: &DispatchGrid, kernel: &Kernel<'_>) -> Result<Vec<Option<Tile>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_totals() {
        let g = DispatchGrid {
            blocks: vec![4, 3],
            threads: vec![8, 8],
        };
        assert_eq!(g.total_blocks(), 12);
        assert_eq!(g.threads_per_block(), 64);
        assert!(g.validate(DeviceProfile::Embedded).is_ok());
    }

    #[test]
    fn embedded_profile_rejects_large_workgroups() {
        let g = DispatchGrid {
            blocks: vec![1],
            threads: vec![32, 16],
        };
        assert!(g.validate(DeviceProfile::Native).is_ok());
        assert_eq!(
            g.validate(DeviceProfile::Embedded),
            Err(DeviceError::WorkgroupTooLarge { total: 512, max: 256 })
        );
    }

    #[test]
    fn blocks_cover_partial_tiles() {
        // Ceiling division: every point is covered.
        assert_eq!(blocks_for(640, 16), 40);
        assert_eq!(blocks_for(641, 16), 41);
        assert_eq!(blocks_for(1, 8), 1);
    }
}
