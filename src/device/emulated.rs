// device/emulated.rs -- An accelerator that runs work-groups on a thread pool.
//
// Each block index becomes one rayon task. The executor hands every task
// the device-side view of its inputs and collects a private output tile
// per block, so blocks share no mutable state. The accelerator itself only
// validates the grid against its profile and keeps dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;
use tracing::trace;

use super::{Accelerator, DeviceProfile, DispatchGrid, Kernel};
use crate::error::Result;
use crate::region::Tile;

/// Runs device dispatches on the rayon pool.
#[derive(Debug)]
pub struct EmulatedAccelerator {
    profile: DeviceProfile,
    dispatches: AtomicU64,
    work_groups: AtomicU64,
}

impl EmulatedAccelerator {
    pub fn new(profile: DeviceProfile) -> Self {
        EmulatedAccelerator {
            profile,
            dispatches: AtomicU64::new(0),
            work_groups: AtomicU64::new(0),
        }
    }

    /// Dispatches issued so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Work-groups executed so far.
    pub fn work_group_count(&self) -> u64 {
        self.work_groups.load(Ordering::Relaxed)
    }
}

impl Default for EmulatedAccelerator {
    fn default() -> Self {
        Self::new(DeviceProfile::Native)
    }
}

impl Accelerator for EmulatedAccelerator {
    fn name(&self) -> &str {
        "emulated"
    }

    fn profile(&self) -> DeviceProfile {
        self.profile
    }

    fn dispatch(&self, grid: &DispatchGrid, kernel: &Kernel<'_>) -> Result<Vec<Option<Tile>>> {
        grid.validate(self.profile)?;
        let blocks = grid.total_blocks() as usize;
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.work_groups.fetch_add(blocks as u64, Ordering::Relaxed);
        trace!(%grid, "emulated dispatch");
        (0..blocks).into_par_iter().map(kernel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, Error};
    use crate::region::{Region, Sink};

    #[test]
    fn runs_every_block_once_in_order() {
        let acc = EmulatedAccelerator::default();
        let grid = DispatchGrid {
            blocks: vec![2, 3],
            threads: vec![4],
        };
        let kernel = |b: usize| -> Result<Option<Tile>> {
            let mut t = Tile::new(Region::new(vec![b as i64], vec![1]));
            t.put(&[b as i64], b as f64 * 10.0)?;
            Ok(Some(t))
        };
        let tiles = acc.dispatch(&grid, &kernel).unwrap();
        assert_eq!(tiles.len(), 6);
        for (b, t) in tiles.iter().enumerate() {
            let t = t.as_ref().unwrap();
            assert_eq!(t.get("k", &[b as i64]).unwrap(), b as f64 * 10.0);
        }
        assert_eq!(acc.dispatch_count(), 1);
        assert_eq!(acc.work_group_count(), 6);
    }

    #[test]
    fn oversized_workgroup_is_rejected_before_running() {
        let acc = EmulatedAccelerator::new(DeviceProfile::Embedded);
        let grid = DispatchGrid {
            blocks: vec![1],
            threads: vec![64, 8],
        };
        let kernel = |_: usize| -> Result<Option<Tile>> { panic!("must not run") };
        let err = acc.dispatch(&grid, &kernel).unwrap_err();
        assert!(matches!(
            err,
            Error::Device(DeviceError::WorkgroupTooLarge { total: 512, .. })
        ));
        assert_eq!(acc.dispatch_count(), 0);
    }
}
