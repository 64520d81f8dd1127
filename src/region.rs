// region.rs -- Rectangular regions and the tiles that hold stage values.
//
// A `Region` is a box in a stage's coordinate space: one (min, extent)
// pair per dimension. A `Tile` is the storage for one realization of a
// stage over a region. Values are kept as f64 (already folded into the
// stage's scalar type), together with a filled mask. The mask serves two
// purposes:
//   - store-at caching: a tile allocated at an outer loop level is filled
//     piecemeal, and later iterations skip points that are already done
//   - private tiles: a parallel iteration or device work-group writes only
//     its own points, and the blit back into the destination copies
//     exactly those

use crate::error::{DomainError, Result};
use crate::interval::Interval;

/// An n-dimensional box: `mins[d] .. mins[d] + extents[d]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub mins: Vec<i64>,
    pub extents: Vec<i64>,
}

impl Region {
    pub fn new(mins: Vec<i64>, extents: Vec<i64>) -> Self {
        debug_assert_eq!(mins.len(), extents.len());
        Region { mins, extents }
    }

    /// Region covering inclusive `(lo, hi)` ranges.
    pub fn from_ranges(ranges: &[(i64, i64)]) -> Self {
        Region {
            mins: ranges.iter().map(|r| r.0).collect(),
            extents: ranges.iter().map(|r| (r.1 - r.0 + 1).max(0)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.mins.len()
    }

    /// Number of points.
    pub fn volume(&self) -> usize {
        self.extents.iter().map(|&e| e.max(0) as usize).product()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.iter().any(|&e| e <= 0)
    }

    pub fn max(&self, d: usize) -> i64 {
        self.mins[d] + self.extents[d] - 1
    }

    pub fn to_intervals(&self) -> Vec<Interval> {
        (0..self.rank())
            .map(|d| Interval::new(self.mins[d] as f64, self.max(d) as f64))
            .collect()
    }

    /// Linear offset of `coords`, x fastest. `None` if outside.
    #[inline]
    pub fn offset(&self, coords: &[i64]) -> Option<usize> {
        let mut off = 0usize;
        let mut stride = 1usize;
        for (d, &c) in coords.iter().enumerate().take(self.rank()) {
            let rel = c - self.mins[d];
            if rel < 0 || rel >= self.extents[d] {
                return None;
            }
            off += rel as usize * stride;
            stride *= self.extents[d] as usize;
        }
        Some(off)
    }
}

/// Somewhere a stage's loop nest can write its values.
pub trait Sink {
    /// Store `value` at `coords`.
    fn put(&mut self, coords: &[i64], value: f64) -> Result<()>;

    /// True if `coords` already holds a value that must not be recomputed.
    fn holds(&self, _coords: &[i64]) -> bool {
        false
    }
}

/// Values of one stage over one region.
#[derive(Debug, Clone)]
pub struct Tile {
    region: Region,
    values: Vec<f64>,
    filled: Vec<bool>,
}

impl Tile {
    pub fn new(region: Region) -> Self {
        let n = region.volume();
        Tile {
            region,
            values: vec![0.0; n],
            filled: vec![false; n],
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Number of points written so far.
    pub fn filled_count(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }

    /// Read the value at `coords`. Reading an unwritten or outside point
    /// is a bounds violation.
    #[inline]
    pub fn get(&self, stage: &str, coords: &[i64]) -> Result<f64> {
        match self.region.offset(coords) {
            Some(i) if self.filled[i] => Ok(self.values[i]),
            _ => Err(DomainError::OutOfBounds {
                buffer: stage.to_string(),
                coords: coords.to_vec(),
                extents: self.region.extents.clone(),
            }
            .into()),
        }
    }

    /// Copy every written point into `dst`.
    pub fn blit(&self, dst: &mut dyn Sink) -> Result<()> {
        let rank = self.region.rank();
        let mut coords = self.region.mins.clone();
        for i in 0..self.values.len() {
            if self.filled[i] {
                dst.put(&coords, self.values[i])?;
            }
            // Advance the odometer, x fastest.
            for d in 0..rank {
                coords[d] += 1;
                if coords[d] <= self.region.max(d) {
                    break;
                }
                coords[d] = self.region.mins[d];
            }
        }
        Ok(())
    }
}

impl Sink for Tile {
    fn put(&mut self, coords: &[i64], value: f64) -> Result<()> {
        match self.region.offset(coords) {
            Some(i) => {
                self.values[i] = value;
                self.filled[i] = true;
                Ok(())
            }
            None => Err(DomainError::OutOfBounds {
                buffer: "tile".to_string(),
                coords: coords.to_vec(),
                extents: self.region.extents.clone(),
            }
            .into()),
        }
    }

    fn holds(&self, coords: &[i64]) -> bool {
        self.region
            .offset(coords)
            .map(|i| self.filled[i])
            .unwrap_or(false)
    }
}
