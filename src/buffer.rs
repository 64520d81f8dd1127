// buffer.rs -- Dense 3D element buffer with host/device residency.
//
// LAYOUT:
//   width x height x channels, planar: x fastest, then y, then c.
//
//     index = x + y * width + c * width * height
//
//   Planar layout keeps each channel contiguous, which is what a stencil
//   over (x, y) wants; the loader in io.rs de-interleaves RGB on the way in.
//
// RESIDENCY:
//   A buffer always owns its host Vec<T>. It may also own a device copy,
//   stored as raw bytes the way an accelerator would see it. The residency
//   flag says which copies are current:
//
//     Host    host copy valid, device copy absent or stale
//     Device  device copy valid, host copy stale
//     Both    both copies hold the same data
//
//   Data crosses the boundary only in `ensure_host` / `ensure_device`.
//   Each crossing is counted in `TransferStats`, so a caller can separate
//   transfer cost from compute cost. Nothing ever writes both copies.
//
// NEW RUST CONCEPTS:
// - `bytemuck::Pod` -- "plain old data": any bit pattern is a valid value,
//   so a &[T] can be viewed as &[u8] and back without unsafe code.
// - Associated consts on traits (`Element::TYPE`).

use std::fmt;
use std::ops::Index;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{DomainError, ResidencyError, Result};
use crate::expr::ScalarType;

// ---------------------------------------------------------------------------
// Element trait
// ---------------------------------------------------------------------------

/// Types that can be stored in a `Buffer`.
pub trait Element:
    bytemuck::Pod + Default + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// The scalar type this element corresponds to in expressions.
    const TYPE: ScalarType;

    fn to_scalar(self) -> f64;

    /// Convert a value already folded into `Self::TYPE`.
    fn from_scalar(v: f64) -> Self;
}

impl Element for u8 {
    const TYPE: ScalarType = ScalarType::U8;

    #[inline]
    fn to_scalar(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_scalar(v: f64) -> Self {
        v as u8
    }
}

impl Element for u16 {
    const TYPE: ScalarType = ScalarType::U16;

    #[inline]
    fn to_scalar(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_scalar(v: f64) -> Self {
        v as u16
    }
}

impl Element for i32 {
    const TYPE: ScalarType = ScalarType::I32;

    #[inline]
    fn to_scalar(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_scalar(v: f64) -> Self {
        v as i32
    }
}

impl Element for f32 {
    const TYPE: ScalarType = ScalarType::F32;

    #[inline]
    fn to_scalar(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_scalar(v: f64) -> Self {
        v as f32
    }
}

// ---------------------------------------------------------------------------
// Residency bookkeeping
// ---------------------------------------------------------------------------

/// Which copies of a buffer are current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Host,
    Device,
    Both,
}

impl Residency {
    pub fn host_valid(self) -> bool {
        matches!(self, Residency::Host | Residency::Both)
    }

    pub fn device_valid(self) -> bool {
        matches!(self, Residency::Device | Residency::Both)
    }
}

/// Which copy a read should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Device,
}

/// Counters for host <-> device copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub to_device: u64,
    pub to_host: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Copies made since `earlier` was taken.
    pub fn since(&self, earlier: &TransferStats) -> TransferStats {
        TransferStats {
            to_device: self.to_device - earlier.to_device,
            to_host: self.to_host - earlier.to_host,
            bytes: self.bytes - earlier.bytes,
            elapsed: self.elapsed.saturating_sub(earlier.elapsed),
        }
    }

    pub fn copies(&self) -> u64 {
        self.to_device + self.to_host
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to device, {} to host, {} bytes in {:?}",
            self.to_device, self.to_host, self.bytes, self.elapsed
        )
    }
}

// ---------------------------------------------------------------------------
// Buffer<T>
// ---------------------------------------------------------------------------

/// A width x height x channels array of `T`.
#[derive(Clone)]
pub struct Buffer<T: Element> {
    host: Vec<T>,
    device: Option<Vec<u8>>,
    residency: Residency,
    stats: TransferStats,
    width: usize,
    height: usize,
    channels: usize,
}

impl<T: Element> Buffer<T> {
    // --- Constructors ---

    /// Zero-initialized, host-resident buffer.
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self::from_vec(
            width,
            height,
            channels,
            vec![T::default(); width * height * channels],
        )
    }

    /// Wrap existing planar data.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height * channels`.
    pub fn from_vec(width: usize, height: usize, channels: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height * channels,
            "data length ({}) must equal width * height * channels ({})",
            data.len(),
            width * height * channels,
        );
        Buffer {
            host: data,
            device: None,
            residency: Residency::Host,
            stats: TransferStats::default(),
            width,
            height,
            channels,
        }
    }

    /// Fill from a function of (x, y, c).
    pub fn from_fn(
        width: usize,
        height: usize,
        channels: usize,
        mut f: impl FnMut(usize, usize, usize) -> T,
    ) -> Self {
        let mut data = Vec::with_capacity(width * height * channels);
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    data.push(f(x, y, c));
                }
            }
        }
        Self::from_vec(width, height, channels, data)
    }

    // --- Accessors ---

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn extents(&self) -> [usize; 3] {
        [self.width, self.height, self.channels]
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.stats
    }

    #[inline]
    fn index_of(&self, x: i64, y: i64, c: i64) -> Option<usize> {
        let inside = |v: i64, extent: usize| v >= 0 && (v as usize) < extent;
        if inside(x, self.width) && inside(y, self.height) && inside(c, self.channels) {
            Some(x as usize + self.width * (y as usize + self.height * c as usize))
        } else {
            None
        }
    }

    fn out_of_bounds(&self, name: &str, x: i64, y: i64, c: i64) -> DomainError {
        DomainError::OutOfBounds {
            buffer: name.to_string(),
            coords: vec![x, y, c],
            extents: vec![self.width as i64, self.height as i64, self.channels as i64],
        }
    }

    /// Bounds-checked host read.
    pub fn at(&self, x: usize, y: usize, c: usize) -> Result<T> {
        self.load(x as i64, y as i64, c as i64, Side::Host)
            .map(T::from_scalar)
    }

    /// Bounds-checked host write. The device copy (if any) becomes stale.
    pub fn set(&mut self, x: usize, y: usize, c: usize, v: T) -> Result<()> {
        let (x, y, c) = (x as i64, y as i64, c as i64);
        let i = self
            .index_of(x, y, c)
            .ok_or_else(|| self.out_of_bounds("buffer", x, y, c))?;
        if !self.residency.host_valid() {
            return Err(ResidencyError::HostStale.into());
        }
        self.host[i] = v;
        self.residency = Residency::Host;
        Ok(())
    }

    /// Read one element as a scalar from the requested side.
    pub fn load(&self, x: i64, y: i64, c: i64, side: Side) -> Result<f64> {
        let i = self
            .index_of(x, y, c)
            .ok_or_else(|| self.out_of_bounds("buffer", x, y, c))?;
        match side {
            Side::Host => {
                if !self.residency.host_valid() {
                    return Err(ResidencyError::HostStale.into());
                }
                Ok(self.host[i].to_scalar())
            }
            Side::Device => {
                let bytes = match (&self.device, self.residency.device_valid()) {
                    (Some(d), true) => d,
                    _ => return Err(ResidencyError::DeviceStale.into()),
                };
                let size = std::mem::size_of::<T>();
                let v: T = bytemuck::pod_read_unaligned(&bytes[i * size..(i + 1) * size]);
                Ok(v.to_scalar())
            }
        }
    }

    /// The host elements in planar order.
    pub fn as_slice(&self) -> Result<&[T]> {
        if !self.residency.host_valid() {
            return Err(ResidencyError::HostStale.into());
        }
        Ok(&self.host)
    }

    /// Mutable host elements for a full overwrite. Marks the host copy as
    /// the only valid one.
    pub fn host_mut(&mut self) -> &mut [T] {
        self.residency = Residency::Host;
        &mut self.host
    }

    // --- Residency transitions ---

    /// Make the host copy current, copying down from the device if needed.
    /// A no-op when the host copy is already valid.
    pub fn ensure_host(&mut self) -> Result<()> {
        if self.residency.host_valid() {
            return Ok(());
        }
        let start = Instant::now();
        let bytes: &[u8] = self.device.as_deref().ok_or(ResidencyError::DeviceStale)?;
        let n = bytes.len() as u64;
        self.host = bytemuck::pod_collect_to_vec::<u8, T>(bytes);
        self.record(false, n, start.elapsed());
        self.residency = Residency::Both;
        Ok(())
    }

    /// Make the device copy current, copying up from the host if needed.
    /// A no-op when the device copy is already valid.
    pub fn ensure_device(&mut self) -> Result<()> {
        if self.residency.device_valid() {
            return Ok(());
        }
        let start = Instant::now();
        let bytes: Vec<u8> = bytemuck::cast_slice(&self.host).to_vec();
        let n = bytes.len() as u64;
        self.device = Some(bytes);
        self.record(true, n, start.elapsed());
        self.residency = Residency::Both;
        Ok(())
    }

    /// Allocate a device store for a write-only realization. Nothing is
    /// copied; afterwards only the device copy is valid.
    pub fn prepare_device_write(&mut self) {
        let len = self.host.len() * std::mem::size_of::<T>();
        match &mut self.device {
            Some(d) if d.len() == len => {}
            slot => *slot = Some(vec![0; len]),
        }
        self.residency = Residency::Device;
    }

    /// The device store, for writers that called `prepare_device_write`.
    pub fn device_bytes_mut(&mut self) -> Result<&mut [u8]> {
        if self.residency != Residency::Device {
            return Err(ResidencyError::DeviceStale.into());
        }
        self.device
            .as_deref_mut()
            .ok_or_else(|| ResidencyError::DeviceStale.into())
    }

    fn record(&mut self, to_device: bool, bytes: u64, elapsed: Duration) {
        if to_device {
            self.stats.to_device += 1;
        } else {
            self.stats.to_host += 1;
        }
        self.stats.bytes += bytes;
        self.stats.elapsed += elapsed;
        trace!(to_device, bytes, ?elapsed, "buffer transfer");
    }
}

impl<T: Element> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("type", &T::TYPE)
            .field("residency", &self.residency)
            .finish()
    }
}

/// `buf[(x, y, c)]` -- host read without a `Result`.
///
/// # Panics
/// Panics if out of bounds or if the host copy is stale.
impl<T: Element> Index<(usize, usize, usize)> for Buffer<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y, c): (usize, usize, usize)) -> &T {
        assert!(
            self.residency.host_valid(),
            "host copy is stale; call ensure_host() first"
        );
        let i = self
            .index_of(x as i64, y as i64, c as i64)
            .unwrap_or_else(|| {
                panic!(
                    "({x}, {y}, {c}) out of bounds ({}x{}x{})",
                    self.width, self.height, self.channels
                )
            });
        &self.host[i]
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn new_is_zeroed_and_host_resident() {
        let b: Buffer<u8> = Buffer::new(4, 3, 2);
        assert_eq!(b.len(), 24);
        assert_eq!(b.residency(), Residency::Host);
        assert_eq!(b.at(3, 2, 1).unwrap(), 0);
    }

    #[test]
    fn planar_layout() {
        let b = Buffer::from_fn(2, 2, 2, |x, y, c| (x + 10 * y + 100 * c) as u16);
        assert_eq!(b.as_slice().unwrap(), &[0, 1, 10, 11, 100, 101, 110, 111]);
        assert_eq!(b[(1, 1, 1)], 111);
    }

    #[test]
    fn out_of_bounds_is_a_domain_error() {
        let b: Buffer<u8> = Buffer::new(2, 2, 1);
        assert!(matches!(
            b.at(2, 0, 0),
            Err(Error::Domain(DomainError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn ensure_device_is_lazy() {
        let mut b = Buffer::from_fn(3, 1, 1, |x, _, _| x as f32 * 0.5);
        b.ensure_device().unwrap();
        b.ensure_device().unwrap();
        let s = b.transfer_stats();
        assert_eq!(s.to_device, 1);
        assert_eq!(s.bytes, 12);
        assert_eq!(b.residency(), Residency::Both);
        assert_eq!(b.load(2, 0, 0, Side::Device).unwrap(), 1.0);
    }

    #[test]
    fn device_write_makes_host_stale() {
        let mut b: Buffer<u16> = Buffer::new(2, 1, 1);
        b.prepare_device_write();
        let bytes = b.device_bytes_mut().unwrap();
        bytes[2..4].copy_from_slice(bytemuck::bytes_of(&513u16));
        assert!(matches!(
            b.at(1, 0, 0),
            Err(Error::Residency(ResidencyError::HostStale))
        ));
        b.ensure_host().unwrap();
        assert_eq!(b.at(1, 0, 0).unwrap(), 513);
        assert_eq!(b.transfer_stats().to_host, 1);
        assert_eq!(b.transfer_stats().to_device, 0);
    }

    #[test]
    fn host_write_invalidates_device_copy() {
        let mut b: Buffer<u8> = Buffer::new(1, 1, 1);
        b.ensure_device().unwrap();
        b.set(0, 0, 0, 9).unwrap();
        assert_eq!(b.residency(), Residency::Host);
        assert!(b.load(0, 0, 0, Side::Device).is_err());
    }
}
