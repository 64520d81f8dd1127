// tests/test_buffer.rs -- Integration tests for Buffer<T> and residency.
//
// These run with `cargo test --test test_buffer`.

use tilepipe::buffer::{Buffer, Residency, Side};
use tilepipe::error::{DomainError, Error, ResidencyError};

// ===== Construction & access =====

#[test]
fn new_is_zeroed_and_host_resident() {
    let buf: Buffer<u16> = Buffer::new(5, 3, 2);
    assert_eq!(buf.extents(), [5, 3, 2]);
    assert_eq!(buf.len(), 30);
    assert_eq!(buf.residency(), Residency::Host);
    assert!(buf.as_slice().unwrap().iter().all(|&v| v == 0));
}

#[test]
fn layout_is_planar() {
    // 2x2, two channels: channel 0 then channel 1.
    let buf = Buffer::from_vec(2, 2, 2, vec![1u8, 2, 3, 4, 10, 20, 30, 40]);
    assert_eq!(buf.at(1, 0, 0).unwrap(), 2);
    assert_eq!(buf.at(0, 1, 0).unwrap(), 3);
    assert_eq!(buf.at(0, 0, 1).unwrap(), 10);
    assert_eq!(buf[(1, 1, 1)], 40);
}

#[test]
fn out_of_bounds_access_fails() {
    let mut buf: Buffer<f32> = Buffer::new(4, 4, 1);
    assert!(matches!(
        buf.at(4, 0, 0),
        Err(Error::Domain(DomainError::OutOfBounds { .. }))
    ));
    assert!(buf.set(0, 0, 1, 1.0).is_err());
    assert!(buf.load(-1, 0, 0, Side::Host).is_err());
}

// ===== Residency =====

#[test]
fn transfers_happen_once() {
    let mut buf = Buffer::from_fn(8, 8, 3, |x, y, c| (x + y + c) as u8);
    buf.ensure_device().unwrap();
    buf.ensure_device().unwrap();
    assert_eq!(buf.residency(), Residency::Both);
    let stats = buf.transfer_stats();
    assert_eq!(stats.to_device, 1);
    assert_eq!(stats.bytes, 8 * 8 * 3);

    // Both copies are current: reading the device side gives the same data.
    assert_eq!(buf.load(3, 2, 1, Side::Device).unwrap(), 6.0);
    buf.ensure_host().unwrap();
    assert_eq!(buf.transfer_stats().to_host, 0);
}

#[test]
fn host_write_invalidates_device_copy() {
    let mut buf: Buffer<i32> = Buffer::new(2, 2, 1);
    buf.ensure_device().unwrap();
    buf.set(1, 1, 0, -7).unwrap();
    assert_eq!(buf.residency(), Residency::Host);
    assert!(matches!(
        buf.load(1, 1, 0, Side::Device),
        Err(Error::Residency(ResidencyError::DeviceStale))
    ));
    buf.ensure_device().unwrap();
    assert_eq!(buf.load(1, 1, 0, Side::Device).unwrap(), -7.0);
    assert_eq!(buf.transfer_stats().to_device, 2);
}

#[test]
fn device_write_makes_host_stale() {
    let mut buf: Buffer<u16> = Buffer::new(2, 1, 1);
    buf.prepare_device_write();
    buf.device_bytes_mut().unwrap()[2..4].copy_from_slice(&513u16.to_ne_bytes());
    assert_eq!(buf.residency(), Residency::Device);
    assert!(matches!(
        buf.at(1, 0, 0),
        Err(Error::Residency(ResidencyError::HostStale))
    ));
    buf.ensure_host().unwrap();
    assert_eq!(buf.at(1, 0, 0).unwrap(), 513);
    assert_eq!(buf.transfer_stats().to_host, 1);
}
