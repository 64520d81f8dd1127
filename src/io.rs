// io.rs -- PNG in, PNG out.
//
// Files are interleaved (RGBRGB...); buffers are planar. Loading converts
// whatever the file holds to 8-bit RGB and de-interleaves; saving
// interleaves again. 1, 3 and 4 channel buffers can be saved.

use std::path::Path;

use image::{GrayImage, RgbImage, RgbaImage};
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{DomainError, Result};

/// Load an image file as a planar 3-channel `Buffer<u8>`.
pub fn load_image(path: impl AsRef<Path>) -> Result<Buffer<u8>> {
    let path = path.as_ref();
    let rgb = image::open(path)?.to_rgb8();
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let buffer = Buffer::from_fn(w, h, 3, |x, y, c| rgb.get_pixel(x as u32, y as u32).0[c]);
    debug!(path = %path.display(), w, h, "loaded image");
    Ok(buffer)
}

/// Save a host-resident buffer with 1, 3 or 4 channels.
pub fn save_image(buffer: &Buffer<u8>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let [w, h, channels] = buffer.extents();
    let data = buffer.as_slice()?;
    let mut interleaved = Vec::with_capacity(data.len());
    for y in 0..h {
        for x in 0..w {
            for c in 0..channels {
                interleaved.push(data[x + w * (y + h * c)]);
            }
        }
    }
    let (w32, h32) = (w as u32, h as u32);
    let shape_error = || DomainError::ShapeMismatch {
        expected: [w, h, channels],
        found: [w, h, channels],
    };
    match channels {
        1 => GrayImage::from_raw(w32, h32, interleaved)
            .ok_or_else(shape_error)?
            .save(path)?,
        3 => RgbImage::from_raw(w32, h32, interleaved)
            .ok_or_else(shape_error)?
            .save(path)?,
        4 => RgbaImage::from_raw(w32, h32, interleaved)
            .ok_or_else(shape_error)?
            .save(path)?,
        n => return Err(DomainError::ChannelCount(n).into()),
    }
    debug!(path = %path.display(), w, h, channels, "saved image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_roundtrip_keeps_planes() {
        let dir = std::env::temp_dir().join("tilepipe_io_test.png");
        let buf = Buffer::from_fn(5, 4, 3, |x, y, c| (x * 10 + y * 3 + c * 100) as u8);
        save_image(&buf, &dir).unwrap();
        let back = load_image(&dir).unwrap();
        assert_eq!(back.extents(), [5, 4, 3]);
        assert_eq!(back.as_slice().unwrap(), buf.as_slice().unwrap());
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn two_channel_buffers_cannot_be_saved() {
        let buf = Buffer::<u8>::new(2, 2, 2);
        let path = std::env::temp_dir().join("tilepipe_io_two.png");
        assert!(matches!(
            save_image(&buf, &path),
            Err(crate::error::Error::Domain(DomainError::ChannelCount(2)))
        ));
    }
}
