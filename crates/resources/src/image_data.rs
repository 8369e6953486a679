//! Decoded RGBA8 pixel data.

use std::path::Path;

use kiln_rhi::resource::TextureFormat;
use tracing::debug;

use crate::error::{ResourceError, ResourceResult};

/// Tightly packed RGBA8 pixels, row-major, top row first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageData {
    width: u32,
    height: u32,
    srgb: bool,
    pixels: Vec<u8>,
}

impl ImageData {
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> ResourceResult<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(ResourceError::PixelSize {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            srgb: true,
            pixels,
        })
    }

    /// Decode a PNG or JPEG held in memory.
    pub fn decode(bytes: &[u8]) -> ResourceResult<Self> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        debug!("Decoded image {}x{}", width, height);
        Self::from_rgba8(width, height, rgba.into_raw())
    }

    pub fn open(path: impl AsRef<Path>) -> ResourceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ResourceError::FileNotFound(path.to_path_buf()));
        }
        Self::decode(&std::fs::read(path)?)
    }

    /// `width` x `height` image of one color.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> ResourceResult<Self> {
        let pixels = rgba.repeat(width as usize * height as usize);
        Self::from_rgba8(width, height, pixels)
    }

    /// Checkerboard of `cell`-pixel squares alternating `a` and `b`.
    pub fn checkerboard(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> ResourceResult<Self> {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity(size as usize * size as usize * 4);
        for y in 0..size {
            for x in 0..size {
                let color = if ((x / cell) + (y / cell)).is_multiple_of(2) { a } else { b };
                pixels.extend_from_slice(&color);
            }
        }
        Self::from_rgba8(size, size, pixels)
    }

    /// Treat the pixels as linear data (normal maps, masks).
    pub fn into_linear(mut self) -> Self {
        self.srgb = false;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn format(&self) -> TextureFormat {
        if self.srgb {
            TextureFormat::Rgba8Srgb
        } else {
            TextureFormat::Rgba8Unorm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_solid() {
        let image = ImageData::solid(2, 3, [1, 2, 3, 4]).unwrap();
        assert_eq!(image.pixels().len(), 24);
        assert_eq!(&image.pixels()[20..], &[1, 2, 3, 4]);
        assert_eq!(image.format(), TextureFormat::Rgba8Srgb);
        assert_eq!(image.into_linear().format(), TextureFormat::Rgba8Unorm);
    }

    #[test]
    fn test_checkerboard_alternates() {
        let white = [255; 4];
        let black = [0, 0, 0, 255];
        let image = ImageData::checkerboard(4, 2, white, black).unwrap();
        let px = |x: usize, y: usize| &image.pixels()[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
        assert_eq!(px(0, 0), &white);
        assert_eq!(px(2, 0), &black);
        assert_eq!(px(2, 2), &white);
    }

    #[test]
    fn test_size_mismatch() {
        assert!(matches!(
            ImageData::from_rgba8(2, 2, vec![0; 15]),
            Err(ResourceError::PixelSize { expected: 16, .. })
        ));
        assert!(ImageData::from_rgba8(0, 2, Vec::new()).is_err());
    }

    #[test]
    fn test_decode_png() {
        let mut png = Vec::new();
        image::RgbaImage::from_pixel(3, 2, image::Rgba([9, 8, 7, 255]))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let decoded = ImageData::decode(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert_eq!(&decoded.pixels()[..4], &[9, 8, 7, 255]);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageData::open(dir.path().join("missing.png")).unwrap_err();
        assert!(matches!(err, ResourceError::FileNotFound(_)));
    }

    #[test]
    fn test_open_garbage_is_image_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"not a png").unwrap();
        assert!(matches!(
            ImageData::open(&path),
            Err(ResourceError::Image(_))
        ));
    }
}
