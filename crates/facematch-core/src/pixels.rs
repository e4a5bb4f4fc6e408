//! Raw pixel buffers handed to the embedding extractor.

use image::DynamicImage;

/// Interleaved channels per pixel (R, G, B).
pub const CHANNELS: usize = 3;

/// A row-major 8-bit RGB raster.
#[derive(Debug, Clone)]
pub struct PixelArray {
    /// Interleaved RGB data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PixelArray {
    /// Convert a decoded image of any color type to RGB8. Alpha is dropped.
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self {
            data: rgb.into_raw(),
            width,
            height,
        }
    }

    /// Byte length a buffer of these dimensions must have.
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * CHANNELS
    }

    /// The RGB triple at (x, y). Caller keeps the coordinates in bounds.
    pub fn rgb_at(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Average channel intensity (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}
