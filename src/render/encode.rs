//! Tone-mapped frame read-back and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::util::{Error, Result};

/// Display-ready RGBA float frame, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl FrameBuffer {
    /// Re-order rows of a bottom-left-origin texture read-back.
    pub fn from_bottom_up(width: u32, height: u32, texels: &[f32]) -> Result<Self> {
        let row = width as usize * 4;
        if texels.len() != row * height as usize {
            return Err(Error::gpu(format!(
                "read-back of {} floats does not match {width}x{height}",
                texels.len()
            )));
        }
        let pixels = texels
            .chunks_exact(row)
            .rev()
            .flatten()
            .copied()
            .collect();
        Ok(Self { width, height, pixels })
    }

    /// RGBA float pixel at (x, y), top-left origin.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }

    /// Quantize to 8-bit RGB, dropping alpha.
    pub fn to_rgb8(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
            .collect()
    }
}

/// JPEG encoder for streamed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality: quality.clamp(1, 100) }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn encode(&self, frame: &FrameBuffer) -> Result<Vec<u8>> {
        let rgb = frame.to_rgb8();
        let mut bytes = Vec::with_capacity(rgb.len() / 8);
        JpegEncoder::new_with_quality(&mut bytes, self.quality).encode(
            &rgb,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(bytes)
    }
}
