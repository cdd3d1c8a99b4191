use std::io::Cursor;

use anyhow::{Context, Result};
use image::{imageops, GrayImage, Luma};

use crate::error::DisplayError;

const WHITE: Luma<u8> = Luma([255]);
const BLACK: Luma<u8> = Luma([0]);
const THRESHOLD: u8 = 128;

/// A packed 1-bit panel buffer: rows top to bottom, MSB is the leftmost
/// pixel, a set bit is black.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn stride(width: u32) -> usize {
        width.div_ceil(8) as usize
    }

    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Self::stride(width) * height as usize],
        }
    }

    /// Decodes any image format the server may send and centres it on a
    /// white frame of the panel size. Oversized images are scaled down.
    pub fn from_image(bytes: &[u8], width: u32, height: u32) -> Result<Self, DisplayError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|err| DisplayError::InvalidImage(err.to_string()))?;
        let decoded = if decoded.width() > width || decoded.height() > height {
            decoded.resize(width, height, imageops::FilterType::Triangle)
        } else {
            decoded
        };
        let gray = decoded.to_luma8();

        let mut canvas = GrayImage::from_pixel(width, height, WHITE);
        let x = i64::from((width - gray.width()) / 2);
        let y = i64::from((height - gray.height()) / 2);
        imageops::overlay(&mut canvas, &gray, x, y);
        Ok(Self::pack(&canvas))
    }

    fn pack(canvas: &GrayImage) -> Self {
        let mut frame = Self::blank(canvas.width(), canvas.height());
        let stride = Self::stride(canvas.width());
        for (x, y, pixel) in canvas.enumerate_pixels() {
            if pixel.0[0] < THRESHOLD {
                frame.data[y as usize * stride + (x / 8) as usize] |= 0x80 >> (x % 8);
            }
        }
        frame
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_black(&self, x: u32, y: u32) -> bool {
        let idx = y as usize * Self::stride(self.width) + (x / 8) as usize;
        self.data[idx] & (0x80 >> (x % 8)) != 0
    }
}

/// Built-in "nothing to show" image: a white frame with a border and a cross.
pub fn placeholder_png(width: u32, height: u32) -> Result<Vec<u8>> {
    let mut img = GrayImage::from_pixel(width, height, WHITE);
    let border = 4.min(width / 4).min(height / 4);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let on_border =
            x < border || y < border || x >= width - border || y >= height - border;
        // Two diagonals through the centre, a few pixels thick.
        let dx = u64::from(x) * u64::from(height);
        let dy = u64::from(y) * u64::from(width);
        let dy_flipped = u64::from(height - 1 - y) * u64::from(width);
        let tolerance = 3 * u64::from(width.max(height));
        let on_cross = dx.abs_diff(dy) < tolerance || dx.abs_diff(dy_flipped) < tolerance;
        if on_border || on_cross {
            *pixel = BLACK;
        }
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .context("encoding placeholder image")?;
    Ok(out.into_inner())
}
