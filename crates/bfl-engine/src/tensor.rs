use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use ndarray::Array4;

pub const PLACEHOLDER_SIZE: u32 = 512;
pub const CHANNELS: usize = 3;

/// Host image representation: `[batch = 1, height, width, 3]`, every value
/// in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array4<f32>,
}

impl ImageTensor {
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let data = Array4::from_shape_fn(
            (1, height as usize, width as usize, CHANNELS),
            |(_, y, x, channel)| f32::from(image.get_pixel(x as u32, y as u32)[channel]) / 255.0,
        );
        Self { data }
    }

    /// 512×512 black image returned whenever generation fails.
    pub fn placeholder() -> Self {
        Self::from_rgb(&RgbImage::from_pixel(
            PLACEHOLDER_SIZE,
            PLACEHOLDER_SIZE,
            Rgb([0, 0, 0]),
        ))
    }

    pub fn shape(&self) -> [usize; 4] {
        let (batch, height, width, channels) = self.data.dim();
        [batch, height, width, channels]
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn to_rgb_image(&self) -> RgbImage {
        let (_, height, width, _) = self.data.dim();
        RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let channel = |c: usize| {
                let value = self.data[[0, y as usize, x as usize, c]].clamp(0.0, 1.0);
                (value * 255.0).round() as u8
            };
            Rgb([channel(0), channel(1), channel(2)])
        })
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        self.to_rgb_image()
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("failed to save {}", path.display()))
    }
}
