use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, Rgb, RgbImage};
use std::path::Path;

use crate::error::{GanError, Result};

/// Loads an image as channels-first floats in `[-1, 1]`, resized to `[C, H, W]`.
pub fn load_image<P: AsRef<Path>>(path: P, image_shape: [usize; 3]) -> Result<Vec<f32>> {
    let [channels, height, width] = image_shape;
    let image = image::open(path)?.resize_exact(width as u32, height as u32, FilterType::Triangle);

    let raw = match channels {
        1 => image.to_luma8().into_raw(),
        3 => image.to_rgb8().into_raw(),
        _ => {
            return Err(GanError::data(format!(
                "only 1 or 3 channel images are supported, got {channels}"
            )))
        }
    };

    // HWC -> CHW
    let plane = height * width;
    let mut pixels = vec![0.0; channels * plane];
    for (i, value) in raw.into_iter().enumerate() {
        pixels[(i % channels) * plane + i / channels] = value as f32 / 127.5 - 1.0;
    }

    Ok(pixels)
}

/// Writes a `rows x cols` grid of `[N, C, H, W]` images, min-max scaled over the batch.
pub fn save_montage<B: Backend, P: AsRef<Path>>(
    images: Tensor<B, 4>,
    rows: usize,
    cols: usize,
    path: P,
) -> Result<()> {
    let [count, channels, height, width] = images.dims();

    // Supports both 1 and 3 channels image
    if channels != 1 && channels != 3 {
        return Err(GanError::data(format!(
            "cannot render {channels} channel images"
        )));
    }

    let values = images
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| GanError::data(format!("unreadable images: {e:?}")))?;
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = if max > min { max - min } else { 1.0 };

    let mut canvas = RgbImage::new((cols * width) as u32, (rows * height) as u32);
    for index in 0..count.min(rows * cols) {
        let (row, col) = (index / cols, index % cols);
        for y in 0..height {
            for x in 0..width {
                let level = |channel: usize| {
                    let v = values[((index * channels + channel) * height + y) * width + x];
                    (((v - min) / range) * 255.0).round() as u8
                };
                let rgb = if channels == 1 {
                    [level(0); 3]
                } else {
                    [level(0), level(1), level(2)]
                };
                canvas.put_pixel(
                    (col * width + x) as u32,
                    (row * height + y) as u32,
                    Rgb(rgb),
                );
            }
        }
    }

    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    canvas.save(path)?;
    Ok(())
}
