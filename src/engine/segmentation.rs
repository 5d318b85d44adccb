//! Mask-based background removal around a segmentation model
//!
//! The model itself is a black box that maps a normalized NCHW tensor to a
//! single-channel foreground probability tensor. This module handles the
//! image side: aspect-preserving resize with padding, normalization, mapping
//! the mask back to source coordinates, alpha compositing and encoding.

use super::{BackgroundRemovalEngine, ProcessedImage};
use crate::config::OutputFormat;
use crate::decode::DecodedImage;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage, RgbaImage};
use instant::Instant;
use ndarray::Array4;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// Model input preprocessing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingConfig {
    /// Square input edge length expected by the model
    pub target_size: u32,
    /// Per-channel mean subtracted after scaling to 0-1
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation divisor
    pub normalization_std: [f32; 3],
    /// Color used to pad the letterboxed input
    pub padding_color: [u8; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        // ISNet general-use defaults
        Self {
            target_size: 1024,
            normalization_mean: [0.5, 0.5, 0.5],
            normalization_std: [1.0, 1.0, 1.0],
            padding_color: [255, 255, 255],
        }
    }
}

/// A model producing foreground masks
///
/// `infer` receives a `(1, 3, S, S)` tensor and returns a `(1, 1, S, S)` tensor
/// of foreground probabilities, where `S` is `preprocessing().target_size`.
pub trait SegmentationModel: Send + 'static {
    fn preprocessing(&self) -> PreprocessingConfig;

    /// Run the model
    ///
    /// # Errors
    /// - Any model-side failure
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    fn name(&self) -> &str {
        "segmentation-model"
    }
}

/// Placement of the resized source inside the square model input
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
}

impl Letterbox {
    fn new(dimensions: (u32, u32), target_size: u32) -> (Self, u32, u32) {
        let (width, height) = dimensions;
        let target = target_size as f32;
        let scale = (target / width as f32).min(target / height as f32);
        let new_width = ((width as f32 * scale).round() as u32).clamp(1, target_size);
        let new_height = ((height as f32 * scale).round() as u32).clamp(1, target_size);
        let letterbox = Self {
            scale,
            offset_x: (target_size - new_width) / 2,
            offset_y: (target_size - new_height) / 2,
        };
        (letterbox, new_width, new_height)
    }
}

/// Engine that runs a [`SegmentationModel`] and composites its mask
pub struct SegmentationEngine<M: SegmentationModel> {
    model: Arc<Mutex<M>>,
    output_format: OutputFormat,
    name: String,
}

impl<M: SegmentationModel> SegmentationEngine<M> {
    pub fn new(model: M, output_format: OutputFormat) -> Self {
        let name = model.name().to_string();
        Self {
            model: Arc::new(Mutex::new(model)),
            output_format,
            name,
        }
    }

    /// Preprocess, infer, composite and encode on the current thread
    ///
    /// # Errors
    /// - Model failures, malformed model output, encoding failures
    #[instrument(skip(model, image), fields(dimensions = ?image.dimensions()))]
    pub fn process_blocking(
        model: &Mutex<M>,
        image: &DynamicImage,
        output_format: OutputFormat,
    ) -> Result<ProcessedImage> {
        let start = Instant::now();
        let mut model = model
            .lock()
            .map_err(|_| PipelineError::inference("Segmentation model lock poisoned"))?;
        let config = model.preprocessing();
        if config.target_size == 0 {
            return Err(PipelineError::inference("Model target size is zero"));
        }

        let (letterbox, tensor) = preprocess(image, &config);
        let output = model.infer(&tensor)?;
        drop(model);
        let inference_ms = start.elapsed().as_millis();

        let mask = mask_from_tensor(&output, image.dimensions(), letterbox)?;
        let composited = apply_mask(image, &mask);
        let (width, height) = composited.dimensions();
        let data = encode(composited, output_format)?;

        debug!(
            inference_ms = %inference_ms,
            total_ms = %start.elapsed().as_millis(),
            bytes = data.len(),
            "Background removed"
        );

        Ok(ProcessedImage {
            data,
            mime_type: output_format.mime_type().to_string(),
            width,
            height,
        })
    }
}

#[async_trait]
impl<M: SegmentationModel> BackgroundRemovalEngine for SegmentationEngine<M> {
    async fn remove_background(&self, image: DecodedImage) -> Result<ProcessedImage> {
        let model = Arc::clone(&self.model);
        let output_format = self.output_format;

        tokio::task::spawn_blocking(move || {
            Self::process_blocking(&model, image.image(), output_format)
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                PipelineError::inference("Segmentation model panicked")
            } else {
                PipelineError::inference("Segmentation task was cancelled")
            }
        })?
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Letterbox the image into the model's square input and normalize to NCHW
fn preprocess(image: &DynamicImage, config: &PreprocessingConfig) -> (Letterbox, Array4<f32>) {
    let target_size = config.target_size;
    let rgb = image.to_rgb8();
    let (letterbox, new_width, new_height) = Letterbox::new(rgb.dimensions(), target_size);

    let resized = image::imageops::resize(
        &rgb,
        new_width,
        new_height,
        image::imageops::FilterType::Triangle,
    );
    let mut canvas: RgbImage =
        ImageBuffer::from_pixel(target_size, target_size, Rgb(config.padding_color));
    image::imageops::replace(
        &mut canvas,
        &resized,
        i64::from(letterbox.offset_x),
        i64::from(letterbox.offset_y),
    );

    let size = target_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for channel in 0..3 {
            let value = (f32::from(pixel[channel]) / 255.0 - config.normalization_mean[channel])
                / config.normalization_std[channel];
            if let Some(slot) = tensor.get_mut([0, channel, y as usize, x as usize]) {
                *slot = value;
            }
        }
    }

    (letterbox, tensor)
}

/// Map model output back onto source pixels as 0-255 alpha values
fn mask_from_tensor(
    tensor: &Array4<f32>,
    dimensions: (u32, u32),
    letterbox: Letterbox,
) -> Result<Vec<u8>> {
    let shape = tensor.shape();
    if shape.first() != Some(&1) || shape.get(1) != Some(&1) {
        return Err(PipelineError::inference(format!(
            "Invalid mask tensor shape {:?}, expected (1, 1, H, W)",
            shape
        )));
    }
    let mask_height = shape.get(2).copied().unwrap_or(0);
    let mask_width = shape.get(3).copied().unwrap_or(0);

    let (width, height) = dimensions;
    let mut mask = Vec::with_capacity((width as usize) * (height as usize));
    for y in 0..height {
        for x in 0..width {
            let tx = (x as f32 * letterbox.scale).round() as usize + letterbox.offset_x as usize;
            let ty = (y as f32 * letterbox.scale).round() as usize + letterbox.offset_y as usize;
            let value = if tx < mask_width && ty < mask_height {
                tensor.get([0, 0, ty, tx]).copied().unwrap_or(0.0)
            } else {
                0.0
            };
            mask.push((value.clamp(0.0, 1.0) * 255.0) as u8);
        }
    }
    Ok(mask)
}

/// Use the mask as the alpha channel; fully transparent pixels are zeroed
fn apply_mask(image: &DynamicImage, mask: &[u8]) -> RgbaImage {
    let mut rgba = image.to_rgba8();
    let width = rgba.width();
    for (x, y, pixel) in rgba.enumerate_pixels_mut() {
        let alpha = mask
            .get((y * width + x) as usize)
            .copied()
            .unwrap_or(0);
        *pixel = if alpha == 0 {
            image::Rgba([0, 0, 0, 0])
        } else {
            image::Rgba([pixel[0], pixel[1], pixel[2], alpha.min(pixel[3])])
        };
    }
    rgba
}

fn encode(image: RgbaImage, format: OutputFormat) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut buffer, format.image_format())
        .map_err(|e| {
            PipelineError::inference(format!("Failed to encode result as {:?}: {}", format, e))
        })?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{solid_image, CenterSquareModel};
    use image::ImageFormat;

    #[test]
    fn test_letterbox_wide_image() {
        let (letterbox, w, h) = Letterbox::new((200, 100), 100);
        assert_eq!((w, h), (100, 50));
        assert_eq!(letterbox.offset_x, 0);
        assert_eq!(letterbox.offset_y, 25);
        assert!((letterbox.scale - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let config = PreprocessingConfig {
            target_size: 8,
            ..PreprocessingConfig::default()
        };
        let image = solid_image(8, 4, [0, 0, 0, 255]);
        let (letterbox, tensor) = preprocess(&image, &config);
        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        assert_eq!(letterbox.offset_y, 2);

        // Top row is white padding: (1.0 - 0.5) / 1.0
        assert!((tensor[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
        // Center row is the black source: (0.0 - 0.5) / 1.0
        assert!((tensor[[0, 0, 4, 4]] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_mask_shape() {
        let tensor = Array4::<f32>::zeros((1, 3, 4, 4));
        let letterbox = Letterbox {
            scale: 1.0,
            offset_x: 0,
            offset_y: 0,
        };
        let err = mask_from_tensor(&tensor, (4, 4), letterbox).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn test_apply_mask_zeroes_background() {
        let image = solid_image(2, 1, [200, 100, 50, 255]);
        let result = apply_mask(&image, &[0, 255]);
        assert_eq!(result.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(result.get_pixel(1, 0).0, [200, 100, 50, 255]);
    }

    #[tokio::test]
    async fn test_engine_produces_transparent_png() {
        let engine = SegmentationEngine::new(CenterSquareModel::new(16), OutputFormat::Png);
        let image = DecodedImage::new(solid_image(32, 32, [10, 20, 30, 255]), ImageFormat::Png);

        let processed = engine.remove_background(image).await.unwrap();
        assert_eq!(processed.mime_type, "image/png");
        assert_eq!((processed.width, processed.height), (32, 32));

        let decoded = image::load_from_memory(&processed.data).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(0, 0).0[3], 0, "corner is background");
        assert_eq!(decoded.get_pixel(16, 16).0[3], 255, "center is foreground");
    }

    #[tokio::test]
    async fn test_engine_propagates_model_failure() {
        let engine =
            SegmentationEngine::new(CenterSquareModel::failing(16), OutputFormat::Png);
        let image = DecodedImage::new(solid_image(8, 8, [0, 0, 0, 255]), ImageFormat::Png);
        let err = engine.remove_background(image).await.unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }
}
