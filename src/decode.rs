//! Image decoding stage
//!
//! Turns fetched bytes into a pixel-addressable [`DecodedImage`]. Decoding is
//! CPU-bound and runs on the blocking pool. Each decode leases a
//! [`DecodeSurface`] from a [`SurfaceTracker`]; the lease is a guard, so it is
//! returned on success, on decode errors and while unwinding from a panic.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Raw bytes retrieved from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImageBytes {
    pub data: Vec<u8>,
    /// Content type reported by the source, if any
    pub content_type: Option<String>,
}

impl RawImageBytes {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decoded image owned by a single invocation
#[derive(Debug, Clone)]
pub struct DecodedImage {
    image: DynamicImage,
    format: ImageFormat,
}

impl DecodedImage {
    #[must_use]
    pub fn new(image: DynamicImage, format: ImageFormat) -> Self {
        Self { image, format }
    }

    #[must_use]
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    #[must_use]
    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// Encoding the bytes were decoded from
    #[must_use]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Counts outstanding decode surfaces
#[derive(Debug, Clone, Default)]
pub struct SurfaceTracker {
    outstanding: Arc<AtomicUsize>,
    acquired: Arc<AtomicU64>,
}

impl SurfaceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a surface for the duration of one decode
    #[must_use]
    pub fn acquire(&self) -> DecodeSurface {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        DecodeSurface {
            tracker: self.clone(),
        }
    }

    /// Surfaces currently leased
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Surfaces leased since creation
    #[must_use]
    pub fn total_acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }
}

/// Lease on a decode surface, returned on drop
#[derive(Debug)]
pub struct DecodeSurface {
    tracker: SurfaceTracker,
}

impl Drop for DecodeSurface {
    fn drop(&mut self) {
        self.tracker.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Trait for image decoders
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    /// Decode raw bytes into pixels
    ///
    /// # Errors
    /// - Unsupported encodings, truncated or corrupt data (`PipelineError::Decode`)
    async fn decode(&self, raw: RawImageBytes) -> Result<DecodedImage>;
}

/// Decoder for common raster formats (PNG, JPEG, GIF, BMP, WebP)
#[derive(Debug, Clone)]
pub struct RasterDecoder {
    max_dimension: u32,
    surfaces: SurfaceTracker,
}

impl RasterDecoder {
    #[must_use]
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            surfaces: SurfaceTracker::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_image_dimension)
    }

    /// Use a shared surface tracker
    #[must_use]
    pub fn with_surfaces(mut self, surfaces: SurfaceTracker) -> Self {
        self.surfaces = surfaces;
        self
    }

    #[must_use]
    pub fn surfaces(&self) -> &SurfaceTracker {
        &self.surfaces
    }

    /// Synchronous decode with format sniffing and size limits
    ///
    /// # Errors
    /// - Empty input, unknown format, corrupt data, or dimensions over the limit
    pub fn decode_bytes(data: &[u8], max_dimension: u32) -> Result<DecodedImage> {
        if data.is_empty() {
            return Err(PipelineError::decode("No image data"));
        }

        let mut reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| PipelineError::decode(format!("Failed to sniff image format: {}", e)))?;
        let format = reader.format().ok_or_else(|| {
            PipelineError::decode(format!(
                "Unrecognized image format ({} bytes)",
                data.len()
            ))
        })?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(max_dimension);
        limits.max_image_height = Some(max_dimension);
        limits.max_alloc = Some(u64::from(max_dimension) * u64::from(max_dimension) * 8);
        reader.limits(limits);

        let image = reader
            .decode()
            .map_err(|e| PipelineError::decode(format!("Failed to decode {:?}: {}", format, e)))?;

        Ok(DecodedImage::new(image, format))
    }
}

impl Default for RasterDecoder {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[async_trait]
impl ImageDecoder for RasterDecoder {
    async fn decode(&self, raw: RawImageBytes) -> Result<DecodedImage> {
        let surfaces = self.surfaces.clone();
        let max_dimension = self.max_dimension;

        tokio::task::spawn_blocking(move || {
            let _surface = surfaces.acquire();
            Self::decode_bytes(&raw.data, max_dimension)
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                PipelineError::decode("Decoder panicked")
            } else {
                PipelineError::decode("Decode task was cancelled")
            }
        })?
    }
}
