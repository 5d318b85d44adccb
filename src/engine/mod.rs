//! Background-removal engine abstraction
//!
//! The engine is an external collaborator: the pipeline hands it a decoded
//! image and receives encoded bytes with the background made transparent.
//! - [`SegmentationEngine`] adapts any mask-producing [`SegmentationModel`]
//! - [`OnnxSegmentationModel`] runs a segmentation model with ONNX Runtime

use crate::decode::DecodedImage;
use crate::error::Result;
use async_trait::async_trait;

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod segmentation;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxSegmentationModel;
pub use self::segmentation::{PreprocessingConfig, SegmentationEngine, SegmentationModel};

/// Encoded output of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    /// Encoded image bytes
    pub data: Vec<u8>,
    /// MIME type of `data`
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Trait for background-removal engines
///
/// Implementations may be slow, but must not block the calling task: CPU-bound
/// work belongs on a blocking thread.
#[async_trait]
pub trait BackgroundRemovalEngine: Send + Sync {
    /// Produce an image with background pixels made transparent
    ///
    /// # Errors
    /// - Any engine-side failure, reported as `PipelineError::Inference`
    async fn remove_background(&self, image: DecodedImage) -> Result<ProcessedImage>;

    /// Short engine name for logs
    fn name(&self) -> &str {
        "engine"
    }
}
