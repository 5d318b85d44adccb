//! ONNX Runtime segmentation model

use super::segmentation::{PreprocessingConfig, SegmentationModel};
use crate::error::{PipelineError, Result};
use instant::Instant;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::Path;

/// Segmentation model executed on the CPU by ONNX Runtime
pub struct OnnxSegmentationModel {
    session: Session,
    preprocessing: PreprocessingConfig,
    name: String,
}

impl std::fmt::Debug for OnnxSegmentationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSegmentationModel")
            .field("name", &self.name)
            .field("preprocessing", &self.preprocessing)
            .finish_non_exhaustive()
    }
}

impl OnnxSegmentationModel {
    /// Load a model from an `.onnx` file
    ///
    /// `intra_threads` of 0 lets ONNX Runtime pick.
    ///
    /// # Errors
    /// - Unreadable file or invalid model
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        preprocessing: PreprocessingConfig,
        intra_threads: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let model_data = std::fs::read(path).map_err(|e| {
            PipelineError::inference(format!("Failed to read model {}: {}", path.display(), e))
        })?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("onnx")
            .to_string();
        Self::from_memory(&model_data, preprocessing, intra_threads, name)
    }

    /// Load a model from bytes already in memory
    ///
    /// # Errors
    /// - Invalid model data or session configuration failures
    pub fn from_memory(
        model_data: &[u8],
        preprocessing: PreprocessingConfig,
        intra_threads: usize,
        name: String,
    ) -> Result<Self> {
        let start = Instant::now();
        let mut builder = Session::builder()
            .map_err(|e| {
                PipelineError::inference(format!("Failed to create session builder: {e}"))
            })?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                PipelineError::inference(format!("Failed to set optimization level: {e}"))
            })?;

        if intra_threads > 0 {
            builder = builder.with_intra_threads(intra_threads).map_err(|e| {
                PipelineError::inference(format!("Failed to set intra threads: {e}"))
            })?;
        }

        let session = builder.commit_from_memory(model_data).map_err(|e| {
            PipelineError::inference(format!("Failed to create session from model data: {e}"))
        })?;

        log::debug!(
            "Loaded ONNX model '{}' in {:.2}ms",
            name,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Self {
            session,
            preprocessing,
            name,
        })
    }
}

impl SegmentationModel for OnnxSegmentationModel {
    fn preprocessing(&self) -> PreprocessingConfig {
        self.preprocessing.clone()
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let input_value = Value::from_array(input.clone()).map_err(|e| {
            PipelineError::inference(format!("Failed to convert input tensor: {e}"))
        })?;

        let start = Instant::now();
        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|e| PipelineError::inference(format!("ONNX inference failed: {e}")))?;
        log::debug!(
            "ONNX inference: {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        // First output is the finest-resolution mask
        let first_key = outputs
            .keys()
            .next()
            .ok_or_else(|| PipelineError::inference("No output tensors found"))?
            .to_string();
        let output_tensor = outputs
            .get(first_key.as_str())
            .ok_or_else(|| PipelineError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| {
                PipelineError::inference(format!("Failed to extract output tensor: {e}"))
            })?;

        let shape = output_tensor.shape().to_vec();
        if shape.len() != 4 {
            return Err(PipelineError::inference(format!(
                "Expected 4D output tensor, got {}D",
                shape.len()
            )));
        }
        let data = output_tensor.view().to_owned();

        Array4::from_shape_vec(
            (
                shape.first().copied().unwrap_or(1),
                shape.get(1).copied().unwrap_or(1),
                shape.get(2).copied().unwrap_or(1),
                shape.get(3).copied().unwrap_or(1),
            ),
            data.into_raw_vec_and_offset().0,
        )
        .map_err(|e| PipelineError::inference(format!("Failed to reshape output tensor: {e}")))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
