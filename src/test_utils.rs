//! Test utilities and mock collaborators
//!
//! Mock implementations of the fetcher, engine, segmentation model and
//! progress reporter, so pipeline behavior can be exercised without network
//! access or model files. Mocks record their calls for verification.

use crate::decode::{DecodedImage, ImageDecoder, RawImageBytes, SurfaceTracker};
use crate::engine::{
    BackgroundRemovalEngine, PreprocessingConfig, ProcessedImage, SegmentationModel,
};
use crate::error::{ErrorKind, PipelineError, Result};
use crate::fetch::ResourceFetcher;
use crate::pipeline::PipelineState;
use crate::progress::{PipelineStage, ProgressReporter};
use crate::source::SourceReference;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use ndarray::Array4;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Solid-color RGBA image
#[must_use]
pub fn solid_image(width: u32, height: u32, color: [u8; 4]) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(color)))
}

/// Encode a small gradient test image in the given format
///
/// # Panics
/// - If the format has no encoder enabled
#[must_use]
pub fn encode_test_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
            255,
        ])
    });
    let image = match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8()),
        _ => DynamicImage::ImageRgba8(image),
    };
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .unwrap_or_else(|e| panic!("failed to encode {:?} test image: {}", format, e));
    buffer.into_inner()
}

/// Fetcher serving canned responses from memory
///
/// Unknown sources answer with an HTTP 404 fetch error.
#[derive(Debug, Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    delay: Option<Duration>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` for `source`
    #[must_use]
    pub fn with_response<S: Into<String>>(self, source: S, data: Vec<u8>) -> Self {
        lock(&self.responses).insert(source.into(), data);
        self
    }

    /// Serve an encoded PNG of the given size for `source`
    #[must_use]
    pub fn with_png<S: Into<String>>(self, source: S, width: u32, height: u32) -> Self {
        self.with_response(source, encode_test_image(width, height, ImageFormat::Png))
    }

    /// Sleep before answering each fetch
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sources fetched so far, in call order
    pub fn get_call_history(&self) -> Vec<String> {
        lock(&self.call_history).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.call_history).len()
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch(&self, source: &SourceReference) -> Result<RawImageBytes> {
        lock(&self.call_history).push(source.as_str().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let data = lock(&self.responses).get(source.as_str()).cloned();
        data.map(RawImageBytes::new)
            .ok_or_else(|| PipelineError::http_status(404, source.as_str()))
    }
}

/// Decoder that panics mid-decode while holding a decode surface
#[derive(Debug, Clone, Default)]
pub struct PanickingDecoder {
    surfaces: SurfaceTracker,
}

impl PanickingDecoder {
    #[must_use]
    pub fn new(surfaces: SurfaceTracker) -> Self {
        Self { surfaces }
    }
}

#[async_trait]
impl ImageDecoder for PanickingDecoder {
    async fn decode(&self, _raw: RawImageBytes) -> Result<DecodedImage> {
        let surfaces = self.surfaces.clone();
        tokio::task::spawn_blocking(move || -> Result<DecodedImage> {
            let _surface = surfaces.acquire();
            panic!("mock decoder panic");
        })
        .await
        .map_err(|_| PipelineError::decode("Decoder panicked"))?
    }
}

/// Behavior of a [`MockEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEngineMode {
    /// Re-encode the input as PNG
    Passthrough,
    /// Fail every call with an inference error
    Fail,
}

/// Background-removal engine with scripted behavior
///
/// A gated engine blocks every call until [`MockEngine::open_gate`] adds
/// permits, which lets tests hold invocations in flight deterministically.
#[derive(Debug, Clone)]
pub struct MockEngine {
    mode: MockEngineMode,
    gate: Option<Arc<Semaphore>>,
    calls: Arc<AtomicUsize>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: MockEngineMode::Passthrough,
            gate: None,
            calls: Arc::new(AtomicUsize::new(0)),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Engine whose every call fails
    #[must_use]
    pub fn new_failing() -> Self {
        Self {
            mode: MockEngineMode::Fail,
            ..Self::new()
        }
    }

    /// Engine that waits for a permit before answering each call
    #[must_use]
    pub fn new_gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    /// Let `calls` pending or future invocations complete
    pub fn open_gate(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Number of calls that entered the engine
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn get_call_history(&self) -> Vec<String> {
        lock(&self.call_history).clone()
    }

    /// Wait until at least `count` calls have entered the engine
    pub async fn wait_for_calls(&self, count: usize) {
        while self.call_count() < count {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackgroundRemovalEngine for MockEngine {
    async fn remove_background(&self, image: DecodedImage) -> Result<ProcessedImage> {
        let (width, height) = image.dimensions();
        lock(&self.call_history).push(format!("remove_background {}x{}", width, height));
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| PipelineError::inference("Mock engine gate closed"))?;
            permit.forget();
        }

        match self.mode {
            MockEngineMode::Fail => Err(PipelineError::inference("Mock inference failure")),
            MockEngineMode::Passthrough => {
                let mut buffer = Cursor::new(Vec::new());
                DynamicImage::ImageRgba8(image.image().to_rgba8())
                    .write_to(&mut buffer, ImageFormat::Png)
                    .map_err(|e| PipelineError::inference(e.to_string()))?;
                Ok(ProcessedImage {
                    data: buffer.into_inner(),
                    mime_type: "image/png".to_string(),
                    width,
                    height,
                })
            },
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Segmentation model marking a centered square as foreground
#[derive(Debug, Clone)]
pub struct CenterSquareModel {
    target_size: u32,
    should_fail: bool,
}

impl CenterSquareModel {
    #[must_use]
    pub fn new(target_size: u32) -> Self {
        Self {
            target_size,
            should_fail: false,
        }
    }

    #[must_use]
    pub fn failing(target_size: u32) -> Self {
        Self {
            target_size,
            should_fail: true,
        }
    }
}

impl SegmentationModel for CenterSquareModel {
    fn preprocessing(&self) -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: self.target_size,
            ..PreprocessingConfig::default()
        }
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if self.should_fail {
            return Err(PipelineError::inference("Mock model failure"));
        }
        let size = input.shape().get(2).copied().unwrap_or(0);
        let (low, high) = (size / 4, size - size / 4);
        Ok(Array4::from_shape_fn((1, 1, size, size), |(_, _, y, x)| {
            if (low..high).contains(&y) && (low..high).contains(&x) {
                1.0
            } else {
                0.0
            }
        }))
    }

    fn name(&self) -> &str {
        "center-square"
    }
}

/// A notification captured by [`RecordingReporter`]
#[derive(Debug, Clone, PartialEq)]
pub enum ReportedEvent {
    Stage(SourceReference, PipelineStage),
    State(PipelineState),
    Error(SourceReference, PipelineStage, ErrorKind),
}

/// Progress reporter that records every notification
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ReportedEvent>>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReportedEvent> {
        lock(&self.events).clone()
    }

    /// Recorded `is_processing` values, in order
    pub fn processing_transitions(&self) -> Vec<bool> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ReportedEvent::State(state) => Some(state.is_processing),
                _ => None,
            })
            .collect()
    }

    /// Recorded errors
    pub fn errors(&self) -> Vec<(SourceReference, PipelineStage, ErrorKind)> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ReportedEvent::Error(source, stage, kind) => {
                    Some((source.clone(), *stage, *kind))
                },
                _ => None,
            })
            .collect()
    }

    /// Recorded stages for one source
    pub fn stages_for(&self, source: &SourceReference) -> Vec<PipelineStage> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ReportedEvent::Stage(s, stage) if s == source => Some(*stage),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report_stage(&self, source: &SourceReference, stage: PipelineStage) {
        lock(&self.events).push(ReportedEvent::Stage(source.clone(), stage));
    }

    fn report_state(&self, state: &PipelineState) {
        lock(&self.events).push(ReportedEvent::State(state.clone()));
    }

    fn report_error(&self, source: &SourceReference, stage: PipelineStage, error: &PipelineError) {
        lock(&self.events).push(ReportedEvent::Error(source.clone(), stage, error.kind()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_fetcher_records_and_404s() {
        let fetcher = MockFetcher::new().with_png("logo.png", 4, 4);
        assert!(fetcher.fetch(&"logo.png".into()).await.is_ok());

        let err = fetcher.fetch(&"missing.png".into()).await.unwrap_err();
        assert!(err.to_string().contains("404"));
        assert_eq!(fetcher.get_call_history(), vec!["logo.png", "missing.png"]);
    }

    #[tokio::test]
    async fn test_gated_engine_waits_for_permit() {
        let engine = MockEngine::new_gated();
        let image = DecodedImage::new(solid_image(2, 2, [1, 2, 3, 255]), ImageFormat::Png);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.remove_background(image).await })
        };
        engine.wait_for_calls(1).await;
        assert!(!task.is_finished());

        engine.open_gate(1);
        let processed = task.await.unwrap().unwrap();
        assert_eq!((processed.width, processed.height), (2, 2));
    }
}
