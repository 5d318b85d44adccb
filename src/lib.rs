#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Storefront Logo Background Removal
//!
//! The image pipeline behind storefront logos: a source image reference goes
//! in, a displayable image reference comes out. Between the two, the source is
//! fetched, decoded, handed to a background-removal engine, and the result is
//! published as a transient `blob://` locator.
//!
//! Any failure along the way is a graceful degradation, never an error for
//! the viewer: the original source is displayed instead.
//!
//! ## Components
//!
//! - [`fetch`]: retrieves source bytes (`http`, `https`, `file`, `data`)
//! - [`decode`]: turns bytes into a pixel-addressable image
//! - [`engine`]: the background-removal collaborator, with an ONNX-backed
//!   segmentation engine
//! - [`publish`]: the reference-counted resource table of processed images
//! - [`pipeline`]: stage orchestration and the per-consumer controller
//! - [`adapter`]: the presentation component that binds sources to images
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storefront_bgremove::{
//!     LogoView, OnnxSegmentationModel, OutputFormat, Pipeline, PreprocessingConfig,
//!     SegmentationEngine, SourceReference,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let model = OnnxSegmentationModel::from_file(
//!     "models/isnet-general.onnx",
//!     PreprocessingConfig::default(),
//!     0,
//! )?;
//! let engine = Arc::new(SegmentationEngine::new(model, OutputFormat::Png));
//! let pipeline = Pipeline::builder(engine).build()?;
//!
//! let view = LogoView::with_pipeline(pipeline, "Acme Pizza");
//! view.bind(SourceReference::new("https://cdn.example/logo.png"));
//! view.settled().await;
//! println!("{}", view.render().to_html());
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime segmentation model
//! - `cli` (default): `storefront-bgremove` command-line tool and tracing setup
//! - `webp-support` (default): WebP decoding and encoding
//! - `test-utils`: mock fetchers, engines and reporters for downstream tests

pub mod adapter;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod decode;
pub mod dedupe;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod progress;
pub mod publish;
pub mod source;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
#[cfg(feature = "cli")]
pub mod tracing_config;

pub use adapter::{LogoView, RenderedImage, PROCESSING_CLASS};
pub use config::{OutputFormat, PipelineConfig, PipelineConfigBuilder};
pub use decode::{DecodedImage, ImageDecoder, RasterDecoder, RawImageBytes, SurfaceTracker};
pub use dedupe::{InflightRegistry, RegistryStats};
#[cfg(feature = "onnx")]
pub use engine::OnnxSegmentationModel;
pub use engine::{
    BackgroundRemovalEngine, PreprocessingConfig, ProcessedImage, SegmentationEngine,
    SegmentationModel,
};
pub use error::{ErrorKind, PipelineError, Result};
pub use fetch::{HttpFetcher, ResourceFetcher};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineController, PipelinePhase, PipelineState, ProcessOutcome,
};
pub use progress::{LogProgressReporter, NoOpProgressReporter, PipelineStage, ProgressReporter};
pub use publish::{
    PublishedHandle, PublishedReference, PublishedResource, ResourceTable, ResourceTableStats,
};
pub use source::{DisplayReference, SourceReference};
#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat};
